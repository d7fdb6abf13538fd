//! HTTP Key/Value Store
//!
//! Implements KeyValueBackend against a shared key/value service over HTTP:
//!
//! - `GET    {base}/kv/{key}` → 200 with raw body, 404 when absent
//! - `PUT    {base}/kv/{key}` → raw body, optional `x-ttl-ms` header
//! - `DELETE {base}/kv/{key}` → 200/204 when removed, 404 when absent
//! - `GET    {base}/health`   → 2xx when the store is up

use crate::domain::ports::{BackendError, KeyValueBackend};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{StatusCode, Url};
use std::time::Duration;

/// Header carrying the TTL of a PUT, in milliseconds.
pub const TTL_HEADER: &str = "x-ttl-ms";

/// Remote key/value store reached over HTTP.
#[derive(Clone)]
pub struct HttpStore {
    base: Url,
    client: reqwest::Client,
}

impl HttpStore {
    /// Create a store for `base_url`. Every request is bounded by `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let base = Url::parse(base_url)
            .map_err(|e| BackendError::Unavailable(format!("invalid store url {}: {}", base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(BackendError::Unavailable(format!("invalid store url {}", base_url)));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Unavailable(format!("client error: {}", e)))?;

        Ok(Self { base, client })
    }

    /// Base URL this store talks to.
    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    fn url(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::Unavailable("store url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn map_err(e: reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout
        } else {
            BackendError::Unavailable(e.to_string())
        }
    }

    fn unexpected(status: StatusCode) -> BackendError {
        BackendError::Unavailable(format!("unexpected status: {}", status))
    }
}

#[async_trait]
impl KeyValueBackend for HttpStore {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError> {
        let resp = self
            .client
            .get(self.url(&["kv", key])?)
            .send()
            .await
            .map_err(Self::map_err)?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let body = resp
                    .bytes()
                    .await
                    .map_err(|e| BackendError::Corrupt(e.to_string()))?;
                Ok(Some(body))
            }
            s => Err(Self::unexpected(s)),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), BackendError> {
        let mut req = self.client.put(self.url(&["kv", key])?).body(value);
        if let Some(ttl) = ttl {
            req = req.header(TTL_HEADER, ttl.as_millis().to_string());
        }

        let resp = req.send().await.map_err(Self::map_err)?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::unexpected(resp.status()))
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let resp = self
            .client
            .delete(self.url(&["kv", key])?)
            .send()
            .await
            .map_err(Self::map_err)?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(Self::unexpected(s)),
        }
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let resp = self
            .client
            .get(self.url(&["health"])?)
            .send()
            .await
            .map_err(Self::map_err)?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::unexpected(resp.status()))
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn store_for(server: &MockServer) -> HttpStore {
        HttpStore::new(&server.uri(), Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_invalid_url() {
        assert!(HttpStore::new("not a url", Duration::from_secs(1)).is_err());
        assert!(HttpStore::new("mailto:ops@example.com", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_url_building() {
        let store = HttpStore::new("http://kv.internal:7000/", Duration::from_secs(1)).unwrap();
        let url = store.url(&["kv", "cache:user 1"]).unwrap();
        assert_eq!(url.as_str(), "http://kv.internal:7000/kv/cache:user%201");
    }

    #[tokio::test]
    async fn test_get_hit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/kv/greeting"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        assert_eq!(
            store.get("greeting").await.unwrap(),
            Some(Bytes::from_static(b"hello"))
        );
    }

    #[tokio::test]
    async fn test_get_miss() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/kv/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        assert!(matches!(
            store.get("k").await,
            Err(BackendError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_set_with_ttl_header() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/kv/k"))
            .and(header(TTL_HEADER, "5000"))
            .and(body_bytes(b"value".to_vec()))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        store
            .set("k", Bytes::from_static(b"value"), Some(Duration::from_secs(5)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/kv/present"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/kv/absent"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        assert!(store.delete("present").await.unwrap());
        assert!(!store.delete("absent").await.unwrap());
    }

    #[tokio::test]
    async fn test_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let store = HttpStore::new(&server.uri(), Duration::from_millis(100)).unwrap();
        assert_eq!(store.get("slow").await, Err(BackendError::Timeout));
    }

    #[tokio::test]
    async fn test_ping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        assert!(store.ping().await.is_ok());
        assert_eq!(store.name(), "http");
    }

    #[tokio::test]
    async fn test_unreachable() {
        let store = HttpStore::new("http://127.0.0.1:1", Duration::from_millis(200)).unwrap();
        assert!(store.get("k").await.is_err());
    }
}
