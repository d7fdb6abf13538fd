//! HTTP Connector
//!
//! Hands out slots in the outbound HTTP budget (LLM and third-party APIs).
//! reqwest keeps its own keep-alive pool; the governance pool bounds how
//! many requests may be in flight at once.

use crate::domain::ports::{Connection, Connector};
use async_trait::async_trait;
use std::any::Any;
use std::time::Duration;

/// A pooled HTTP client slot.
pub struct HttpConnection {
    client: reqwest::Client,
    base_url: String,
}

impl HttpConnection {
    /// Client to issue requests with.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Base URL of the upstream API.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Connection for HttpConnection {
    fn is_alive(&self) -> bool {
        true
    }

    async fn close(&mut self) {}

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Connector for HTTP upstreams.
#[derive(Clone)]
pub struct HttpConnector {
    base_url: String,
    health_path: String,
    client: reqwest::Client,
}

impl HttpConnector {
    /// Create a connector; `timeout` bounds every request made through it.
    pub fn new(
        base_url: impl Into<String>,
        health_path: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("client error: {}", e))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            health_path: health_path.into(),
            client,
        })
    }
}

#[async_trait]
impl Connector for HttpConnector {
    fn target(&self) -> String {
        self.base_url.clone()
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, String> {
        Ok(Box::new(HttpConnection {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
        }))
    }

    async fn probe(&self) -> Result<(), String> {
        let url = format!("{}{}", self.base_url, self.health_path);

        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(format!("unhealthy status: {}", resp.status())),
            Err(e) if e.is_timeout() => Err("request timeout".to_string()),
            Err(e) => Err(format!("request failed: {}", e)),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_connect_yields_client() {
        let connector =
            HttpConnector::new("http://llm.internal/", "/health", Duration::from_secs(1)).unwrap();
        let conn = connector.connect().await.unwrap();
        assert!(conn.is_alive());

        let http = conn.as_any().downcast_ref::<HttpConnection>().unwrap();
        assert_eq!(http.base_url(), "http://llm.internal");
        assert_eq!(connector.target(), "http://llm.internal");
    }

    #[tokio::test]
    async fn test_probe_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .expect(1)
            .mount(&server)
            .await;

        let connector = HttpConnector::new(server.uri(), "/health", Duration::from_secs(1)).unwrap();
        assert!(connector.probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_probe_unhealthy_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let connector = HttpConnector::new(server.uri(), "/health", Duration::from_secs(1)).unwrap();
        let err = connector.probe().await.unwrap_err();
        assert!(err.contains("503"));
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let connector =
            HttpConnector::new(server.uri(), "/health", Duration::from_millis(100)).unwrap();
        let err = connector.probe().await.unwrap_err();
        assert!(err.contains("timeout"));
    }
}
