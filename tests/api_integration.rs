//! Integration tests for the status API over a real socket

use resource_governor::adapters::inbound::{router, ApiState, CLIENT_ID_HEADER};
use resource_governor::adapters::outbound::TcpConnector;
use resource_governor::{
    CacheConfig, ConnectionPoolManager, PoolConfig, PoolKind, QueryCache, RateLimitConfig,
    RateLimiter, ResourceGovernor,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Serve the API on an ephemeral port, returning its base URL.
async fn spawn_api(governor: Arc<ResourceGovernor>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(ApiState::new(governor));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn governor(capacity: u32) -> Arc<ResourceGovernor> {
    let limiter = RateLimiter::new(RateLimitConfig {
        capacity,
        refill_rate: 0.01,
        ..RateLimitConfig::default()
    });
    Arc::new(ResourceGovernor::new(
        Arc::new(limiter),
        Arc::new(ConnectionPoolManager::default()),
        Arc::new(QueryCache::new(CacheConfig::default())),
    ))
}

#[tokio::test]
async fn test_probes_and_status() {
    let db = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let governor = governor(10);
    governor
        .pools()
        .initialize(
            PoolKind::Database,
            PoolConfig {
                min_connections: 2,
                max_connections: 5,
                ..PoolConfig::default()
            },
            Arc::new(TcpConnector::new(
                db.local_addr().unwrap().to_string(),
                Duration::from_secs(1),
            )),
        )
        .await
        .unwrap();
    let base = spawn_api(governor).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{}/health", base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client.get(format!("{}/ready", base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    let status: serde_json::Value = client
        .get(format!("{}/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["healthy"], true);
    assert_eq!(status["pools"]["database"]["stats"]["idle"], 2);
    assert_eq!(status["pools"]["database"]["stats"]["max_connections"], 5);
    assert!(status["pools"]["database"]["stats"]["avg_wait_ms"].is_number());
    assert_eq!(status["cache"]["strategy"], "lru");
}

#[tokio::test]
async fn test_operator_actions_and_rate_limit_headers() {
    let governor = governor(2);
    governor
        .cache()
        .set("session:1", "x", None, &["sessions"])
        .await
        .unwrap();
    let base = spawn_api(governor.clone()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/v1/cache/invalidate", base))
        .header(CLIENT_ID_HEADER, "ops")
        .json(&serde_json::json!({ "tag": "sessions" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-ratelimit-remaining"], "1");
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["removed"], 1);
    assert!(governor.cache().is_empty());

    let resp = client
        .post(format!("{}/api/v1/pools/database/drain", base))
        .header(CLIENT_ID_HEADER, "ops")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(format!("{}/api/v1/cache/invalidate", base))
        .header(CLIENT_ID_HEADER, "ops")
        .json(&serde_json::json!({ "pattern": ".*" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 429);
    assert!(resp.headers()["retry-after"].to_str().unwrap().parse::<u64>().unwrap() >= 1);
    assert_eq!(resp.headers()["x-ratelimit-remaining"], "0");

    // Requests without a client id share the anonymous bucket.
    let resp = client
        .post(format!("{}/api/v1/cache/invalidate", base))
        .json(&serde_json::json!({ "pattern": ".*" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(governor.limiter().tracked_keys(), 2);
}
