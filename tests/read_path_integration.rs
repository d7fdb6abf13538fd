//! Integration tests for the governed read path
//!
//! Admission, cache-aside and pooled database access wired together the
//! way a request handler uses them.

use bytes::Bytes;
use resource_governor::adapters::outbound::{LocalStore, TcpConnection};
use resource_governor::config::{Config, PoolSettings};
use resource_governor::{
    CacheConfig, ConnectionPoolManager, GovernorError, PoolConfig, PoolKind, QueryCache,
    RateLimitConfig, RateLimiter, ResourceGovernor,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Line-based fake database: answers `GET <key>` with `value-of-<key>`.
async fn spawn_fake_database() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let queries = Arc::new(AtomicUsize::new(0));

    let counter = queries.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let counter = counter.clone();
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let key = line.trim_start_matches("GET ");
                    let reply = format!("value-of-{}\n", key);
                    if write.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    (addr, queries)
}

fn config(db_addr: String, capacity: u32) -> Config {
    Config {
        api_listen_addr: "127.0.0.1:0".to_string(),
        rate_limit: RateLimitConfig {
            capacity,
            refill_rate: 0.01,
            ..RateLimitConfig::default()
        },
        pools: vec![PoolSettings {
            kind: PoolKind::Database,
            addr: db_addr,
            config: PoolConfig {
                min_connections: 1,
                max_connections: 3,
                acquire_timeout: Duration::from_secs(2),
                drain_grace_period: Duration::from_millis(500),
                ..PoolConfig::default()
            },
        }],
        ..Config::default()
    }
}

/// Run one query over a pooled TCP handle.
async fn query(conn: &mut TcpConnection, key: &str) -> std::io::Result<Bytes> {
    let stream = conn.stream();
    stream.write_all(format!("GET {}\n", key).as_bytes()).await?;

    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line).await?;
    Ok(Bytes::from(line.trim_end().to_string()))
}

#[tokio::test]
async fn test_miss_queries_database_then_hit_serves_cache() {
    let (addr, queries) = spawn_fake_database().await;
    let governor = ResourceGovernor::init(&config(addr, 100)).await.unwrap();

    for _ in 0..3 {
        let value = governor
            .guarded_fetch("tenant-1", "user:42", None, |mut handle| async move {
                let conn = handle
                    .downcast_mut::<TcpConnection>()
                    .ok_or("not a tcp connection")?;
                query(conn, "user:42").await.map_err(|e| e.to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, Bytes::from_static(b"value-of-user:42"));
    }

    assert_eq!(queries.load(Ordering::SeqCst), 1);

    let status = governor.status().await;
    assert_eq!(status.cache.hits, 2);
    assert_eq!(status.cache.misses, 1);
    assert_eq!(status.pools["database"].stats.active, 0);

    governor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_misses_share_one_query() {
    let (addr, queries) = spawn_fake_database().await;
    let governor = Arc::new(ResourceGovernor::init(&config(addr, 100)).await.unwrap());

    let fetches = (0..16).map(|i| {
        let governor = governor.clone();
        async move {
            let client = format!("client-{}", i);
            governor
                .guarded_fetch(&client, "report:7", None, |mut handle| async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let conn = handle
                        .downcast_mut::<TcpConnection>()
                        .ok_or("not a tcp connection")?;
                    query(conn, "report:7").await.map_err(|e| e.to_string())
                })
                .await
        }
    });

    let results = futures::future::join_all(fetches).await;
    for result in results {
        assert_eq!(result.unwrap(), Bytes::from_static(b"value-of-report:7"));
    }
    assert_eq!(queries.load(Ordering::SeqCst), 1);

    let stats = governor.pools().stats(PoolKind::Database).unwrap();
    assert!(stats.peak_active <= 3);
    assert_eq!(stats.active, 0);

    governor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rejected_client_never_reaches_database() {
    let (addr, queries) = spawn_fake_database().await;
    let governor = ResourceGovernor::init(&config(addr, 1)).await.unwrap();

    governor
        .guarded_fetch("burst", "a", None, |_| async { Ok::<_, String>(Bytes::from_static(b"1")) })
        .await
        .unwrap();

    let err = governor
        .guarded_fetch("burst", "b", None, |mut handle| async move {
            let conn = handle.downcast_mut::<TcpConnection>().ok_or("not tcp")?;
            query(conn, "b").await.map_err(|e| e.to_string())
        })
        .await
        .unwrap_err();

    match err {
        GovernorError::RateLimited(decision) => {
            assert!(!decision.allowed);
            assert!(decision.retry_after_secs() >= 1);
        }
        other => panic!("expected rate limit, got {:?}", other),
    }
    assert_eq!(queries.load(Ordering::SeqCst), 0);

    governor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_instances_share_limits_and_cache_through_backend() {
    let store = Arc::new(LocalStore::new());
    let build = || {
        let limiter = RateLimiter::with_backend(
            RateLimitConfig {
                capacity: 3,
                refill_rate: 0.01,
                ..RateLimitConfig::default()
            },
            store.clone(),
        );
        let cache = QueryCache::with_backend(CacheConfig::default(), store.clone());
        ResourceGovernor::new(
            Arc::new(limiter),
            Arc::new(ConnectionPoolManager::default()),
            Arc::new(cache),
        )
    };
    let first = build();
    let second = build();

    assert!(first.admit("shared-client").await.is_ok());
    assert!(first.admit("shared-client").await.is_ok());
    assert!(second.admit("shared-client").await.is_ok());
    assert!(matches!(
        second.admit("shared-client").await,
        Err(GovernorError::RateLimited(_))
    ));
    assert!(first.admit("shared-client").await.is_err());

    first
        .cache()
        .set("config:flags", "on", None, &[])
        .await
        .unwrap();
    assert_eq!(
        second.cache().get("config:flags").await,
        Some(Bytes::from_static(b"on"))
    );

    first.cache().delete("config:flags").await;
    second.cache().clear();
    assert_eq!(second.cache().get("config:flags").await, None);
}
