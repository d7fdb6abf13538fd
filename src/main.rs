//! resource-governor - status server binary
//!
//! Composition root: loads configuration, builds the governor and serves
//! the status API until Ctrl+C/SIGTERM.

use resource_governor::adapters::inbound::ApiServer;
use resource_governor::infrastructure::shutdown_signal;
use resource_governor::{load_config, ResourceGovernor};
use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        "starting resource-governor api={} pools={}",
        cfg.api_listen_addr,
        cfg.pools.len()
    );

    // Services, pools and background tasks
    let governor = Arc::new(ResourceGovernor::init(&cfg).await?);

    // Status API until a shutdown signal arrives
    let server = ApiServer::new(cfg.api_listen_addr.clone(), governor.clone());
    let signal = shutdown_signal(governor.shutdown_controller().clone());
    let served = server.run(signal).await;

    // Stop tasks and drain pools even if the server failed
    governor.shutdown().await?;
    served
}
