//! TCP Connector
//!
//! Opens raw TCP connections for socket-protocol backends (relational
//! store, cache store). Wire protocol handling stays with the caller.

use crate::domain::ports::{Connection, Connector};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// A pooled TCP connection.
pub struct TcpConnection {
    stream: TcpStream,
    addr: String,
}

impl TcpConnection {
    /// The underlying TCP stream.
    pub fn stream(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Backend address.
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn is_alive(&self) -> bool {
        let mut buf = [0u8; 1];
        // Ready(Ok(0)) is EOF: the peer closed. Pending means nothing to read.
        match self.stream.peek(&mut buf).now_or_never() {
            None => true,
            Some(Ok(0)) => false,
            Some(Ok(_)) => true,
            Some(Err(_)) => false,
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Connector for TCP backends.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }

    async fn open(&self) -> Result<TcpStream, String> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(format!("connection failed: {}", e)),
            Err(_) => Err("connection timeout".to_string()),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn target(&self) -> String {
        self.addr.clone()
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, String> {
        let stream = self.open().await?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(TcpConnection {
            stream,
            addr: self.addr.clone(),
        }))
    }

    async fn probe(&self) -> Result<(), String> {
        let mut stream = self.open().await?;
        let _ = stream.shutdown().await;
        Ok(())
    }
}
