//! Connector Port
//!
//! Defines how the pool manager opens and probes backend connections.
//! The pool never knows whether a handle wraps a socket, an HTTP client
//! or something else.

use async_trait::async_trait;
use std::any::Any;

/// A live connection owned by the pool.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Cheap liveness check run on release and before reuse.
    ///
    /// Must not block; return false if the peer has gone away.
    fn is_alive(&self) -> bool;

    /// Close the underlying transport.
    async fn close(&mut self);

    /// Downcast hook so callers can reach the concrete transport.
    fn as_any(&self) -> &dyn Any;

    /// Mutable downcast hook.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Factory for new connections to one backend kind.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Address or URL this connector targets, for logs.
    fn target(&self) -> String;

    /// Open a new connection.
    async fn connect(&self) -> Result<Box<dyn Connection>, String>;

    /// Lightweight liveness round-trip against the backend itself.
    ///
    /// Used by the periodic health check, independently of pooled handles.
    async fn probe(&self) -> Result<(), String>;
}
