//! Adapters Layer
//!
//! Inbound: the status API. Outbound: key/value stores and connectors.

pub mod inbound;
pub mod outbound;
