//! Application Layer
//!
//! Composes the governance services into the request-facing use cases.

pub mod governor;

pub use governor::{GovernorError, GovernorStatus, LimiterStatus, PoolStatus, ResourceGovernor};
