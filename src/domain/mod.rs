//! Domain Layer
//!
//! Value objects and the outbound ports the governance services depend on.

pub mod ports;
pub mod value_objects;

pub use value_objects::{EvictionStrategy, HandleState, PoolKind};
