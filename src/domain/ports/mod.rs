mod connector;
mod key_value_backend;

pub use connector::{Connection, Connector};
pub use key_value_backend::{BackendError, KeyValueBackend};
