mod http_connector;
mod http_store;
mod local_store;
mod tcp_connector;

pub use http_connector::{HttpConnection, HttpConnector};
pub use http_store::{HttpStore, TTL_HEADER};
pub use local_store::LocalStore;
pub use tcp_connector::{TcpConnection, TcpConnector};
