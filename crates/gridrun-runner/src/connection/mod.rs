//! Connection layer: the single authenticated, heart-beating channel to the
//! coordination service.

pub mod backoff;
pub mod manager;
pub mod observers;
pub mod queue;
pub mod transport;

pub use backoff::Backoff;
pub use manager::{ConnectError, ConnectionConfig, ConnectionHandle, ConnectionManager, Credentials};
pub use observers::{ObserverFn, ObserverRegistry};
pub use queue::OutboundQueue;
pub use transport::{TcpTransport, Transport};
