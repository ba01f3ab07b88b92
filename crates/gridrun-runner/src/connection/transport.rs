//! Physical transport to the coordination service.
//!
//! A `Transport` knows only how to establish one duplex byte stream; framing,
//! authentication and lifecycle live in the connection manager.

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// A bidirectional byte stream usable as a connection channel.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

/// Something that can dial the coordination service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a fresh byte stream. Errors are transport-level and
    /// retryable.
    async fn connect(&self) -> io::Result<Box<dyn Duplex>>;
}

/// TCP transport to a `host:port` endpoint.
pub struct TcpTransport {
    endpoint: String,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(endpoint: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> io::Result<Box<dyn Duplex>> {
        debug!(endpoint = %self.endpoint, "Dialing coordination service");
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.endpoint))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// In-memory transport handing out pre-arranged duplex streams. Each call to
/// `connect` consumes the next stream pushed by the test harness; an empty
/// feed means connection refused.
#[cfg(test)]
pub mod memory {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio::sync::{mpsc, Mutex};

    pub struct MemoryTransport {
        feed: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    }

    impl MemoryTransport {
        pub fn new() -> (Self, mpsc::UnboundedSender<DuplexStream>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Self {
                    feed: Mutex::new(rx),
                },
                tx,
            )
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn connect(&self) -> io::Result<Box<dyn Duplex>> {
            match self.feed.lock().await.recv().await {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "no stream available",
                )),
            }
        }
    }
}
