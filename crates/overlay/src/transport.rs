//! # Transport Abstraction
//!
//! The minimal capability set consumed from the underlying overlay transport.
//!
//! ## Philosophy
//!
//! - **Opaque**: Key exchange, relays, discovery and framing live behind this
//!   trait. The network layer only dials, listens, bootstraps and closes.
//! - **Stringly Addressed**: Raw streams report their endpoints as text
//!   (`<pk>:<port>` or `<pk>:~`). Interpreting that text is the network
//!   layer's job, see [`crate::addr::disassemble_addr`].

use std::fmt;

use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;

use crate::cipher::PubKey;

/// Errors that occur at the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Nothing is listening on the remote endpoint, or it refused us.
    ConnectionRefused(String),
    /// The local port is already bound by another listener.
    PortInUse(u16),
    /// Bootstrap could not reach enough servers.
    Bootstrap(String),
    /// The client or listener has been closed.
    Closed,
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionRefused(msg) => write!(f, "Connection refused: {}", msg),
            Self::PortInUse(port) => write!(f, "Port already in use: {}", port),
            Self::Bootstrap(msg) => write!(f, "Bootstrap failed: {}", msg),
            Self::Closed => write!(f, "Transport closed"),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A bidirectional byte stream produced by the transport.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Local endpoint in overlay text form.
    fn local_addr(&self) -> String;
    /// Remote endpoint in overlay text form.
    fn remote_addr(&self) -> String;
}

/// An acceptor of inbound raw streams on one local port.
#[async_trait::async_trait]
pub trait RawListener: Send + Sync + 'static {
    /// Waits for the next inbound stream.
    ///
    /// # invariants
    /// - Must return `Err(TransportError::Closed)` once the listener is closed.
    async fn accept(&self) -> Result<Box<dyn RawStream>>;

    /// Local endpoint in overlay text form.
    fn addr(&self) -> String;

    /// Unbinds the port. Pending and future `accept` calls fail.
    async fn close(&self) -> Result<()>;
}

/// A client of the overlay transport.
///
/// This trait is designed to be object-safe (`Box<dyn OverlayClient>`).
#[async_trait::async_trait]
pub trait OverlayClient: Send + Sync + 'static {
    /// Connects to discovery-provided servers until at least `min_servers`
    /// are reachable. Blocks until then.
    async fn initiate_server_connections(&self, min_servers: usize) -> Result<()>;

    /// Opens a stream to `pk:port`.
    async fn dial(&self, pk: PubKey, port: u16) -> Result<Box<dyn RawStream>>;

    /// Binds a local port for inbound streams.
    async fn listen(&self, port: u16) -> Result<Box<dyn RawListener>>;

    /// Tears the client down. Returns once teardown has completed.
    async fn close(&self) -> Result<()>;
}
