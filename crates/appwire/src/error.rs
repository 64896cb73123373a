//! # Error Definitions
//!
//! Wire-level failures (`Error`) and remote operation failures
//! (`FailureReason`).

use overlay::AddrError;

/// Failures encoding, decoding or moving frames.
#[derive(Debug, Clone)]
pub enum Error {
    /// The value stream was malformed or could not be built.
    NeoPack(neopack::Error),
    /// A map lacked a field the frame requires.
    MissingField(&'static str),
    /// Unknown frame kind, method, response or reason name.
    UnknownVariant(String),
    /// An address field did not parse.
    InvalidAddr(AddrError),
    /// Bytes left over after a complete frame.
    TrailingBytes(usize),
    /// A frame length prefix exceeds `MAX_FRAME_LEN`.
    FrameTooLarge(usize),
    /// The underlying stream failed.
    Io(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NeoPack(e) => write!(f, "NeoPack error: {}", e),
            Self::MissingField(key) => write!(f, "Missing field: {}", key),
            Self::UnknownVariant(name) => write!(f, "Unknown variant: {}", name),
            Self::InvalidAddr(e) => write!(f, "Invalid address: {}", e),
            Self::TrailingBytes(n) => write!(f, "{} trailing bytes after frame", n),
            Self::FrameTooLarge(n) => write!(f, "Frame too large: {} bytes", n),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<neopack::Error> for Error {
    fn from(e: neopack::Error) -> Self {
        Self::NeoPack(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<AddrError> for Error {
    fn from(e: AddrError) -> Self {
        Self::InvalidAddr(e)
    }
}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reasons for an RPC failure (the "Err" side of a Reply).
///
/// These are distinct from `Error`; these represent the *remote* operation
/// failing, whereas `Error` represents the *channel* failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The connection id is unknown or already closed.
    NoSuchConnection,
    /// The listener id is unknown or already closed.
    NoSuchListener,
    /// The requested network type is not supported.
    UnknownNetwork(String),
    /// The overlay transport failed.
    Transport(String),
    /// The connection's stream failed.
    Io(String),
    /// The connection or listener was closed while the call was in flight.
    Closed,
    /// Every id is in use.
    NoFreeIds,
    /// The call could not be served as sent.
    BadRequest(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSuchConnection => write!(f, "no such connection"),
            Self::NoSuchListener => write!(f, "no such listener"),
            Self::UnknownNetwork(net) => write!(f, "unknown network type: {}", net),
            Self::Transport(msg) => write!(f, "transport failure: {}", msg),
            Self::Io(msg) => write!(f, "I/O failure: {}", msg),
            Self::Closed => write!(f, "closed"),
            Self::NoFreeIds => write!(f, "no free ids"),
            Self::BadRequest(msg) => write!(f, "bad request: {}", msg),
        }
    }
}

impl std::error::Error for FailureReason {}
