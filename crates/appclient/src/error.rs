use appwire::FailureReason;

#[derive(Debug, Clone)]
pub enum Error {
    /// Encoding, decoding or framing failed.
    Wire(appwire::Error),
    /// The host answered with a failure.
    Remote(FailureReason),
    /// The control channel is gone; no reply will arrive.
    ChannelClosed,
    /// A required environment variable is not set.
    MissingEnv(&'static str),
    /// The control socket could not be reached.
    Connect(String),
    /// The host answered a call with a response of the wrong kind.
    UnexpectedResponse(&'static str),
    /// The operation is not supported on application connections.
    MethodNotImplemented,
    /// The connection or listener has been closed locally.
    Closed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wire(e) => write!(f, "wire error: {}", e),
            Self::Remote(reason) => write!(f, "remote failure: {}", reason),
            Self::ChannelClosed => write!(f, "control channel closed"),
            Self::MissingEnv(var) => write!(f, "environment variable {} is not set", var),
            Self::Connect(msg) => write!(f, "failed to connect to host: {}", msg),
            Self::UnexpectedResponse(method) => write!(f, "unexpected response to {}", method),
            Self::MethodNotImplemented => write!(f, "method not implemented"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<appwire::Error> for Error {
    fn from(e: appwire::Error) -> Self {
        Self::Wire(e)
    }
}

impl From<FailureReason> for Error {
    fn from(reason: FailureReason) -> Self {
        Self::Remote(reason)
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        use std::io::ErrorKind;
        let kind = match &e {
            Error::Closed | Error::Remote(FailureReason::NoSuchConnection) => ErrorKind::NotConnected,
            Error::ChannelClosed => ErrorKind::BrokenPipe,
            Error::MethodNotImplemented => ErrorKind::Unsupported,
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
