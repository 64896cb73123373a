//! # Address Codec
//!
//! Overlay endpoints in text form: `<pk-hex>:<port>`, or `<pk-hex>:~` when the
//! endpoint is bound to a key but not to a specific port.
//!
//! There are two parse paths:
//!
//! - [`Addr::from_str`] for untrusted text (config, RPC payloads). Failures are
//!   ordinary errors.
//! - [`disassemble_addr`] for endpoint strings reported by the transport. The
//!   transport only ever emits the two forms above, so a failure there is a
//!   [`Defect`] in the collaborator rather than bad input.

use std::fmt;
use std::str::FromStr;

use crate::cipher::KeyError;
use crate::cipher::PubKey;

/// Port text meaning "no specific port".
pub const NO_PORT: &str = "~";

/// Address parsing errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrError {
    /// Text did not split into exactly two segments on `:`.
    SegmentCount(usize),
    /// One of the two segments was empty.
    EmptySegment,
    /// The key segment is not a valid public key.
    InvalidKey(KeyError),
    /// The port segment is neither `~` nor a base-10 `u16`.
    InvalidPort(String),
}

impl fmt::Display for AddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentCount(n) => write!(f, "invalid addr: expected 2 segments, got {}", n),
            Self::EmptySegment => write!(f, "invalid addr: empty segment"),
            Self::InvalidKey(e) => write!(f, "invalid addr key: {}", e),
            Self::InvalidPort(p) => write!(f, "invalid addr port: {:?}", p),
        }
    }
}

impl std::error::Error for AddrError {}

/// An overlay endpoint: public key plus optional port.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct Addr {
    pub pk: PubKey,
    /// `None` is the "no port" sentinel.
    pub port: Option<u16>,
}

impl Addr {
    pub fn new(pk: PubKey, port: u16) -> Self {
        Self { pk, port: Some(port) }
    }

    /// An address bound to a key but to no specific port.
    pub fn any_port(pk: PubKey) -> Self {
        Self { pk, port: None }
    }

    /// The numeric port, `0` for the sentinel.
    pub fn port_or_zero(&self) -> u16 {
        self.port.unwrap_or(0)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.pk, port),
            None => write!(f, "{}:{}", self.pk, NO_PORT),
        }
    }
}

impl FromStr for Addr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<&str> = s.split(':').collect();
        let [key, port] = segments.as_slice() else {
            return Err(AddrError::SegmentCount(segments.len()));
        };
        if key.is_empty() || port.is_empty() {
            return Err(AddrError::EmptySegment);
        }

        let pk = key.parse::<PubKey>().map_err(AddrError::InvalidKey)?;
        let port = match *port {
            NO_PORT => None,
            digits => Some(parse_port(digits)?),
        };

        Ok(Self { pk, port })
    }
}

// `u16::from_str` accepts a leading `+`; the wire form is digits only.
fn parse_port(digits: &str) -> Result<u16, AddrError> {
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AddrError::InvalidPort(digits.to_string()));
    }
    digits
        .parse::<u16>()
        .map_err(|_| AddrError::InvalidPort(digits.to_string()))
}

/// A transport reported an endpoint string outside the `key:port` / `key:~`
/// forms. Not recoverable by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defect {
    pub addr: String,
    pub reason: AddrError,
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "network.disassemble_addr: {} {}", self.reason, self.addr)
    }
}

impl std::error::Error for Defect {}

/// Parses an endpoint string produced by the transport.
pub fn disassemble_addr(addr: &str) -> Result<Addr, Defect> {
    addr.parse::<Addr>().map_err(|reason| Defect {
        addr: addr.to_string(),
        reason,
    })
}
