//! # Overlay Network
//!
//! Holds the local identity and the single transport client of a process,
//! and turns `(network, pk, port)` requests into addressed [`Conn`]s and
//! [`Listener`]s.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::OnceCell;

use crate::addr::Defect;
use crate::cipher::PubKey;
use crate::cipher::SecKey;
use crate::conn::Conn;
use crate::conn::Listener;
use crate::transport::OverlayClient;
use crate::transport::TransportError;

/// Listening port of a setup node.
pub const SETUP_PORT: u16 = 36;
/// Listening port of a visor node for setup operations.
pub const AWAIT_SETUP_PORT: u16 = 136;
/// Listening port of a visor node for incoming transports.
pub const TRANSPORT_PORT: u16 = 45;

/// The only supported network type.
pub const DMSG_NET: &str = "dmsg";

#[derive(Debug)]
pub enum Error {
    /// The requested network type is not supported.
    UnknownNetwork(String),
    /// The transport client failed; passed through unchanged.
    Transport(TransportError),
    /// Bootstrap did not reach the minimum server count.
    Bootstrap(String),
    /// The transport broke the endpoint format contract.
    Defect(Defect),
    /// The network, listener or connection has been closed.
    Closed,
    /// The underlying stream failed.
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownNetwork(net) => write!(f, "unknown network type: {}", net),
            Self::Transport(e) => write!(f, "{}", e),
            Self::Bootstrap(msg) => write!(f, "failed to initiate '{}': {}", DMSG_NET, msg),
            Self::Defect(d) => write!(f, "invariant violation: {}", d),
            Self::Closed => write!(f, "closed"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Defect(d) => Some(d),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        use std::io::ErrorKind;
        match e {
            Error::Io(io) => io,
            Error::Closed => std::io::Error::new(ErrorKind::NotConnected, "closed"),
            other => std::io::Error::other(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Network configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub pub_key: PubKey,
    pub sec_key: SecKey,
    /// Networks to be used with transports.
    pub tp_networks: Vec<String>,
    pub dmsg_disc_addr: String,
    pub dmsg_min_srvs: usize,
}

/// The overlay network of one process.
pub struct Network {
    conf: Config,
    client: Box<dyn OverlayClient>,
    closed: AtomicBool,
    torn_down: OnceCell<std::result::Result<(), TransportError>>,
}

impl Network {
    /// Takes ownership of the transport client.
    pub fn new(conf: Config, client: Box<dyn OverlayClient>) -> Self {
        Self {
            conf,
            client,
            closed: AtomicBool::new(false),
            torn_down: OnceCell::new(),
        }
    }

    /// Connects to bootstrap servers, blocking until `dmsg_min_srvs` are
    /// reachable or `timeout` elapses.
    pub async fn init(&self, timeout: Duration) -> Result<()> {
        tracing::info!(
            disc = %self.conf.dmsg_disc_addr,
            min_servers = self.conf.dmsg_min_srvs,
            "initiating {} server connections",
            DMSG_NET,
        );

        let initiate = self.client.initiate_server_connections(self.conf.dmsg_min_srvs);
        match tokio::time::timeout(timeout, initiate).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Bootstrap(e.to_string())),
            Err(_) => Err(Error::Bootstrap(format!("deadline of {:?} exceeded", timeout))),
        }
    }

    /// Shuts the transport client down. Only the first call does any work,
    /// but every caller returns once teardown completed, with its outcome.
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.torn_down
            .get_or_init(|| async {
                tracing::debug!(pk = %self.conf.pub_key, "closing network");
                self.client.close().await
            })
            .await
            .clone()
            .map_err(Error::Transport)
    }

    /// The underlying transport client.
    pub fn client(&self) -> &dyn OverlayClient {
        self.client.as_ref()
    }

    pub fn local_pk(&self) -> PubKey {
        self.conf.pub_key
    }

    pub fn local_sk(&self) -> &SecKey {
        &self.conf.sec_key
    }

    pub fn config(&self) -> &Config {
        &self.conf
    }

    /// Dials `pk:port` on `network`.
    pub async fn dial(&self, network: &str, pk: PubKey, port: u16) -> Result<Conn> {
        self.check(network)?;
        let stream = self.client.dial(pk, port).await?;
        Conn::wrap(stream, network)
    }

    /// Listens on the local `port` of `network`.
    pub async fn listen(&self, network: &str, port: u16) -> Result<Listener> {
        self.check(network)?;
        let listener = self.client.listen(port).await?;
        Listener::wrap(listener, network)
    }

    fn check(&self, network: &str) -> Result<()> {
        if network != DMSG_NET {
            return Err(Error::UnknownNetwork(network.to_string()));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}
