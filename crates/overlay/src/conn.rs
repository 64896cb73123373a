//! # Virtual Connections
//!
//! Adapts raw transport streams and acceptors into addressed connections.
//! No protocol lives here: addresses are derived once from the raw endpoint
//! strings, and all I/O passes straight through.
//!
//! ## Invariants
//!
//! - Reads are serialized against reads, writes against writes. A write is
//!   fully flushed before the next write on the same `Conn` begins.
//! - `close` shuts the stream down and releases both halves once, and runs
//!   the release hook once, no matter how often or how concurrently it is
//!   called. Every caller returns only after that teardown finished.
//! - Any read, write or accept blocked when `close` happens fails with
//!   [`Error::Closed`].

use std::sync::Mutex as StdMutex;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::ReadHalf;
use tokio::io::WriteHalf;
use tokio::sync::Mutex;
use tokio::sync::OnceCell;
use tokio::sync::watch;

use crate::addr::Addr;
use crate::addr::disassemble_addr;
use crate::cipher::PubKey;
use crate::network::Error;
use crate::network::Result;
use crate::transport::RawListener;
use crate::transport::RawStream;
use crate::transport::TransportError;

/// Callback run exactly once when a connection is closed.
pub type ReleaseHook = Box<dyn FnOnce() + Send>;

/// Runs the wrapped hook when dropped, so release happens on every exit path.
pub struct ReleaseGuard(Option<ReleaseHook>);

impl ReleaseGuard {
    pub fn new(hook: Option<ReleaseHook>) -> Self {
        Self(hook)
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(hook) = self.0.take() {
            hook();
        }
    }
}

/// The generic addressed-connection capability set.
#[async_trait::async_trait]
pub trait AddrConn: Send + Sync {
    async fn read(&self, buf: &mut [u8]) -> std::io::Result<usize>;
    async fn write(&self, buf: &[u8]) -> std::io::Result<usize>;
    async fn close(&self) -> std::io::Result<()>;
    fn local_addr(&self) -> Addr;
    fn remote_addr(&self) -> Addr;
}

/// An addressed connection over a raw transport stream.
pub struct Conn {
    reader: Mutex<Option<ReadHalf<Box<dyn RawStream>>>>,
    writer: Mutex<Option<WriteHalf<Box<dyn RawStream>>>>,
    local: Addr,
    remote: Addr,
    network: String,
    closed: watch::Sender<bool>,
    /// Held across teardown; `true` once the stream has been released.
    released: Mutex<bool>,
    release: StdMutex<Option<ReleaseHook>>,
}

impl Conn {
    pub(crate) fn wrap(stream: Box<dyn RawStream>, network: &str) -> Result<Self> {
        let local = derive_addr(&stream.local_addr())?;
        let remote = derive_addr(&stream.remote_addr())?;
        let (reader, writer) = tokio::io::split(stream);

        Ok(Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            local,
            remote,
            network: network.to_string(),
            closed: watch::Sender::new(false),
            released: Mutex::new(false),
            release: StdMutex::new(None),
        })
    }

    pub fn local_addr(&self) -> Addr {
        self.local
    }

    pub fn remote_addr(&self) -> Addr {
        self.remote
    }

    pub fn local_pk(&self) -> PubKey {
        self.local.pk
    }

    pub fn remote_pk(&self) -> PubKey {
        self.remote.pk
    }

    pub fn local_port(&self) -> u16 {
        self.local.port_or_zero()
    }

    pub fn remote_port(&self) -> u16 {
        self.remote.port_or_zero()
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Installs the hook run when this connection is closed.
    /// Replaces any previous hook. Has no effect after close.
    pub fn set_release_hook(&self, hook: ReleaseHook) {
        if self.is_closed() {
            return;
        }
        if let Ok(mut slot) = self.release.lock() {
            *slot = Some(hook);
        }
    }

    /// Reads into `buf`. `Ok(0)` means the peer finished writing.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut closed = self.closed.subscribe();
        let mut guard = tokio::select! {
            guard = self.reader.lock() => guard,
            _ = closed.wait_for(|c| *c) => return Err(Error::Closed),
        };
        let Some(reader) = guard.as_mut() else {
            return Err(Error::Closed);
        };
        tokio::select! {
            res = reader.read(buf) => res.map_err(Error::Io),
            _ = closed.wait_for(|c| *c) => Err(Error::Closed),
        }
    }

    /// Writes all of `buf` before any other writer on this connection runs.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut closed = self.closed.subscribe();
        let mut guard = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = closed.wait_for(|c| *c) => return Err(Error::Closed),
        };
        let Some(writer) = guard.as_mut() else {
            return Err(Error::Closed);
        };
        let flushed = async {
            writer.write_all(buf).await?;
            writer.flush().await
        };
        tokio::select! {
            res = flushed => res.map(|_| buf.len()).map_err(Error::Io),
            _ = closed.wait_for(|c| *c) => Err(Error::Closed),
        }
    }

    /// Closes the connection and releases the stream. Callers racing the
    /// first close wait for its teardown and then return `Ok`.
    pub async fn close(&self) -> Result<()> {
        // Wakes blocked I/O so the halves' locks come free.
        self.closed.send_replace(true);

        let mut released = self.released.lock().await;
        if *released {
            return Ok(());
        }
        let hook = self.release.lock().ok().and_then(|mut slot| slot.take());
        let _release = ReleaseGuard::new(hook);

        let mut writer = self.writer.lock().await;
        let mut reader = self.reader.lock().await;
        let res = match writer.as_mut() {
            Some(half) => half.shutdown().await.map_err(Error::Io),
            None => Ok(()),
        };
        // Dropping both halves drops the stream itself.
        *writer = None;
        *reader = None;
        *released = true;
        res
    }
}

#[async_trait::async_trait]
impl AddrConn for Conn {
    async fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(Conn::read(self, buf).await?)
    }

    async fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(Conn::write(self, buf).await?)
    }

    async fn close(&self) -> std::io::Result<()> {
        Ok(Conn::close(self).await?)
    }

    fn local_addr(&self) -> Addr {
        self.local
    }

    fn remote_addr(&self) -> Addr {
        self.remote
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("network", &self.network)
            .field("local", &self.local.to_string())
            .field("remote", &self.remote.to_string())
            .finish()
    }
}

/// An addressed listener over a raw transport acceptor.
pub struct Listener {
    inner: Box<dyn RawListener>,
    local: Addr,
    network: String,
    closed: watch::Sender<bool>,
    unbound: OnceCell<std::result::Result<(), TransportError>>,
}

impl Listener {
    pub(crate) fn wrap(inner: Box<dyn RawListener>, network: &str) -> Result<Self> {
        let local = derive_addr(&inner.addr())?;
        Ok(Self {
            inner,
            local,
            network: network.to_string(),
            closed: watch::Sender::new(false),
            unbound: OnceCell::new(),
        })
    }

    pub fn local_addr(&self) -> Addr {
        self.local
    }

    pub fn local_pk(&self) -> PubKey {
        self.local.pk
    }

    pub fn local_port(&self) -> u16 {
        self.local.port_or_zero()
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Waits for the next inbound connection.
    pub async fn accept_conn(&self) -> Result<Conn> {
        let mut closed = self.closed.subscribe();
        let stream = tokio::select! {
            res = self.inner.accept() => match res {
                Ok(stream) => stream,
                Err(TransportError::Closed) => return Err(Error::Closed),
                Err(e) => return Err(Error::Transport(e)),
            },
            _ = closed.wait_for(|c| *c) => return Err(Error::Closed),
        };
        Conn::wrap(stream, &self.network)
    }

    /// Unbinds the listener. Every caller waits for the unbind and sees
    /// its outcome.
    pub async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        self.unbound
            .get_or_init(|| self.inner.close())
            .await
            .clone()
            .map_err(Error::Transport)
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("network", &self.network)
            .field("local", &self.local.to_string())
            .finish()
    }
}

fn derive_addr(text: &str) -> Result<Addr> {
    disassemble_addr(text).map_err(|defect| {
        tracing::error!(%defect, "transport reported a malformed endpoint");
        Error::Defect(defect)
    })
}
