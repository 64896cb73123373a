//! In-memory overlay transport.
//!
//! A `MemoryHub` plays the part of the relay servers and discovery: every
//! client created from the same hub can dial every listener registered on it.
//! Streams are `tokio::io::duplex` pairs, so tests and local simulations get
//! real backpressure and end-of-stream behavior without any sockets.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::DuplexStream;
use tokio::io::ReadBuf;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::addr::Addr;
use crate::cipher::PubKey;
use crate::transport;
use crate::transport::OverlayClient;
use crate::transport::RawListener;
use crate::transport::RawStream;
use crate::transport::TransportError;

const STREAM_BUFFER: usize = 64 * 1024;
const FIRST_EPHEMERAL_PORT: u16 = 49152;

type Backlog = mpsc::UnboundedSender<Box<dyn RawStream>>;

struct HubInner {
    /// Bound ports, tagged with the id of the listener that owns them.
    listeners: DashMap<(PubKey, u16), (u64, Backlog)>,
    next_listener_id: AtomicU64,
    servers: watch::Sender<usize>,
}

impl HubInner {
    fn unbind(&self, key: &(PubKey, u16), listener_id: u64) {
        self.listeners.remove_if(key, |_, (owner, _)| *owner == listener_id);
    }
}

/// Shared state standing in for discovery and relay servers.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    /// Creates a hub that already has `servers` reachable servers.
    pub fn new(servers: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                listeners: DashMap::new(),
                next_listener_id: AtomicU64::new(1),
                servers: watch::Sender::new(servers),
            }),
        }
    }

    /// Brings one more server online, waking pending bootstraps.
    pub fn add_server(&self) {
        self.inner.servers.send_modify(|n| *n += 1);
    }

    pub fn servers(&self) -> usize {
        *self.inner.servers.borrow()
    }

    /// Creates a client for the endpoint identified by `pk`.
    pub fn client(&self, pk: PubKey) -> MemoryClient {
        MemoryClient {
            hub: self.inner.clone(),
            pk,
            next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
            closed: AtomicBool::new(false),
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new(1)
    }
}

/// One endpoint's view of a [`MemoryHub`].
pub struct MemoryClient {
    hub: Arc<HubInner>,
    pk: PubKey,
    next_port: AtomicU16,
    closed: AtomicBool,
}

impl MemoryClient {
    fn ensure_open(&self) -> transport::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn ephemeral_port(&self) -> u16 {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        if port < FIRST_EPHEMERAL_PORT {
            // wrapped around
            self.next_port.store(FIRST_EPHEMERAL_PORT + 1, Ordering::Relaxed);
            return FIRST_EPHEMERAL_PORT;
        }
        port
    }
}

#[async_trait::async_trait]
impl OverlayClient for MemoryClient {
    async fn initiate_server_connections(&self, min_servers: usize) -> transport::Result<()> {
        self.ensure_open()?;
        let mut servers = self.hub.servers.subscribe();
        servers
            .wait_for(|n| *n >= min_servers)
            .await
            .map_err(|_| TransportError::Bootstrap("hub is gone".into()))?;
        Ok(())
    }

    async fn dial(&self, pk: PubKey, port: u16) -> transport::Result<Box<dyn RawStream>> {
        self.ensure_open()?;
        let remote = Addr::new(pk, port);
        let backlog = self
            .hub
            .listeners
            .get(&(pk, port))
            .map(|entry| entry.value().1.clone())
            .ok_or_else(|| TransportError::ConnectionRefused(remote.to_string()))?;

        let local = Addr::new(self.pk, self.ephemeral_port());
        let (near, far) = tokio::io::duplex(STREAM_BUFFER);

        let accepted = MemoryStream {
            inner: far,
            local: remote.to_string(),
            remote: local.to_string(),
        };
        backlog
            .send(Box::new(accepted))
            .map_err(|_| TransportError::ConnectionRefused(remote.to_string()))?;

        Ok(Box::new(MemoryStream {
            inner: near,
            local: local.to_string(),
            remote: remote.to_string(),
        }))
    }

    async fn listen(&self, port: u16) -> transport::Result<Box<dyn RawListener>> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.hub.next_listener_id.fetch_add(1, Ordering::Relaxed);
        match self.hub.listeners.entry((self.pk, port)) {
            Entry::Occupied(_) => return Err(TransportError::PortInUse(port)),
            Entry::Vacant(slot) => {
                slot.insert((id, tx));
            }
        }

        Ok(Box::new(MemoryListener {
            hub: self.hub.clone(),
            id,
            key: (self.pk, port),
            backlog: Mutex::new(rx),
        }))
    }

    async fn close(&self) -> transport::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let pk = self.pk;
        self.hub.listeners.retain(|(owner, _), _| *owner != pk);
        Ok(())
    }
}

/// An acceptor registered on a [`MemoryHub`].
pub struct MemoryListener {
    hub: Arc<HubInner>,
    id: u64,
    key: (PubKey, u16),
    backlog: Mutex<mpsc::UnboundedReceiver<Box<dyn RawStream>>>,
}

#[async_trait::async_trait]
impl RawListener for MemoryListener {
    async fn accept(&self) -> transport::Result<Box<dyn RawStream>> {
        let mut backlog = self.backlog.lock().await;
        backlog.recv().await.ok_or(TransportError::Closed)
    }

    fn addr(&self) -> String {
        Addr::new(self.key.0, self.key.1).to_string()
    }

    async fn close(&self) -> transport::Result<()> {
        self.hub.unbind(&self.key, self.id);
        Ok(())
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.hub.unbind(&self.key, self.id);
    }
}

/// One half of an in-memory stream.
pub struct MemoryStream {
    inner: DuplexStream,
    local: String,
    remote: String,
}

impl MemoryStream {
    /// Builds a stream reporting arbitrary endpoint strings.
    pub fn with_endpoints(inner: DuplexStream, local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            inner,
            local: local.into(),
            remote: remote.into(),
        }
    }
}

impl RawStream for MemoryStream {
    fn local_addr(&self) -> String {
        self.local.clone()
    }

    fn remote_addr(&self) -> String {
        self.remote.clone()
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
