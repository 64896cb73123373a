//! # RPC Gateway
//!
//! Executes control-channel requests against the overlay network on behalf of
//! one application instance.
//!
//! The gateway owns two id registries, one for connections and one for
//! listeners. An application only ever sees ids; the real [`Conn`]s and
//! [`Listener`]s stay here.
//!
//! ## Invariants
//! - An id never refers to a closed connection: closing a connection runs its
//!   release hook, which drops the id from the registry.
//! - A release hook only removes the entry it was installed for, even if the
//!   id has been handed out again in the meantime.
//! - Once `close_all` has begun, nothing new stays registered: a dial or
//!   accept that completes afterwards closes its connection and fails.
//! - A `Write` runs to completion even if the call serving it is dropped, so
//!   a stream never carries a partial write.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use appwire::FailureReason;
use appwire::MAX_READ;
use appwire::Request;
use appwire::Response;
use overlay::Addr;
use overlay::Conn;
use overlay::Listener;
use overlay::Network;
use tracing::Span;

use crate::registry::Registry;

type Reply = std::result::Result<Response, FailureReason>;

pub struct Gateway {
    log: Span,
    network: Arc<Network>,
    conns: Arc<Registry<Arc<Conn>>>,
    listeners: Registry<Arc<Listener>>,
    closed: AtomicBool,
}

impl Gateway {
    pub fn new(log: Span, network: Arc<Network>) -> Self {
        Self {
            log,
            network,
            conns: Arc::new(Registry::new()),
            listeners: Registry::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    /// Number of open connections.
    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    /// Number of open listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Runs one request to completion.
    pub async fn handle(&self, request: Request) -> Reply {
        match request {
            Request::Dial { net, remote } => self.dial(&net, remote).await,
            Request::Listen { net, port } => self.listen(&net, port).await,
            Request::Accept { lis_id } => self.accept(lis_id).await,
            Request::Read { conn_id, max } => self.read(conn_id, max).await,
            Request::Write { conn_id, data } => self.write(conn_id, data).await,
            Request::CloseConn { conn_id } => self.close_conn(conn_id).await,
            Request::CloseListener { lis_id } => self.close_listener(lis_id).await,
        }
    }

    /// Closes every connection and listener, and refuses to register new
    /// ones from here on.
    pub async fn close_all(&self) {
        // Set before draining; `register` and `listen` check it after inserting.
        self.closed.store(true, Ordering::SeqCst);
        for listener in self.listeners.drain() {
            if let Err(e) = listener.close().await {
                tracing::warn!(parent: &self.log, error = %e, "error closing listener");
            }
        }
        for conn in self.conns.drain() {
            if let Err(e) = conn.close().await {
                tracing::warn!(parent: &self.log, error = %e, "error closing connection");
            }
        }
    }

    async fn dial(&self, net: &str, remote: Addr) -> Reply {
        if self.is_closed() {
            return Err(FailureReason::Closed);
        }
        let conn = self
            .network
            .dial(net, remote.pk, remote.port_or_zero())
            .await
            .map_err(failure)?;
        let local = conn.local_addr();
        let conn_id = self.register(conn).await?;
        tracing::debug!(parent: &self.log, conn_id, %remote, "dialed");
        Ok(Response::Dialed { conn_id, local })
    }

    async fn listen(&self, net: &str, port: u16) -> Reply {
        if self.is_closed() {
            return Err(FailureReason::Closed);
        }
        let listener = Arc::new(self.network.listen(net, port).await.map_err(failure)?);
        let local = listener.local_addr();
        let lis_id = match self.listeners.insert(listener.clone()) {
            Ok(id) => id,
            Err(_) => {
                let _ = listener.close().await;
                return Err(FailureReason::NoFreeIds);
            }
        };
        if self.is_closed() {
            self.listeners.remove_if(lis_id, |entry| Arc::ptr_eq(entry, &listener));
            let _ = listener.close().await;
            return Err(FailureReason::Closed);
        }
        tracing::debug!(parent: &self.log, lis_id, %local, "listening");
        Ok(Response::Listening { lis_id, local })
    }

    async fn accept(&self, lis_id: u16) -> Reply {
        let listener = self.listeners.get(lis_id).ok_or(FailureReason::NoSuchListener)?;
        let conn = listener.accept_conn().await.map_err(failure)?;
        let local = conn.local_addr();
        let remote = conn.remote_addr();
        let conn_id = self.register(conn).await?;
        tracing::debug!(parent: &self.log, lis_id, conn_id, %remote, "accepted");
        Ok(Response::Accepted { conn_id, local, remote })
    }

    async fn read(&self, conn_id: u16, max: u32) -> Reply {
        if max == 0 {
            return Err(FailureReason::BadRequest("zero-length read".into()));
        }
        let conn = self.conn(conn_id)?;
        let mut buf = vec![0u8; max.min(MAX_READ) as usize];
        let n = conn.read(&mut buf).await.map_err(conn_failure)?;
        buf.truncate(n);
        Ok(Response::Data(buf))
    }

    async fn write(&self, conn_id: u16, data: Vec<u8>) -> Reply {
        let conn = self.conn(conn_id)?;
        // Detached, so dropping this call cannot cut the write short.
        let written = tokio::spawn(async move { conn.write(&data).await })
            .await
            .map_err(|e| FailureReason::Io(e.to_string()))?;
        let n = written.map_err(conn_failure)?;
        Ok(Response::Written(n as u32))
    }

    async fn close_conn(&self, conn_id: u16) -> Reply {
        let conn = self.conn(conn_id)?;
        conn.close().await.map_err(conn_failure)?;
        tracing::debug!(parent: &self.log, conn_id, "closed connection");
        Ok(Response::Closed)
    }

    async fn close_listener(&self, lis_id: u16) -> Reply {
        let listener = self.listeners.remove(lis_id).ok_or(FailureReason::NoSuchListener)?;
        listener.close().await.map_err(failure)?;
        tracing::debug!(parent: &self.log, lis_id, "closed listener");
        Ok(Response::Closed)
    }

    fn conn(&self, conn_id: u16) -> std::result::Result<Arc<Conn>, FailureReason> {
        match self.conns.get(conn_id) {
            Some(conn) if !conn.is_closed() => Ok(conn),
            _ => Err(FailureReason::NoSuchConnection),
        }
    }

    /// Stores `conn` and arranges for its id to be released on close.
    async fn register(&self, conn: Conn) -> std::result::Result<u16, FailureReason> {
        let conn = Arc::new(conn);
        let conn_id = match self.conns.insert(conn.clone()) {
            Ok(id) => id,
            Err(_) => {
                let _ = conn.close().await;
                return Err(FailureReason::NoFreeIds);
            }
        };

        let registry: Weak<Registry<Arc<Conn>>> = Arc::downgrade(&self.conns);
        let owner: Weak<Conn> = Arc::downgrade(&conn);
        conn.set_release_hook(Box::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove_if(conn_id, |entry| Arc::as_ptr(entry) == owner.as_ptr());
            }
        }));

        if self.is_closed() {
            let _ = conn.close().await;
            self.conns.remove_if(conn_id, |entry| Arc::ptr_eq(entry, &conn));
            return Err(FailureReason::Closed);
        }
        Ok(conn_id)
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("conns", &self.conns.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

fn failure(e: overlay::Error) -> FailureReason {
    match e {
        overlay::Error::UnknownNetwork(net) => FailureReason::UnknownNetwork(net),
        overlay::Error::Transport(e) => FailureReason::Transport(e.to_string()),
        overlay::Error::Bootstrap(msg) => FailureReason::Transport(msg),
        overlay::Error::Defect(d) => FailureReason::Transport(d.to_string()),
        overlay::Error::Closed => FailureReason::Closed,
        overlay::Error::Io(e) => FailureReason::Io(e.to_string()),
    }
}

/// Like [`failure`], but a closed connection is indistinguishable from an
/// unknown one.
fn conn_failure(e: overlay::Error) -> FailureReason {
    match e {
        overlay::Error::Closed => FailureReason::NoSuchConnection,
        other => failure(other),
    }
}
