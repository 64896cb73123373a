//! # Application Client
//!
//! Entry point for code running inside an application process. A [`Client`]
//! opens the control channel named by the environment and hands out
//! [`Conn`]s and [`Listener`]s backed by the host.
//!
//! The client tracks every connection and listener it handed out until it
//! is closed, so [`Client::close`] can release whatever the application
//! forgot.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Weak;

use appwire::APP_KEY_ENV;
use appwire::Request;
use appwire::Response;
use appwire::SOCK_FILE_ENV;
use dashmap::DashMap;
use overlay::Addr;
use overlay::DMSG_NET;

use crate::conn::Conn;
use crate::error::Error;
use crate::error::Result;
use crate::listener::Listener;
use crate::rpc::RpcClient;

pub(crate) struct Shared {
    pub(crate) rpc: Arc<RpcClient>,
    conns: DashMap<u16, Weak<Conn>>,
    listeners: DashMap<u16, Weak<Listener>>,
}

impl Shared {
    /// Wraps a host connection id and tracks it until closed.
    pub(crate) fn track_conn(self: &Arc<Self>, id: u16, local: Addr, remote: Addr) -> Arc<Conn> {
        let conn = Arc::new(Conn::new(id, self.rpc.clone(), local, remote));
        self.conns.insert(id, Arc::downgrade(&conn));

        let shared = Arc::downgrade(self);
        let owner = Arc::downgrade(&conn);
        conn.set_release_hook(Box::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.conns.remove_if(&id, |_, entry| entry.ptr_eq(&owner));
            }
        }));
        conn
    }

    fn track_listener(self: &Arc<Self>, id: u16, local: Addr) -> Arc<Listener> {
        let listener = Arc::new(Listener::new(id, self.clone(), local));
        self.listeners.insert(id, Arc::downgrade(&listener));

        let shared = Arc::downgrade(self);
        let owner = Arc::downgrade(&listener);
        listener.set_release_hook(Box::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.listeners.remove_if(&id, |_, entry| entry.ptr_eq(&owner));
            }
        }));
        listener
    }
}

pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Connects using `APP_KEY` and `SW_UNIX` from the environment.
    pub async fn from_env() -> Result<Self> {
        let (key, sock_file) = target_from(|var| std::env::var(var).ok())?;
        Self::connect(&key, sock_file).await
    }

    pub async fn connect(key: &str, sock_file: impl AsRef<Path>) -> Result<Self> {
        let rpc = RpcClient::connect(key, sock_file).await?;
        Ok(Self::with_rpc(rpc))
    }

    pub fn with_rpc(rpc: RpcClient) -> Self {
        Self {
            shared: Arc::new(Shared {
                rpc: Arc::new(rpc),
                conns: DashMap::new(),
                listeners: DashMap::new(),
            }),
        }
    }

    /// Opens a connection to `remote` over the overlay network.
    pub async fn dial(&self, remote: Addr) -> Result<Arc<Conn>> {
        let request = Request::Dial { net: DMSG_NET.to_string(), remote };
        match self.shared.rpc.call(request).await? {
            Response::Dialed { conn_id, local } => {
                tracing::debug!(conn_id, %remote, "dialed");
                Ok(self.shared.track_conn(conn_id, local, remote))
            }
            _ => Err(Error::UnexpectedResponse("Dial")),
        }
    }

    /// Binds `port` on the host's overlay identity.
    pub async fn listen(&self, port: u16) -> Result<Arc<Listener>> {
        let request = Request::Listen { net: DMSG_NET.to_string(), port };
        match self.shared.rpc.call(request).await? {
            Response::Listening { lis_id, local } => {
                tracing::debug!(lis_id, %local, "listening");
                Ok(self.shared.track_listener(lis_id, local))
            }
            _ => Err(Error::UnexpectedResponse("Listen")),
        }
    }

    /// Number of connections handed out and not yet closed.
    pub fn open_conns(&self) -> usize {
        self.shared.conns.len()
    }

    /// Number of listeners handed out and not yet closed.
    pub fn open_listeners(&self) -> usize {
        self.shared.listeners.len()
    }

    /// Closes every listener and connection still open. Keeps going past
    /// failures and returns the first one.
    pub async fn close(&self) -> Result<()> {
        let mut first_err = None;

        let listeners: Vec<Arc<Listener>> =
            self.shared.listeners.iter().filter_map(|entry| entry.value().upgrade()).collect();
        for listener in listeners {
            if let Err(e) = listener.close().await {
                tracing::warn!(lis_id = listener.id(), error = %e, "error closing listener");
                first_err.get_or_insert(e);
            }
        }

        let conns: Vec<Arc<Conn>> =
            self.shared.conns.iter().filter_map(|entry| entry.value().upgrade()).collect();
        for conn in conns {
            if let Err(e) = conn.close().await {
                tracing::warn!(conn_id = conn.id(), error = %e, "error closing connection");
                first_err.get_or_insert(e);
            }
        }

        self.shared.listeners.clear();
        self.shared.conns.clear();
        first_err.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("rpc", &self.shared.rpc)
            .field("conns", &self.shared.conns.len())
            .field("listeners", &self.shared.listeners.len())
            .finish()
    }
}

/// Reads the instance key and control socket path through `var`.
pub(crate) fn target_from(var: impl Fn(&str) -> Option<String>) -> Result<(String, PathBuf)> {
    let key = var(APP_KEY_ENV)
        .filter(|v| !v.is_empty())
        .ok_or(Error::MissingEnv(APP_KEY_ENV))?;
    let sock_file = var(SOCK_FILE_ENV)
        .filter(|v| !v.is_empty())
        .ok_or(Error::MissingEnv(SOCK_FILE_ENV))?;
    Ok((key, PathBuf::from(sock_file)))
}
