//! # Control-Channel RPC Server
//!
//! Serves one application instance over a private Unix socket.
//!
//! ## Protocol
//!
//! A session opens with a single `Hello` carrying the instance key. A session
//! that presents any other key, or opens with anything else, is dropped. After
//! that every `Call` runs on its own task and is answered by a `Reply` with
//! the same `seq`, so a blocked `Read` or `Accept` never holds up other calls.
//!
//! ## Shutdown
//!
//! [`Server::close`] ends the accept loop and every session, removes the
//! socket file, and closes all connections and listeners the application
//! still holds.

use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use appwire::Frame;
use appwire::read_frame;
use appwire::write_frame;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::Instrument;
use tracing::Span;

use crate::gateway::Gateway;
use crate::key::AppKey;

#[derive(Debug)]
pub enum Error {
    /// The socket could not be bound.
    Bind(PathBuf, std::io::Error),
    /// Something other than a socket occupies the socket path.
    PathOccupied(PathBuf),
    /// `listen_and_serve` was called while already serving.
    AlreadyServing,
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind(path, e) => write!(f, "failed to bind {}: {}", path.display(), e),
            Self::PathOccupied(path) => write!(f, "{} exists and is not a socket", path.display()),
            Self::AlreadyServing => write!(f, "server is already serving"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind(_, e) | Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub struct Server {
    log: Span,
    sock_file: PathBuf,
    key: AppKey,
    gateway: Arc<Gateway>,
    /// Bound but not yet served. Taken by `listen_and_serve` or `close`.
    listener: Mutex<Option<std::os::unix::net::UnixListener>>,
    closed: watch::Sender<bool>,
    /// Held across teardown; `true` once it finished.
    torn_down: tokio::sync::Mutex<bool>,
}

impl Server {
    /// Binds `sock_file`, replacing a stale socket left at that path.
    pub fn new(
        log: Span,
        sock_file: impl Into<PathBuf>,
        key: AppKey,
        gateway: Arc<Gateway>,
    ) -> Result<Self> {
        let sock_file = sock_file.into();
        remove_stale_socket(&sock_file)?;

        let listener = std::os::unix::net::UnixListener::bind(&sock_file)
            .map_err(|e| Error::Bind(sock_file.clone(), e))?;
        listener.set_nonblocking(true)?;
        tracing::debug!(parent: &log, sock = %sock_file.display(), "bound control socket");

        Ok(Self {
            log,
            sock_file,
            key,
            gateway,
            listener: Mutex::new(Some(listener)),
            closed: watch::Sender::new(false),
            torn_down: tokio::sync::Mutex::new(false),
        })
    }

    pub fn sock_file(&self) -> &Path {
        &self.sock_file
    }

    pub fn key(&self) -> &AppKey {
        &self.key
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Accepts sessions until the server is closed.
    pub async fn listen_and_serve(&self) -> Result<()> {
        let bound = self.listener.lock().ok().and_then(|mut slot| slot.take());
        let Some(bound) = bound else {
            return if self.is_closed() { Ok(()) } else { Err(Error::AlreadyServing) };
        };
        let listener = UnixListener::from_std(bound)?;

        tracing::info!(parent: &self.log, sock = %self.sock_file.display(), "serving");

        let mut closed = self.closed.subscribe();
        let mut sessions = JoinSet::new();
        let result = loop {
            tokio::select! {
                _ = closed.wait_for(|c| *c) => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let session = serve_session(stream, self.key.clone(), self.gateway.clone());
                        sessions.spawn(session.instrument(self.log.clone()));
                    }
                    Err(e) => {
                        tracing::error!(parent: &self.log, error = %e, "accept failed");
                        break Err(Error::Io(e));
                    }
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        };

        sessions.shutdown().await;
        tracing::info!(parent: &self.log, "stopped serving");
        result
    }

    /// Shuts the server down. Every caller returns once teardown finished;
    /// only the one that ran it sees its outcome.
    pub async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        let mut torn_down = self.torn_down.lock().await;
        if *torn_down {
            return Ok(());
        }
        if let Ok(mut slot) = self.listener.lock() {
            slot.take();
        }

        let removed = match std::fs::remove_file(&self.sock_file) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(Error::Io(e)),
            _ => Ok(()),
        };
        self.gateway.close_all().await;
        *torn_down = true;
        removed
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("sock_file", &self.sock_file)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => Ok(std::fs::remove_file(path)?),
        Ok(_) => Err(Error::PathOccupied(path.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

async fn serve_session(stream: UnixStream, key: AppKey, gateway: Arc<Gateway>) {
    let (mut reader, writer) = stream.into_split();

    match read_frame(&mut reader).await {
        Ok(Some(Frame::Hello { key: presented })) if presented == key.as_str() => {}
        Ok(Some(Frame::Hello { .. })) => {
            tracing::warn!("rejected session: key mismatch");
            return;
        }
        Ok(Some(_)) => {
            tracing::warn!("rejected session: expected Hello");
            return;
        }
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(error = %e, "rejected session");
            return;
        }
    }
    tracing::debug!("session opened");

    let writer = Arc::new(tokio::sync::Mutex::new(writer));
    let mut calls = JoinSet::new();
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "dropping session on bad frame");
                break;
            }
        };

        let Frame::Call { seq, request } = frame else {
            tracing::warn!("dropping session on unexpected frame");
            break;
        };
        let method = request.method();
        let gateway = gateway.clone();
        let writer = writer.clone();
        calls.spawn(
            async move {
                let status = gateway.handle(request).await;
                if let Err(reason) = &status {
                    tracing::debug!(seq, method, %reason, "call failed");
                }
                reply(&writer, Frame::Reply { seq, status }).await;
            }
            .in_current_span(),
        );

        while calls.try_join_next().is_some() {}
    }

    // In-flight calls are dropped; the gateway finishes writes on its own.
    calls.shutdown().await;
    tracing::debug!("session closed");
}

async fn reply(writer: &tokio::sync::Mutex<OwnedWriteHalf>, frame: Frame) {
    let mut writer = writer.lock().await;
    if let Err(e) = write_frame(&mut *writer, &frame).await {
        tracing::debug!(error = %e, "failed to send reply");
    }
}
