//! # Application Process Manager
//!
//! A [`Proc`] is one application instance: the child process plus the
//! control-channel [`Server`] it talks to.
//!
//! ## Lifecycle
//!
//! `Created -> Running -> Stopped | Exited`
//!
//! - [`Proc::run`] serves the control channel on its own task, spawns the
//!   child and supervises it until it exits. On every way out of `run` the
//!   server is closed and its serve loop has ended.
//! - [`Proc::stop`] closes the server, then kills the child.
//! - [`Proc::wait`] waits for the child to exit, then closes the server.
//!
//! The child sees only two environment variables: the instance key and the
//! control socket path.

use std::ffi::OsStr;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::Mutex;

use overlay::Network;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;
use tracing::Span;

use crate::config::APP_KEY_ENV;
use crate::config::Config;
use crate::config::SOCK_FILE_ENV;
use crate::gateway::Gateway;
use crate::key::AppKey;
use crate::server::Server;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The control-channel server could not be created.
    Server(String),
    /// The binary could not be started.
    Spawn(String),
    /// The child exited unsuccessfully.
    Exit(ExitStatus),
    /// Waiting on the child failed.
    Wait(String),
    /// Killing the child failed.
    Kill(String),
    AlreadyStarted,
    NotStarted,
    /// There is no live child to act on.
    NotRunning,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server(msg) => write!(f, "failed to create RPC server: {}", msg),
            Self::Spawn(msg) => write!(f, "failed to start app: {}", msg),
            Self::Exit(status) => write!(f, "app exited: {}", status),
            Self::Wait(msg) => write!(f, "failed to wait for app: {}", msg),
            Self::Kill(msg) => write!(f, "failed to kill app: {}", msg),
            Self::AlreadyStarted => write!(f, "app already started"),
            Self::NotStarted => write!(f, "app not started"),
            Self::NotRunning => write!(f, "app not running"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Created,
    Running,
    /// Killed through [`Proc::stop`].
    Stopped,
    /// Exited on its own, or never managed to start.
    Exited,
}

type KillRequest = oneshot::Sender<std::io::Result<()>>;

pub struct Proc {
    key: AppKey,
    config: Config,
    log: Span,
    server: Arc<Server>,
    cmd: Mutex<Option<Command>>,
    state: Mutex<ProcState>,
    kill: Mutex<Option<mpsc::UnboundedSender<KillRequest>>>,
    exit: watch::Sender<Option<Result<()>>>,
}

impl Proc {
    /// Prepares the child and binds its control socket. Nothing runs yet.
    pub fn new<I, S>(log: Span, config: Config, args: I, network: Arc<Network>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let key = AppKey::generate();

        let mut cmd = Command::new(config.binary_path());
        cmd.args(args)
            .env_clear()
            .env(APP_KEY_ENV, key.as_str())
            .env(SOCK_FILE_ENV, &config.sock_file)
            .current_dir(&config.work_dir)
            .kill_on_drop(true);

        let server_log = tracing::info_span!(parent: &log, "app_rpc_server", key = %key);
        let gateway = Arc::new(Gateway::new(server_log.clone(), network));
        let server = Server::new(server_log, &config.sock_file, key.clone(), gateway)
            .map_err(|e| Error::Server(e.to_string()))?;

        Ok(Self {
            key,
            config,
            log,
            server: Arc::new(server),
            cmd: Mutex::new(Some(cmd)),
            state: Mutex::new(ProcState::Created),
            kill: Mutex::new(None),
            exit: watch::Sender::new(None),
        })
    }

    pub fn key(&self) -> &AppKey {
        &self.key
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn state(&self) -> ProcState {
        self.state.lock().map(|s| *s).unwrap_or(ProcState::Exited)
    }

    /// Runs the application until it exits.
    pub async fn run(&self) -> Result<()> {
        let cmd = self.cmd.lock().ok().and_then(|mut slot| slot.take());
        let Some(mut cmd) = cmd else {
            return Err(Error::AlreadyStarted);
        };
        // Kill requests queue up until the child exists.
        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<KillRequest>();
        if let Ok(mut slot) = self.kill.lock() {
            *slot = Some(kill_tx);
        }
        self.set_state(ProcState::Running);

        let server = self.server.clone();
        let log = self.log.clone();
        let serving = tokio::spawn(
            async move {
                if let Err(e) = server.listen_and_serve().await {
                    tracing::error!(parent: &log, error = %e, "error serving RPC");
                }
            }
            .in_current_span(),
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                if let Ok(mut slot) = self.kill.lock() {
                    slot.take();
                }
                drop(kill_rx);
                self.shutdown_server(serving).await;
                let err = Error::Spawn(e.to_string());
                self.finish(ProcState::Exited, Err(err.clone()));
                return Err(err);
            }
        };

        tracing::info!(
            parent: &self.log,
            pid = child.id(),
            binary = %self.config.binary_path().display(),
            "started app",
        );

        let mut killed = false;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(reply) = kill_rx.recv() => {
                    let res = child.start_kill();
                    killed |= res.is_ok();
                    let _ = reply.send(res);
                }
            }
        };
        if let Ok(mut slot) = self.kill.lock() {
            slot.take();
        }

        let outcome = match status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(Error::Exit(status)),
            Err(e) => Err(Error::Wait(e.to_string())),
        };
        tracing::info!(parent: &self.log, ok = outcome.is_ok(), killed, "app exited");

        self.shutdown_server(serving).await;
        let state = if killed { ProcState::Stopped } else { ProcState::Exited };
        self.finish(state, outcome.clone());
        outcome
    }

    /// Closes the control channel and kills the child.
    pub async fn stop(&self) -> Result<()> {
        if self.state() != ProcState::Running {
            return Err(Error::NotRunning);
        }
        self.close_server().await;

        let kill = self.kill.lock().ok().and_then(|slot| slot.clone());
        let Some(kill) = kill else {
            return Err(Error::NotRunning);
        };
        let (tx, rx) = oneshot::channel();
        kill.send(tx).map_err(|_| Error::NotRunning)?;
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Kill(e.to_string())),
            Err(_) => Err(Error::NotRunning),
        }
    }

    /// Waits for the child to exit, then closes the control channel.
    pub async fn wait(&self) -> Result<()> {
        if self.state() == ProcState::Created {
            return Err(Error::NotStarted);
        }
        let mut exit = self.exit.subscribe();
        let outcome = match exit.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Ok(())),
            Err(_) => Err(Error::NotRunning),
        };
        self.close_server().await;
        outcome
    }

    fn set_state(&self, state: ProcState) {
        if let Ok(mut slot) = self.state.lock() {
            *slot = state;
        }
    }

    fn finish(&self, state: ProcState, outcome: Result<()>) {
        self.set_state(state);
        self.exit.send_replace(Some(outcome));
    }

    async fn close_server(&self) {
        if let Err(e) = self.server.close().await {
            tracing::error!(parent: &self.log, error = %e, "error closing RPC server");
        }
    }

    async fn shutdown_server(&self, serving: JoinHandle<()>) {
        self.close_server().await;
        if let Err(e) = serving.await {
            tracing::error!(parent: &self.log, error = %e, "RPC serve task failed");
        }
    }
}

impl std::fmt::Debug for Proc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proc")
            .field("name", &self.config.name)
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}
