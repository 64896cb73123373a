use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use appwire::Request;
use appwire::Response;
use overlay::Addr;
use overlay::conn::ReleaseGuard;
use overlay::conn::ReleaseHook;

use crate::client::Shared;
use crate::conn::Conn;
use crate::error::Error;
use crate::error::Result;

/// A port bound on the host on behalf of the application.
pub struct Listener {
    id: u16,
    shared: Arc<Shared>,
    local: Addr,
    closed: AtomicBool,
    release: Mutex<Option<ReleaseHook>>,
}

impl Listener {
    pub(crate) fn new(id: u16, shared: Arc<Shared>, local: Addr) -> Self {
        Self {
            id,
            shared,
            local,
            closed: AtomicBool::new(false),
            release: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn local_addr(&self) -> Addr {
        self.local
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_release_hook(&self, hook: ReleaseHook) {
        if let Ok(mut slot) = self.release.lock() {
            *slot = Some(hook);
        }
    }

    /// Waits for the next inbound connection.
    pub async fn accept(&self) -> Result<Arc<Conn>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        match self.shared.rpc.call(Request::Accept { lis_id: self.id }).await? {
            Response::Accepted { conn_id, local, remote } => {
                tracing::debug!(lis_id = self.id, conn_id, %remote, "accepted");
                Ok(self.shared.track_conn(conn_id, local, remote))
            }
            _ => Err(Error::UnexpectedResponse("Accept")),
        }
    }

    /// Unbinds the port on the host. Pending accepts fail. Repeated calls
    /// are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let hook = self.release.lock().ok().and_then(|mut slot| slot.take());
        let _release = ReleaseGuard::new(hook);

        match self.shared.rpc.call(Request::CloseListener { lis_id: self.id }).await? {
            Response::Closed => Ok(()),
            _ => Err(Error::UnexpectedResponse("CloseListener")),
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("local", &self.local.to_string())
            .field("closed", &self.is_closed())
            .finish()
    }
}
