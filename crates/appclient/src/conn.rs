//! # Application-Side Connection
//!
//! A [`Conn`] is a connection id plus the control channel: every read, write
//! and close is a call to the host, which performs it on the real overlay
//! connection.
//!
//! Deadlines are not supported; the setters exist so callers written against
//! a full connection interface get a stable error instead of a missing
//! method.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Instant;

use appwire::MAX_READ;
use appwire::MAX_WRITE;
use appwire::Request;
use appwire::Response;
use overlay::Addr;
use overlay::AddrConn;
use overlay::conn::ReleaseGuard;
use overlay::conn::ReleaseHook;

use crate::error::Error;
use crate::error::Result;
use crate::rpc::RpcClient;

pub struct Conn {
    id: u16,
    rpc: Arc<RpcClient>,
    local: Addr,
    remote: Addr,
    closed: AtomicBool,
    release: Mutex<Option<ReleaseHook>>,
}

impl Conn {
    pub fn new(id: u16, rpc: Arc<RpcClient>, local: Addr, remote: Addr) -> Self {
        Self {
            id,
            rpc,
            local,
            remote,
            closed: AtomicBool::new(false),
            release: Mutex::new(None),
        }
    }

    /// The host-side connection id.
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn local_addr(&self) -> Addr {
        self.local
    }

    pub fn remote_addr(&self) -> Addr {
        self.remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Installs the hook run once when this connection is closed.
    pub fn set_release_hook(&self, hook: ReleaseHook) {
        if let Ok(mut slot) = self.release.lock() {
            *slot = Some(hook);
        }
    }

    /// Reads at most `buf.len()` bytes. `Ok(0)` means the peer finished
    /// writing.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.check()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(MAX_READ as usize) as u32;
        match self.rpc.call(Request::Read { conn_id: self.id, max }).await? {
            Response::Data(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            _ => Err(Error::UnexpectedResponse("Read")),
        }
    }

    /// Writes a prefix of `buf` of at most [`MAX_WRITE`] bytes and returns
    /// its length.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.check()?;
        let data = buf[..buf.len().min(MAX_WRITE)].to_vec();
        match self.rpc.call(Request::Write { conn_id: self.id, data }).await? {
            Response::Written(n) => Ok(n as usize),
            _ => Err(Error::UnexpectedResponse("Write")),
        }
    }

    /// Writes all of `buf`, one call per [`MAX_WRITE`] bytes.
    pub async fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(Error::Closed);
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Closes the connection on the host. The release hook runs exactly once,
    /// whatever the host answers. Repeated calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let hook = self.release.lock().ok().and_then(|mut slot| slot.take());
        let _release = ReleaseGuard::new(hook);

        match self.rpc.call(Request::CloseConn { conn_id: self.id }).await? {
            Response::Closed => Ok(()),
            _ => Err(Error::UnexpectedResponse("CloseConn")),
        }
    }

    pub fn set_deadline(&self, _deadline: Instant) -> Result<()> {
        Err(Error::MethodNotImplemented)
    }

    pub fn set_read_deadline(&self, _deadline: Instant) -> Result<()> {
        Err(Error::MethodNotImplemented)
    }

    pub fn set_write_deadline(&self, _deadline: Instant) -> Result<()> {
        Err(Error::MethodNotImplemented)
    }

    fn check(&self) -> Result<()> {
        if self.is_closed() { Err(Error::Closed) } else { Ok(()) }
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
            .field("id", &self.id)
            .field("local", &self.local.to_string())
            .field("remote", &self.remote.to_string())
            .field("closed", &self.is_closed())
            .finish()
    }
}
