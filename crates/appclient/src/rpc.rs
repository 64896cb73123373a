//! # Control-Channel Stub with Async Pump
//!
//! Issues calls to the host over the control socket. Replies may arrive in
//! any order; a background pump reads them and hands each to the caller
//! waiting on its `seq`.
//!
//! When the channel dies, every pending call and every later call fails with
//! [`Error::ChannelClosed`].

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use appwire::Frame;
use appwire::Request;
use appwire::Response;
use appwire::read_frame;
use appwire::write_frame;
use dashmap::DashMap;
use tokio::net::UnixStream;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::error::Result;

type Pending = DashMap<u64, oneshot::Sender<Result<Response>>>;

pub struct RpcClient {
    writer: Mutex<OwnedWriteHalf>,
    pending: Arc<Pending>,
    dead: Arc<AtomicBool>,
    seq_gen: AtomicU64,
    pump: JoinHandle<()>,
}

impl RpcClient {
    /// Connects to the host's control socket and introduces itself with `key`.
    pub async fn connect(key: &str, sock_file: impl AsRef<Path>) -> Result<Self> {
        let sock_file = sock_file.as_ref();
        let stream = UnixStream::connect(sock_file)
            .await
            .map_err(|e| Error::Connect(format!("{}: {}", sock_file.display(), e)))?;
        Self::handshake(key, stream).await
    }

    /// Sends `Hello` on an already connected stream and starts the pump.
    pub async fn handshake(key: &str, stream: UnixStream) -> Result<Self> {
        let (reader, mut writer) = stream.into_split();
        write_frame(&mut writer, &Frame::Hello { key: key.to_string() }).await?;

        let pending: Arc<Pending> = Arc::new(DashMap::new());
        let dead = Arc::new(AtomicBool::new(false));
        let pump = tokio::spawn(pump(reader, pending.clone(), dead.clone()));

        Ok(Self {
            writer: Mutex::new(writer),
            pending,
            dead,
            seq_gen: AtomicU64::new(1),
            pump,
        })
    }

    /// True once the control channel has failed.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Sends `request` and waits for its reply.
    pub async fn call(&self, request: Request) -> Result<Response> {
        let seq = self.seq_gen.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);

        // The pump marks the channel dead before draining `pending`, so a
        // call registered after the drain is caught here.
        if self.is_dead() {
            self.pending.remove(&seq);
            return Err(Error::ChannelClosed);
        }

        let method = request.method();
        let sent = {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &Frame::Call { seq, request }).await
        };
        if let Err(e) = sent {
            self.pending.remove(&seq);
            tracing::debug!(seq, method, error = %e, "failed to send call");
            return Err(Error::ChannelClosed);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => {
                self.pending.remove(&seq);
                Err(Error::ChannelClosed)
            }
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("pending", &self.pending.len())
            .field("dead", &self.is_dead())
            .finish()
    }
}

async fn pump(mut reader: OwnedReadHalf, pending: Arc<Pending>, dead: Arc<AtomicBool>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Reply { seq, status })) => {
                // A reply nobody waits for belongs to a cancelled call.
                if let Some((_, tx)) = pending.remove(&seq) {
                    let _ = tx.send(status.map_err(Error::Remote));
                }
            }
            Ok(Some(_)) => {
                tracing::warn!("host sent a frame other than Reply");
                break;
            }
            Ok(None) => {
                tracing::debug!("control channel closed by host");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "control channel failed");
                break;
            }
        }
    }

    dead.store(true, Ordering::SeqCst);
    let seqs: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for seq in seqs {
        if let Some((_, tx)) = pending.remove(&seq) {
            let _ = tx.send(Err(Error::ChannelClosed));
        }
    }
}
