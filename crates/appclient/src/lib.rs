//! # Appclient
//!
//! Application side of application networking. An application started by a
//! host reaches the overlay network only through the control channel the
//! host serves it:
//!
//! ```no_run
//! # async fn demo(remote: overlay::Addr) -> appclient::Result<()> {
//! let client = appclient::Client::from_env().await?;
//! let conn = client.dial(remote).await?;
//! conn.write_all(b"hello").await?;
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`client`]: opens the control channel and tracks what it hands out.
//! - [`conn`]: connections addressed by host-side id.
//! - [`listener`]: ports bound on the host.
//! - [`rpc`]: the seq-correlated call stub.

pub mod client;
pub mod conn;
pub mod error;
pub mod listener;
pub mod rpc;

pub use client::Client;
pub use conn::Conn;
pub use error::Error;
pub use error::Result;
pub use listener::Listener;
