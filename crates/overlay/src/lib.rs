//! # Overlay
//!
//! Public-key addressed networking on top of an opaque transport.
//!
//! ## Architecture
//!
//! - [`transport`]: the capability set consumed from the real transport
//!   (bootstrap, dial, listen, close).
//! - [`addr`]: the `<pk>:<port>` / `<pk>:~` text codec.
//! - [`network`]: the per-process [`Network`] handle.
//! - [`conn`]: addressed [`Conn`] and [`Listener`] wrappers.
//! - [`mem`]: an in-memory transport for tests and local simulation.

pub mod addr;
pub mod cipher;
pub mod conn;
pub mod mem;
pub mod network;
pub mod transport;

pub use addr::Addr;
pub use addr::AddrError;
pub use addr::Defect;
pub use cipher::PubKey;
pub use cipher::SecKey;
pub use cipher::generate_keypair;
pub use conn::AddrConn;
pub use conn::Conn;
pub use conn::Listener;
pub use network::DMSG_NET;
pub use network::Error;
pub use network::Network;

#[cfg(test)]
mod tests;
