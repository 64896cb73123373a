//! # Appserver
//!
//! Host side of application networking. A host starts each application as a
//! child process and serves it a private control channel through which the
//! application opens, uses and closes overlay connections by id.
//!
//! ## Architecture
//!
//! - [`proc`]: spawns and supervises the child, owns its [`Server`].
//! - [`server`]: the Unix-socket control channel of one instance.
//! - [`gateway`]: executes requests against the [`overlay::Network`].
//! - [`registry`]: `u16` id allocation for connections and listeners.

pub mod config;
pub mod gateway;
pub mod key;
pub mod proc;
pub mod registry;
pub mod server;

pub use config::Config;
pub use gateway::Gateway;
pub use key::AppKey;
pub use proc::Proc;
pub use proc::ProcState;
pub use server::Server;
