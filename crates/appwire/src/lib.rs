//! # Appwire
//!
//! The control-channel protocol between an application process and the RPC
//! server its host runs for it.
//!
//! ## Architecture
//!
//! - [`frame`]: `Hello`, `Call` and `Reply` frames as neopack values.
//! - [`stream`]: length-prefixed framing over any tokio byte stream.

pub mod error;
pub mod frame;
pub mod stream;

pub use error::Error;
pub use error::FailureReason;
pub use error::Result;
pub use frame::Frame;
pub use frame::Request;
pub use frame::Response;
pub use stream::MAX_FRAME_LEN;
pub use stream::read_frame;
pub use stream::write_frame;

/// Environment variable carrying the instance key to the application.
pub const APP_KEY_ENV: &str = "APP_KEY";

/// Environment variable carrying the control socket path to the application.
pub const SOCK_FILE_ENV: &str = "SW_UNIX";

/// Largest payload a single `Read` returns.
pub const MAX_READ: u32 = 64 * 1024;

/// Largest payload a single `Write` carries; larger writes are partial.
pub const MAX_WRITE: usize = 64 * 1024;
