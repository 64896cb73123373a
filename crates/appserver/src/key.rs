//! Per-instance application keys.

use std::fmt;

const KEY_BYTES: usize = 16;

/// Identifies one running application instance to its host.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct AppKey(String);

impl AppKey {
    /// Generates a fresh random key.
    pub fn generate() -> Self {
        Self(hex::encode(rand::random::<[u8; KEY_BYTES]>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
