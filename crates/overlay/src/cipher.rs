//! # Identity Keys
//!
//! Overlay endpoints are addressed by public key. Keys are ed25519 points,
//! rendered as lowercase hex in every text form (addresses, logs, env).

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::SigningKey;
use ed25519_dalek::VerifyingKey;

pub const PUB_KEY_LEN: usize = 32;
pub const SEC_KEY_LEN: usize = 32;

/// Key parsing errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Text is not valid hex.
    InvalidHex,
    /// Decoded byte length is not the key length.
    InvalidLength(usize),
    /// Bytes do not encode a valid curve point.
    InvalidPoint,
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHex => write!(f, "invalid hex"),
            Self::InvalidLength(n) => write!(f, "invalid key length: {} bytes", n),
            Self::InvalidPoint => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for KeyError {}

/// A public key identifying an overlay endpoint.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PubKey([u8; PUB_KEY_LEN]);

impl PubKey {
    /// Validates and wraps raw key bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let raw: [u8; PUB_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidLength(bytes.len()))?;
        VerifyingKey::from_bytes(&raw).map_err(|_| KeyError::InvalidPoint)?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; PUB_KEY_LEN] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", self.hex())
    }
}

impl FromStr for PubKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidHex)?;
        Self::from_bytes(&bytes)
    }
}

/// The secret half of a local identity.
#[derive(Clone, PartialEq, Eq)]
pub struct SecKey([u8; SEC_KEY_LEN]);

impl SecKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let raw: [u8; SEC_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidLength(bytes.len()))?;
        Ok(Self(raw))
    }

    /// Derives the matching public key.
    pub fn pub_key(&self) -> PubKey {
        let signing = SigningKey::from_bytes(&self.0);
        PubKey(signing.verifying_key().to_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; SEC_KEY_LEN] {
        &self.0
    }
}

// Never print secret material.
impl fmt::Debug for SecKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecKey(<redacted>)")
    }
}

/// Generates a fresh random keypair.
pub fn generate_keypair() -> (PubKey, SecKey) {
    let sk = SecKey(rand::random::<[u8; SEC_KEY_LEN]>());
    (sk.pub_key(), sk)
}
