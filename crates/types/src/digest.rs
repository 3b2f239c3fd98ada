//! Request digests and keyed message tags.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error parsing a digest from its hex rendering.
#[derive(Debug, Error)]
pub enum HexError {
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("digest must be 32 bytes, got {0}")]
    WrongLength(usize),
}

/// A SHA-256 digest.
///
/// Serialized as a lowercase hex string on the wire. Used both for request
/// digests (hash of the canonical JSON encoding) and for keyed message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// The all-zero digest.
    pub const ZERO: Digest = Digest([0u8; 32]);

    /// Hash raw bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    /// Hash the canonical encoding of a JSON value.
    ///
    /// `serde_json` maps are `BTreeMap`-backed, so serializing a `Value`
    /// yields keys in sorted order at every nesting level. That makes
    /// `to_vec` a canonical encoding: two structurally equal values always
    /// produce the same digest.
    pub fn of_value(value: &serde_json::Value) -> Self {
        let bytes = serde_json::to_vec(value).unwrap_or_default();
        Self::of_bytes(&bytes)
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Render as lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Digest {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let len = bytes.len();
        let arr: [u8; 32] = bytes.try_into().map_err(|_| HexError::WrongLength(len))?;
        Ok(Self(arr))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Compute the keyed integrity tag for a peer protocol message.
///
/// `tag = SHA256(sender ‖ view ‖ sequence ‖ digest ‖ secret)`
///
/// This is an integrity check under a cluster-wide shared secret, not a
/// signature; it rejects corrupted or out-of-cluster traffic but does not
/// authenticate individual peers against each other.
pub fn message_tag(
    sender: &str,
    view: u64,
    sequence: u64,
    digest: &Digest,
    secret: &str,
) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(sender.as_bytes());
    hasher.update(view.to_le_bytes());
    hasher.update(sequence.to_le_bytes());
    hasher.update(digest.as_bytes());
    hasher.update(secret.as_bytes());
    Digest(hasher.finalize().into())
}
