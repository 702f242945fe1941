use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Call identifier, unique within one particle.
pub type CallId = u32;

/// 32-byte peer identity (Ed25519 public key bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Raw public key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering used in scripts, logs, and config.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // short form keeps traces readable
        write!(f, "PeerId({})", &self.to_hex()[..12])
    }
}

impl FromStr for PeerId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim()).map_err(|_| CoreError::Decode("peer id is not hex"))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| CoreError::InvalidInput("peer id must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

/// Unique particle identifier.
///
/// Cloned on every queue hop, so the string is shared.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticleId(Arc<str>);

impl ParticleId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Borrow<str> for ParticleId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParticleId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ParticleId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl fmt::Display for ParticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ParticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParticleId({})", self.0)
    }
}

/// A peer identity plus its known reachable addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub peer_id: PeerId,
    pub addresses: Vec<String>,
}

impl Contact {
    pub fn new(peer_id: PeerId, addresses: Vec<String>) -> Self {
        Self { peer_id, addresses }
    }
}
