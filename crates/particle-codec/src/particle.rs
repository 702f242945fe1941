use serde::{Deserialize, Deserializer, Serialize, Serializer};
use particle_core::hash::blake3_32;
use particle_core::{ParticleId, PeerId};

use crate::error::CodecError;

/// Particle schema version carried on the wire.
pub const PARTICLE_V1_VERSION: u16 = 1;
/// Upper bound on particle id length.
pub const MAX_PARTICLE_ID_LEN: usize = 128;
/// Upper bound on an encoded particle accepted from the network.
pub const MAX_PARTICLE_WIRE_SIZE: usize = 4 * 1024 * 1024;

/// 64-byte signature wrapper for serde byte encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticleSignature(pub [u8; 64]);

impl Serialize for ParticleSignature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for ParticleSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = <Vec<u8>>::deserialize(deserializer)?;
        if raw.len() != 64 {
            return Err(serde::de::Error::invalid_length(
                raw.len(),
                &"exactly 64 bytes",
            ));
        }

        let mut bytes = [0_u8; 64];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }
}

/// Signed mobile script routed between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Particle {
    /// Wire version.
    pub version: u16,
    /// Unique particle id.
    pub id: ParticleId,
    /// Peer that created and signed the particle.
    pub init_peer_id: PeerId,
    /// Creation time, unix milliseconds.
    pub timestamp_ms: u64,
    /// Time-to-live after `timestamp_ms`.
    pub ttl_ms: u32,
    /// Script source interpreted by the VM.
    pub script: String,
    /// Interpreter data; rewritten on every step.
    pub data: Vec<u8>,
    /// Signature by `init_peer_id` over the immutable fields.
    pub signature: Option<ParticleSignature>,
}

#[derive(Debug, Clone, Serialize)]
struct SignedParticleHeaderV1<'a> {
    version: u16,
    id: &'a str,
    init_peer_id: PeerId,
    timestamp_ms: u64,
    ttl_ms: u32,
}

impl Particle {
    /// Builds an unsigned particle; sign it before handing it to a node.
    pub fn new(
        id: impl Into<ParticleId>,
        init_peer_id: PeerId,
        timestamp_ms: u64,
        ttl_ms: u32,
        script: impl Into<String>,
    ) -> Self {
        Self {
            version: PARTICLE_V1_VERSION,
            id: id.into(),
            init_peer_id,
            timestamp_ms,
            ttl_ms,
            script: script.into(),
            data: Vec::new(),
            signature: None,
        }
    }

    /// Absolute deadline in unix milliseconds.
    pub fn deadline_ms(&self) -> u64 {
        self.timestamp_ms.saturating_add(u64::from(self.ttl_ms))
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.deadline_ms()
    }

    /// Validates particle schema and field consistency.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.version != PARTICLE_V1_VERSION {
            return Err(CodecError::InvalidParticle("unsupported particle version"));
        }
        if self.id.is_empty() {
            return Err(CodecError::InvalidParticle("particle id must not be empty"));
        }
        if self.id.as_str().len() > MAX_PARTICLE_ID_LEN {
            return Err(CodecError::InvalidParticle("particle id is too long"));
        }
        if self.script.trim().is_empty() {
            return Err(CodecError::InvalidParticle("script must not be empty"));
        }
        if self.ttl_ms == 0 {
            return Err(CodecError::InvalidParticle("ttl must be non-zero"));
        }
        Ok(())
    }
}

/// Computes the signature digest over the immutable particle fields.
///
/// `data` and `signature` are excluded: data is rewritten at every hop.
pub fn particle_signature_message_digest(particle: &Particle) -> Result<[u8; 32], CodecError> {
    particle.validate()?;
    let header = SignedParticleHeaderV1 {
        version: particle.version,
        id: particle.id.as_str(),
        init_peer_id: particle.init_peer_id,
        timestamp_ms: particle.timestamp_ms,
        ttl_ms: particle.ttl_ms,
    };
    let mut header_cbor = Vec::new();
    ciborium::ser::into_writer(&header, &mut header_cbor)
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    let script_hash = blake3_32(particle.script.as_bytes());
    let mut preimage = Vec::with_capacity(header_cbor.len() + script_hash.len());
    preimage.extend_from_slice(&header_cbor);
    preimage.extend_from_slice(&script_hash);
    Ok(blake3_32(&preimage))
}

/// Encodes a particle as CBOR after validation.
pub fn encode_particle_cbor(particle: &Particle) -> Result<Vec<u8>, CodecError> {
    particle.validate()?;
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(particle, &mut bytes)
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// Decodes and validates a CBOR particle.
pub fn decode_particle_cbor(bytes: &[u8]) -> Result<Particle, CodecError> {
    if bytes.len() > MAX_PARTICLE_WIRE_SIZE {
        return Err(CodecError::InvalidParticle("particle exceeds wire size limit"));
    }
    let particle: Particle =
        ciborium::de::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
    particle.validate()?;
    Ok(particle)
}
