use thiserror::Error;

/// Errors returned by particle codec operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// CBOR serialization failure.
    #[error("encode error: {0}")]
    Encode(String),
    /// CBOR deserialization failure.
    #[error("decode error: {0}")]
    Decode(String),
    /// Particle-level schema validation failure.
    #[error("invalid particle: {0}")]
    InvalidParticle(&'static str),
}
