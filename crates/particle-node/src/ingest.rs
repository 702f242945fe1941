use particle_codec::error::CodecError;
use particle_codec::particle::particle_signature_message_digest;
use particle_codec::Particle;
use particle_core::ParticleId;
use particle_crypto::signing::{Signer, Verifier};
use tracing::debug;
use thiserror::Error;

use crate::records::ParticleOutcome;

/// Why a particle was refused at the node boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("malformed particle: {0}")]
    Malformed(#[from] CodecError),
    #[error("invalid signature on particle {0}")]
    InvalidSignature(ParticleId),
    #[error("particle {particle_id} expired at {deadline_ms} (now {now_ms})")]
    Expired {
        particle_id: ParticleId,
        deadline_ms: u64,
        now_ms: u64,
    },
}

/// Successful ingestion result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    /// Handed to the pipeline.
    Accepted,
    /// The id already finished here; nothing was scheduled.
    AlreadyFinished(ParticleOutcome),
    /// The id is still being processed; nothing was scheduled.
    InFlight,
}

/// Signs the immutable particle fields with `signer`.
///
/// `init_peer_id` must already be the signer's peer id for verification to pass.
pub fn sign_particle(particle: &mut Particle, signer: &dyn Signer) -> Result<(), IngestError> {
    let digest = particle_signature_message_digest(particle)?;
    particle.signature = Some(signer.sign_header(&digest));
    Ok(())
}

/// Checks schema and the init peer's signature.
pub fn verify_particle(particle: &Particle, verifier: &dyn Verifier) -> Result<(), IngestError> {
    let digest = particle_signature_message_digest(particle)?;
    let invalid = || IngestError::InvalidSignature(particle.id.clone());
    let signature = particle.signature.as_ref().ok_or_else(invalid)?;
    verifier
        .verify(&particle.init_peer_id, &digest, signature)
        .map_err(|err| {
            debug!(particle_id = %particle.id, "signature rejected: {err}");
            invalid()
        })
}
