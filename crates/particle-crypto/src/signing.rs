use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use particle_codec::ParticleSignature;
use particle_core::PeerId;
use thiserror::Error;

/// Digest of the signed particle header.
pub type HeaderDigest = [u8; 32];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SigningError {
    #[error("peer id {0} is not an ed25519 public key")]
    MalformedPeerKey(PeerId),
    #[error("signature was not made by peer {0}")]
    ForeignSignature(PeerId),
}

/// Node identity able to sign particle headers.
pub trait Signer: Send + Sync {
    fn peer_id(&self) -> PeerId;
    fn sign_header(&self, digest: &HeaderDigest) -> ParticleSignature;
}

/// Checks that a header digest was signed by the claimed peer.
pub trait Verifier: Send + Sync {
    fn verify(
        &self,
        peer: &PeerId,
        digest: &HeaderDigest,
        signature: &ParticleSignature,
    ) -> Result<(), SigningError>;
}

/// Ed25519 node key; the peer id is its verifying key.
#[derive(Debug, Clone)]
pub struct Ed25519Signer {
    signing_key: SigningKey,
    peer_id: PeerId,
}

impl Ed25519Signer {
    pub fn from_secret(secret: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&secret);
        let peer_id = PeerId(signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            peer_id,
        }
    }
}

impl Signer for Ed25519Signer {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn sign_header(&self, digest: &HeaderDigest) -> ParticleSignature {
        ParticleSignature(self.signing_key.sign(digest).to_bytes())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl Verifier for Ed25519Verifier {
    fn verify(
        &self,
        peer: &PeerId,
        digest: &HeaderDigest,
        signature: &ParticleSignature,
    ) -> Result<(), SigningError> {
        let key = VerifyingKey::from_bytes(peer.as_bytes())
            .map_err(|_| SigningError::MalformedPeerKey(*peer))?;
        key.verify(digest, &Signature::from_bytes(&signature.0))
            .map_err(|_| SigningError::ForeignSignature(*peer))
    }
}
