//! Particle wire codec primitives.
//!
//! Defines the canonical particle schema, its signature preimage, and CBOR
//! encode/decode helpers.

pub mod error;
pub mod particle;

pub use particle::{Particle, ParticleSignature};
