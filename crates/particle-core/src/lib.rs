//! Core particle-node primitives shared across crates.
//!
//! Includes peer/particle identifiers, contacts, hash and clock helpers,
//! and base errors.

pub mod clock;
pub mod error;
pub mod hash;
pub mod types;

pub use types::{CallId, Contact, ParticleId, PeerId};
