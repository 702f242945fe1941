//! Cryptographic helpers for particle signing.
//!
//! Signs and verifies particle headers under Ed25519 peer identities, and
//! parses node keys.

pub mod keys;
pub mod signing;
