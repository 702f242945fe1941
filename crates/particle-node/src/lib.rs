//! Particle execution pipeline.
//!
//! Ingests signed particles, multiplexes them onto a fixed pool of
//! interpreter instances, parks the ones that wait for a VM, a call result
//! or a peer, and turns each step's output into dispatch requests and local
//! service calls.

pub mod backend;
pub mod config;
pub mod effects;
pub mod ingest;
pub mod plumber;
pub mod records;
pub mod router;
pub mod script_storage;
pub mod services;
pub mod stats;
pub mod vm;
pub mod vm_pool;
pub mod waiting_queues;

pub use backend::{Node, NodeBackend, NodeParams};
pub use config::{NodeConfig, VmBackend, VmPoolConfig};
pub use ingest::{IngestError, Ingested};
pub use plumber::ParticleState;
pub use records::{ParticleEvent, ParticleOutcome, ParticleRecord};
