use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use lru::LruCache;
use particle_core::ParticleId;
use tokio::sync::broadcast;

use crate::router::DeliveryFault;

/// Terminal outcome of a particle on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticleOutcome {
    Completed,
    Expired,
    Faulted(String),
}

/// What the node remembers about a finished particle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticleRecord {
    pub outcome: ParticleOutcome,
    /// Sends that could not be delivered, in the order they failed.
    pub delivery_faults: Vec<DeliveryFault>,
    pub deadline_ms: u64,
}

/// Notifications published to originators and local observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticleEvent {
    Finished {
        particle_id: ParticleId,
        outcome: ParticleOutcome,
    },
    DeliveryFailed {
        particle_id: ParticleId,
        fault: DeliveryFault,
    },
}

impl ParticleEvent {
    pub fn particle_id(&self) -> &ParticleId {
        match self {
            Self::Finished { particle_id, .. } | Self::DeliveryFailed { particle_id, .. } => {
                particle_id
            }
        }
    }
}

/// Bounded memory of finished particles, used for dedup and inspection.
pub(crate) struct TerminalRecords {
    records: Mutex<LruCache<ParticleId, ParticleRecord>>,
    events: broadcast::Sender<ParticleEvent>,
}

impl TerminalRecords {
    pub(crate) fn new(capacity: usize, event_buffer: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            records: Mutex::new(LruCache::new(capacity)),
            events,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ParticleEvent> {
        self.events.subscribe()
    }

    pub(crate) fn get(&self, id: &ParticleId) -> Option<ParticleRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Stores the terminal record and announces the outcome.
    pub(crate) fn finish(
        &self,
        id: ParticleId,
        outcome: ParticleOutcome,
        delivery_faults: Vec<DeliveryFault>,
        deadline_ms: u64,
    ) {
        let record = ParticleRecord {
            outcome: outcome.clone(),
            delivery_faults,
            deadline_ms,
        };
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(id.clone(), record);
        // no subscribers is fine
        self.events
            .send(ParticleEvent::Finished {
                particle_id: id,
                outcome,
            })
            .ok();
    }

    /// Attaches a late delivery fault to an existing record, if any.
    pub(crate) fn attach_fault(&self, id: &ParticleId, fault: &DeliveryFault) -> bool {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        match records.get_mut(id) {
            Some(record) => {
                record.delivery_faults.push(fault.clone());
                true
            }
            None => false,
        }
    }

    pub(crate) fn announce_fault(&self, id: ParticleId, fault: DeliveryFault) {
        self.events
            .send(ParticleEvent::DeliveryFailed {
                particle_id: id,
                fault,
            })
            .ok();
    }

    pub(crate) fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
