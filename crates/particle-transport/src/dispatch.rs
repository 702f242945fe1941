use std::sync::{Arc, Mutex, PoisonError};

use particle_core::{Contact, ParticleId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::adapter::TransportAdapter;

/// Result of one delivery attempt, reported through the completion channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    Failed(String),
}

/// Outbound request handed to the connection layer.
#[derive(Debug)]
pub struct DispatchRequest {
    /// Particle the bytes belong to; used for tracing only.
    pub particle_id: ParticleId,
    pub contact: Contact,
    /// CBOR-encoded particle.
    pub bytes: Vec<u8>,
    /// Signalled once the connection layer knows whether delivery worked.
    pub completion: oneshot::Sender<DispatchOutcome>,
}

impl DispatchRequest {
    /// Builds a request and the receiver its completion will arrive on.
    pub fn new(
        particle_id: ParticleId,
        contact: Contact,
        bytes: Vec<u8>,
    ) -> (Self, oneshot::Receiver<DispatchOutcome>) {
        let (completion, inlet) = oneshot::channel();
        let request = Self {
            particle_id,
            contact,
            bytes,
            completion,
        };
        (request, inlet)
    }

    /// Reports the outcome; a dropped requester is not an error.
    pub fn complete(self, outcome: DispatchOutcome) {
        self.completion.send(outcome).ok();
    }
}

/// Connects a node's outbound dispatch stream to a transport adapter.
///
/// Runs until every sender of `requests` is dropped.
pub async fn drive_dispatches<A>(
    adapter: Arc<Mutex<A>>,
    mut requests: mpsc::UnboundedReceiver<DispatchRequest>,
) where
    A: TransportAdapter,
{
    while let Some(request) = requests.recv().await {
        let sent = {
            let mut adapter = adapter.lock().unwrap_or_else(PoisonError::into_inner);
            adapter
                .send(&request.contact, &request.bytes)
                .map_err(|err| err.to_string())
        };
        match sent {
            Ok(()) => {
                debug!(
                    particle_id = %request.particle_id,
                    peer = %request.contact.peer_id,
                    "particle delivered"
                );
                request.complete(DispatchOutcome::Delivered);
            }
            Err(err) => {
                warn!(
                    particle_id = %request.particle_id,
                    peer = %request.contact.peer_id,
                    "particle delivery failed: {err}"
                );
                request.complete(DispatchOutcome::Failed(err));
            }
        }
    }
}
