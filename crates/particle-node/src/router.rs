use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::FutureExt;
use particle_codec::particle::encode_particle_cbor;
use particle_codec::Particle;
use particle_core::clock::now_ms;
use particle_core::{CallId, Contact, ParticleId, PeerId};
use particle_transport::dispatch::{DispatchOutcome, DispatchRequest};
use particle_transport::events::ConnectionEvent;
use particle_transport::routing::PeerResolver;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::config::RoutePolicy;
use crate::effects::{
    AwaitedParticle, CallRequest, CallServiceResult, SendParticle, StepperEffects, WaitReason,
};
use crate::services::{CallParams, ServiceCalls};
use crate::stats::{bump, StatsCounters};
use crate::waiting_queues::WaitingQueues;

/// Why one outbound particle could not be delivered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchFailure {
    #[error("no route to peer")]
    NoRoute,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection layer is gone")]
    ChannelClosed,
    #[error("particle could not be encoded: {0}")]
    Encode(String),
}

/// Final delivery failure of one send, after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFault {
    pub target: PeerId,
    pub failure: DispatchFailure,
    /// Delivery attempts made before giving up.
    pub attempts: u32,
}

/// Immediate routing decision for one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    /// Handed to the connection layer; completion is tracked asynchronously.
    Dispatched { target: PeerId, contacts: usize },
    /// No contact known yet; waits for the peer to connect.
    AwaitingPeer(PeerId),
    /// The target is this node.
    SkippedSelf,
    Failed(DeliveryFault),
}

/// Asynchronous results flowing back into the node loop.
#[derive(Debug)]
pub(crate) enum RouterFeedback {
    CallResult {
        particle_id: ParticleId,
        call_id: CallId,
        result: CallServiceResult,
    },
    DeliveryFault {
        particle_id: ParticleId,
        fault: DeliveryFault,
    },
}

/// Turns stepper effects into dispatch requests and service calls.
pub(crate) struct EffectsRouter {
    local_peer: PeerId,
    policy: RoutePolicy,
    resolver: Arc<dyn PeerResolver>,
    services: Arc<dyn ServiceCalls>,
    connected: Mutex<HashMap<PeerId, Contact>>,
    awaiting_peer: WaitingQueues<PeerId, AwaitedParticle>,
    outbound: mpsc::UnboundedSender<DispatchRequest>,
    feedback: mpsc::UnboundedSender<RouterFeedback>,
    stats: Arc<StatsCounters>,
}

impl EffectsRouter {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        local_peer: PeerId,
        policy: RoutePolicy,
        resolver: Arc<dyn PeerResolver>,
        services: Arc<dyn ServiceCalls>,
        queue_shards: usize,
        outbound: mpsc::UnboundedSender<DispatchRequest>,
        feedback: mpsc::UnboundedSender<RouterFeedback>,
        stats: Arc<StatsCounters>,
    ) -> Self {
        Self {
            local_peer,
            policy,
            resolver,
            services,
            connected: Mutex::new(HashMap::new()),
            awaiting_peer: WaitingQueues::with_shards(queue_shards),
            outbound,
            feedback,
            stats,
        }
    }

    /// Executes one step's effects without waiting for any of them.
    ///
    /// Sends keep the VM's order; results are reported per send.
    pub(crate) fn apply(&self, particle: &Particle, effects: StepperEffects) -> Vec<DispatchResult> {
        for request in effects.call_requests {
            self.call_service(particle, request);
        }
        effects
            .particles
            .into_iter()
            .map(|send| self.route(send))
            .collect()
    }

    fn route(&self, send: SendParticle) -> DispatchResult {
        let SendParticle { particle, target } = send;
        if target == self.local_peer {
            debug!(particle_id = %particle.id, "dropping send addressed to self");
            return DispatchResult::SkippedSelf;
        }

        let contacts = self.contacts_for(&target);
        if contacts.is_empty() {
            trace!(particle_id = %particle.id, peer = %target, "no contact, waiting for peer");
            self.awaiting_peer.enqueue(
                target,
                AwaitedParticle::new(particle).waiting_for(WaitReason::AwaitingPeer(target)),
            );
            // the peer may have connected between resolve and enqueue
            if self.connected_contact(&target).is_some() {
                self.flush_awaiting(target);
            }
            return DispatchResult::AwaitingPeer(target);
        }

        let bytes = match encode_particle_cbor(&particle) {
            Ok(bytes) => bytes,
            Err(err) => {
                let fault = DeliveryFault {
                    target,
                    failure: DispatchFailure::Encode(err.to_string()),
                    attempts: 0,
                };
                self.report_fault(particle.id.clone(), fault.clone());
                return DispatchResult::Failed(fault);
            }
        };

        // first attempt goes out synchronously so sends leave in VM order
        let count = contacts.len();
        let (request, completion) =
            DispatchRequest::new(particle.id.clone(), contacts[0].clone(), bytes.clone());
        if self.outbound.send(request).is_err() {
            let fault = DeliveryFault {
                target,
                failure: DispatchFailure::ChannelClosed,
                attempts: 1,
            };
            self.report_fault(particle.id.clone(), fault.clone());
            return DispatchResult::Failed(fault);
        }
        tokio::spawn(watch_delivery(
            Delivery {
                particle_id: particle.id.clone(),
                deadline_ms: particle.deadline_ms(),
                target,
                contacts,
                bytes,
            },
            completion,
            self.policy,
            self.outbound.clone(),
            self.feedback.clone(),
            self.stats.clone(),
        ));
        DispatchResult::Dispatched {
            target,
            contacts: count,
        }
    }

    /// Connected contact first, then resolver candidates not already listed.
    fn contacts_for(&self, peer: &PeerId) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = self.connected_contact(peer).into_iter().collect();
        for contact in self.resolver.resolve(peer) {
            if !contacts.contains(&contact) {
                contacts.push(contact);
            }
        }
        contacts.retain(|c| !c.addresses.is_empty());
        contacts
    }

    fn connected_contact(&self, peer: &PeerId) -> Option<Contact> {
        self.connected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .cloned()
    }

    fn call_service(&self, particle: &Particle, request: CallRequest) {
        bump(&self.stats.service_calls);
        let particle_id = particle.id.clone();
        let call_id = request.call_id;
        let params = CallParams {
            particle_id: particle_id.clone(),
            init_peer_id: particle.init_peer_id,
            host_peer_id: self.local_peer,
        };
        trace!(
            particle_id = %particle_id,
            call_id,
            service = %request.service_id,
            function = %request.function_name,
            "calling service"
        );
        let call = self.services.invoke(params, request);
        let feedback = self.feedback.clone();
        tokio::spawn(async move {
            let result = match AssertUnwindSafe(call).catch_unwind().await {
                Ok(result) => result.map_err(|err| err.to_string()),
                Err(_) => Err("service call panicked".to_string()),
            };
            feedback
                .send(RouterFeedback::CallResult {
                    particle_id,
                    call_id,
                    result,
                })
                .ok();
        });
    }

    pub(crate) fn on_connection(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected(contact) => {
                let peer = contact.peer_id;
                debug!(peer = %peer, "peer connected");
                self.connected
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(peer, contact);
                self.flush_awaiting(peer);
            }
            ConnectionEvent::Disconnected(peer) => {
                debug!(peer = %peer, "peer disconnected");
                self.connected
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&peer);
            }
        }
    }

    fn flush_awaiting(&self, peer: PeerId) {
        for awaited in self.awaiting_peer.take(&peer) {
            self.route(SendParticle {
                particle: awaited.particle,
                target: peer,
            });
        }
    }

    /// Drops sends whose particle expired while waiting for a peer.
    pub(crate) fn sweep_expired(&self, now_ms: u64) -> usize {
        let expired = self
            .awaiting_peer
            .remove_where(|_, awaited| awaited.particle.is_expired(now_ms));
        let count = expired.len();
        for (target, awaited) in expired {
            self.report_fault(
                awaited.particle.id,
                DeliveryFault {
                    target,
                    failure: DispatchFailure::NoRoute,
                    attempts: 0,
                },
            );
        }
        count
    }

    pub(crate) fn awaiting_peer_len(&self) -> usize {
        self.awaiting_peer.len()
    }

    fn report_fault(&self, particle_id: ParticleId, fault: DeliveryFault) {
        self.feedback
            .send(RouterFeedback::DeliveryFault { particle_id, fault })
            .ok();
    }
}

struct Delivery {
    particle_id: ParticleId,
    deadline_ms: u64,
    target: PeerId,
    contacts: Vec<Contact>,
    bytes: Vec<u8>,
}

/// Awaits the first attempt, then retries through the next contacts until
/// one accepts the particle or attempts run out.
async fn watch_delivery(
    delivery: Delivery,
    first: oneshot::Receiver<DispatchOutcome>,
    policy: RoutePolicy,
    outbound: mpsc::UnboundedSender<DispatchRequest>,
    feedback: mpsc::UnboundedSender<RouterFeedback>,
    stats: Arc<StatsCounters>,
) {
    let Delivery {
        particle_id,
        deadline_ms,
        target,
        contacts,
        bytes,
    } = delivery;
    let mut completion = first;
    let mut attempts = 1;

    let failure = loop {
        let failure = match completion.await {
            Ok(DispatchOutcome::Delivered) => {
                bump(&stats.particles_dispatched);
                return;
            }
            Ok(DispatchOutcome::Failed(reason)) => {
                debug!(particle_id = %particle_id, peer = %target, attempts, "delivery attempt failed: {reason}");
                DispatchFailure::Transport(reason)
            }
            Err(_) => break DispatchFailure::ChannelClosed,
        };
        if attempts >= policy.max_attempts {
            break failure;
        }
        tokio::time::sleep(policy.backoff).await;
        if now_ms() >= deadline_ms {
            break failure;
        }

        let contact = contacts[attempts as usize % contacts.len()].clone();
        attempts += 1;
        let (request, next) = DispatchRequest::new(particle_id.clone(), contact, bytes.clone());
        if outbound.send(request).is_err() {
            break DispatchFailure::ChannelClosed;
        }
        completion = next;
    };

    warn!(particle_id = %particle_id, peer = %target, attempts, "giving up delivery: {failure}");
    feedback
        .send(RouterFeedback::DeliveryFault {
            particle_id,
            fault: DeliveryFault {
                target,
                failure,
                attempts,
            },
        })
        .ok();
}
