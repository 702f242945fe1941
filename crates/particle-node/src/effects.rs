use std::collections::BTreeMap;

use particle_codec::Particle;
use particle_core::{CallId, PeerId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JValue;

/// Result of one local service call as seen by the VM.
pub type CallServiceResult = Result<JValue, String>;

/// Call results accumulated for one particle, keyed by call id.
pub type CallResults = BTreeMap<CallId, CallServiceResult>;

/// Request to invoke a local service on behalf of a particle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub call_id: CallId,
    pub service_id: String,
    pub function_name: String,
    pub args: Vec<JValue>,
}

/// Output of one VM step before it is turned into effects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VmOutcome {
    /// New particle data replacing the previous one.
    pub data: Vec<u8>,
    /// Peers the updated particle must be sent to, in order.
    pub next_peers: Vec<PeerId>,
    /// Service calls the script is now blocked on.
    pub call_requests: Vec<CallRequest>,
}

impl VmOutcome {
    /// The script has nothing left to wait for.
    pub fn is_complete(&self) -> bool {
        self.call_requests.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct SendParticle {
    pub particle: Particle,
    pub target: PeerId,
}

#[derive(Clone, Debug, Default)]
/// Effects produced by one particle step: outbound particles and local calls.
pub struct StepperEffects {
    /// Particles addressed to `next_peers`, in the order the VM produced them.
    pub particles: Vec<SendParticle>,
    pub call_requests: Vec<CallRequest>,
}

impl StepperEffects {
    /// Builds effects for a particle whose data was already updated.
    pub fn from_outcome(particle: &Particle, outcome: &VmOutcome) -> Self {
        let particles = outcome
            .next_peers
            .iter()
            .map(|target| SendParticle {
                particle: particle.clone(),
                target: *target,
            })
            .collect();
        Self {
            particles,
            call_requests: outcome.call_requests.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty() && self.call_requests.is_empty()
    }
}

/// Why a particle (or one of its sends) cannot proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitReason {
    AwaitingVm,
    AwaitingCallResult(CallId),
    AwaitingPeer(PeerId),
}

/// A particle parked in a waiting queue together with what it has gathered.
#[derive(Debug, Clone)]
pub struct AwaitedParticle {
    pub particle: Particle,
    pub call_results: CallResults,
    pub reason: WaitReason,
}

impl AwaitedParticle {
    pub fn new(particle: Particle) -> Self {
        Self {
            particle,
            call_results: CallResults::new(),
            reason: WaitReason::AwaitingVm,
        }
    }

    pub fn waiting_for(mut self, reason: WaitReason) -> Self {
        self.reason = reason;
        self
    }
}
