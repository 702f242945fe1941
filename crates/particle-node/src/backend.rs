use std::sync::Arc;

use particle_codec::particle::decode_particle_cbor;
use particle_codec::Particle;
use particle_core::clock::now_ms;
use particle_core::{ParticleId, PeerId};
use particle_crypto::signing::{Ed25519Verifier, Signer, Verifier};
use particle_transport::dispatch::DispatchRequest;
use particle_transport::events::{ConnectionEvent, NetworkEvent};
use particle_transport::routing::{PeerResolver, StaticResolver};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::ingest::{sign_particle, verify_particle, IngestError, Ingested};
use crate::plumber::{ParticleState, Plumber};
use crate::records::{ParticleEvent, ParticleRecord, TerminalRecords};
use crate::router::{EffectsRouter, RouterFeedback};
use crate::services::{ServiceCalls, ServiceRegistry};
use crate::stats::{bump, PipelineStats, StatsCounters};
use crate::vm::{backend_factory, VmFactory};
use crate::vm_pool::VmPool;

/// Collaborators a node is built from.
pub struct NodeParams {
    pub config: NodeConfig,
    pub signer: Arc<dyn Signer>,
    pub verifier: Arc<dyn Verifier>,
    pub resolver: Arc<dyn PeerResolver>,
    pub services: Arc<dyn ServiceCalls>,
    /// Overrides the interpreter selected by `config.vm_pool.backend`.
    pub vm_factory: Option<VmFactory>,
}

impl NodeParams {
    /// Ed25519 verification, an empty static resolver and the builtin services.
    pub fn new(config: NodeConfig, signer: Arc<dyn Signer>) -> Self {
        Self {
            config,
            signer,
            verifier: Arc::new(Ed25519Verifier),
            resolver: Arc::new(StaticResolver::default()),
            services: Arc::new(ServiceRegistry::with_builtins()),
            vm_factory: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn PeerResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_services(mut self, services: Arc<dyn ServiceCalls>) -> Self {
        self.services = services;
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_vm_factory(mut self, factory: VmFactory) -> Self {
        self.vm_factory = Some(factory);
        self
    }
}

struct Pipeline {
    config: NodeConfig,
    peer_id: PeerId,
    verifier: Arc<dyn Verifier>,
    plumber: Arc<Plumber>,
    records: Arc<TerminalRecords>,
    stats: Arc<StatsCounters>,
}

impl Pipeline {
    fn ingest(&self, particle: Particle) -> Result<Ingested, IngestError> {
        if let Err(err) = verify_particle(&particle, self.verifier.as_ref()) {
            bump(&self.stats.rejected);
            return Err(err);
        }
        let id = particle.id.clone();
        let ingested = self.plumber.admit(particle, now_ms())?;
        trace!(particle_id = %id, ?ingested, "particle ingested");
        Ok(ingested)
    }

    fn ingest_bytes(&self, from: PeerId, bytes: &[u8]) -> Result<Ingested, IngestError> {
        let particle = decode_particle_cbor(bytes).map_err(|err| {
            bump(&self.stats.rejected);
            debug!(peer = %from, "undecodable particle: {err}");
            IngestError::Malformed(err)
        })?;
        self.ingest(particle)
    }

    fn on_network(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::Particle { from, bytes } => {
                if let Err(err) = self.ingest_bytes(from, &bytes) {
                    debug!(peer = %from, "inbound particle refused: {err}");
                }
            }
            NetworkEvent::Connection(event) => self.plumber.router().on_connection(event),
        }
    }

    fn on_feedback(&self, feedback: RouterFeedback) {
        match feedback {
            RouterFeedback::CallResult {
                particle_id,
                call_id,
                result,
            } => self.plumber.on_call_result(&particle_id, call_id, result),
            RouterFeedback::DeliveryFault { particle_id, fault } => {
                bump(&self.stats.delivery_faults);
                self.plumber.on_delivery_fault(&particle_id, &fault);
                self.records.announce_fault(particle_id, fault);
            }
        }
    }
}

/// Handle to a running particle node. Cheap to clone.
///
/// Methods that schedule work must be called from within a tokio runtime.
#[derive(Clone)]
pub struct Node {
    pipeline: Arc<Pipeline>,
    signer: Arc<dyn Signer>,
    network: mpsc::UnboundedSender<NetworkEvent>,
}

/// Event loop half of a node; see [`NodeBackend::start`].
pub struct NodeBackend {
    pipeline: Arc<Pipeline>,
    network: mpsc::UnboundedReceiver<NetworkEvent>,
    feedback: mpsc::UnboundedReceiver<RouterFeedback>,
}

impl Node {
    /// Builds a node, its event loop and the outbound dispatch stream the
    /// connection layer must consume.
    pub fn new(params: NodeParams) -> (Node, NodeBackend, mpsc::UnboundedReceiver<DispatchRequest>) {
        let NodeParams {
            config,
            signer,
            verifier,
            resolver,
            services,
            vm_factory,
        } = params;
        let peer_id = signer.peer_id();
        let stats = Arc::new(StatsCounters::default());
        let records = Arc::new(TerminalRecords::new(
            config.terminal_record_capacity,
            config.event_buffer,
        ));

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        let (network_tx, network_rx) = mpsc::unbounded_channel();

        let router = EffectsRouter::new(
            peer_id,
            config.route_policy(),
            resolver,
            services,
            config.queue_shards,
            outbound_tx,
            feedback_tx,
            stats.clone(),
        );
        let factory = vm_factory.unwrap_or_else(|| backend_factory(config.vm_pool.backend));
        let pool = VmPool::with_factory(config.vm_pool.pool_size, factory);
        let plumber = Arc::new(Plumber::new(
            pool,
            config.queue_shards,
            router,
            records.clone(),
            stats.clone(),
        ));

        let pipeline = Arc::new(Pipeline {
            config,
            peer_id,
            verifier,
            plumber,
            records,
            stats,
        });
        let node = Node {
            pipeline: pipeline.clone(),
            signer,
            network: network_tx,
        };
        let backend = NodeBackend {
            pipeline,
            network: network_rx,
            feedback: feedback_rx,
        };
        (node, backend, outbound_rx)
    }

    pub fn peer_id(&self) -> PeerId {
        self.pipeline.peer_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.pipeline.config
    }

    /// Validates, dedups and schedules a particle.
    pub fn ingest(&self, particle: Particle) -> Result<Ingested, IngestError> {
        self.pipeline.ingest(particle)
    }

    /// Decodes the wire form received from `from`, then ingests it.
    pub fn ingest_bytes(&self, from: PeerId, bytes: &[u8]) -> Result<Ingested, IngestError> {
        self.pipeline.ingest_bytes(from, bytes)
    }

    pub fn connection_event(&self, event: ConnectionEvent) {
        self.pipeline.plumber.router().on_connection(event);
    }

    /// Sender the connection layer pushes inbound traffic into.
    pub fn network_sender(&self) -> mpsc::UnboundedSender<NetworkEvent> {
        self.network.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ParticleEvent> {
        self.pipeline.records.subscribe()
    }

    /// Current state; terminal states are served from the bounded record cache.
    pub fn state(&self, id: &ParticleId) -> Option<ParticleState> {
        self.pipeline.plumber.state(id)
    }

    pub fn record(&self, id: &ParticleId) -> Option<ParticleRecord> {
        self.pipeline.records.get(id)
    }

    pub fn stats(&self) -> PipelineStats {
        let plumber = &self.pipeline.plumber;
        PipelineStats {
            live_particles: plumber.live_particles() as u64,
            awaiting_peer: plumber.router().awaiting_peer_len() as u64,
            terminal_records: self.pipeline.records.len() as u64,
            ..self.pipeline.stats.snapshot()
        }
    }

    /// VMs currently leased by running steps.
    pub fn vms_in_use(&self) -> usize {
        self.pipeline.plumber.pool().in_use()
    }

    /// Signs a particle with the node key.
    pub fn sign(&self, particle: &mut Particle) -> Result<(), IngestError> {
        sign_particle(particle, self.signer.as_ref())
    }

    /// Creates a signed particle originating at this node.
    pub fn new_particle(&self, id: impl Into<ParticleId>, script: impl Into<String>) -> Result<Particle, IngestError> {
        let mut particle = Particle::new(
            id,
            self.peer_id(),
            now_ms(),
            self.pipeline.config.default_ttl_ms(),
            script,
        );
        self.sign(&mut particle)?;
        Ok(particle)
    }

    /// Creates a signed particle with a fresh uuid id.
    pub fn new_random_particle(&self, script: impl Into<String>) -> Result<Particle, IngestError> {
        self.new_particle(Uuid::new_v4().to_string(), script)
    }
}

impl NodeBackend {
    /// Runs the node loop until every [`Node`] handle is dropped.
    ///
    /// The loop consumes inbound network events, router feedback, and the
    /// expiry sweep timer. A running script storage owns a [`Node`] clone, so
    /// the loop outlives it until every [`ScriptStorageApi`] is dropped too.
    ///
    /// [`ScriptStorageApi`]: crate::script_storage::ScriptStorageApi
    pub fn start(self) -> JoinHandle<()> {
        let NodeBackend {
            pipeline,
            mut network,
            mut feedback,
        } = self;
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(pipeline.config.expiry_sweep_interval);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(peer = %pipeline.peer_id, pool_size = pipeline.plumber.pool().size(), "particle node started");

            loop {
                tokio::select! {
                    event = network.recv() => match event {
                        Some(event) => pipeline.on_network(event),
                        None => break,
                    },
                    Some(item) = feedback.recv() => pipeline.on_feedback(item),
                    _ = sweep.tick() => {
                        let expired = pipeline.plumber.sweep_expired(now_ms());
                        if expired > 0 {
                            debug!(expired, "expiry sweep");
                        }
                    }
                }
            }

            let dropped = pipeline.plumber.drain();
            if dropped > 0 {
                warn!(dropped, "node stopped with waiting particles");
            }
            info!(peer = %pipeline.peer_id, "particle node stopped");
        })
    }
}
