use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};

use particle_codec::particle::decode_particle_cbor;
use particle_codec::Particle;
use particle_core::clock::now_ms;
use particle_core::{CallId, Contact, ParticleId, PeerId};
use particle_crypto::signing::{Ed25519Signer, Signer};
use particle_node::effects::{CallRequest, CallResults, VmOutcome, WaitReason};
use particle_node::ingest::sign_particle;
use particle_node::records::ParticleEvent;
use particle_node::router::DispatchFailure;
use particle_node::services::{CallParams, ServiceCallError, ServiceCalls};
use particle_node::vm::{ParticleVm, VmFactory, VmFault};
use particle_node::{
    IngestError, Ingested, Node, NodeConfig, NodeParams, ParticleOutcome, ParticleState, VmBackend,
    VmPoolConfig,
};
use particle_transport::adapter::InMemoryAdapter;
use particle_transport::dispatch::{drive_dispatches, DispatchOutcome, DispatchRequest};
use particle_transport::events::{ConnectionEvent, NetworkEvent};
use particle_transport::routing::StaticResolver;
use serde_json::{json, Value as JValue};
use tokio::sync::mpsc;

struct TestNode {
    node: Node,
    signer: Arc<Ed25519Signer>,
    resolver: Arc<StaticResolver>,
    outbound: mpsc::UnboundedReceiver<DispatchRequest>,
}

fn config(pool_size: usize, backend: VmBackend) -> NodeConfig {
    NodeConfig {
        vm_pool: VmPoolConfig { pool_size, backend },
        route_retry_backoff: Duration::from_millis(10),
        expiry_sweep_interval: Duration::from_millis(50),
        ..NodeConfig::default()
    }
}

fn spawn_node(config: NodeConfig, secret: u8, factory: Option<VmFactory>) -> TestNode {
    let signer = Arc::new(Ed25519Signer::from_secret([secret; 32]));
    let resolver = Arc::new(StaticResolver::default());
    let mut params = NodeParams::new(config, signer.clone()).with_resolver(resolver.clone());
    if let Some(factory) = factory {
        params = params.with_vm_factory(factory);
    }
    let (node, backend, outbound) = Node::new(params);
    backend.start();
    TestNode {
        node,
        signer,
        resolver,
        outbound,
    }
}

fn peer(secret: u8) -> PeerId {
    Ed25519Signer::from_secret([secret; 32]).peer_id()
}

fn signed_particle(signer: &Ed25519Signer, id: &str, script: &str) -> Particle {
    let mut particle = Particle::new(id, signer.peer_id(), now_ms(), 30_000, script);
    sign_particle(&mut particle, signer).expect("particle should sign");
    particle
}

async fn wait_for_state(node: &Node, id: &str, want: ParticleState) {
    let id = ParticleId::new(id);
    for _ in 0..400 {
        if node.state(&id).as_ref() == Some(&want) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{id} never reached {want:?}, last state {:?}", node.state(&id));
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[derive(Clone, Default)]
struct Gate(Arc<(Mutex<bool>, Condvar)>);

impl Gate {
    fn open(&self) {
        let (open, cvar) = &*self.0;
        *open.lock().expect("gate lock") = true;
        cvar.notify_all();
    }

    fn wait(&self) {
        let (open, cvar) = &*self.0;
        let mut guard = open.lock().expect("gate lock");
        while !*guard {
            guard = cvar.wait(guard).expect("gate wait");
        }
    }
}

/// Blocks every run until the gate opens, recording the run order.
struct GatedVm {
    gate: Gate,
    order: Arc<Mutex<Vec<String>>>,
}

impl ParticleVm for GatedVm {
    fn run(&mut self, particle: &Particle, _: &CallResults) -> Result<VmOutcome, VmFault> {
        self.order
            .lock()
            .expect("order lock")
            .push(particle.id.to_string());
        self.gate.wait();
        Ok(VmOutcome::default())
    }
}

fn gated_factory(gate: &Gate, order: &Arc<Mutex<Vec<String>>>) -> VmFactory {
    let gate = gate.clone();
    let order = order.clone();
    Arc::new(move || {
        Box::new(GatedVm {
            gate: gate.clone(),
            order: order.clone(),
        }) as Box<dyn ParticleVm>
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn call_service_then_send_dispatches_exactly_once() {
    let mut a = spawn_node(config(2, VmBackend::Line), 0xA1, None);
    let b = peer(0xB1);
    a.resolver.insert(Contact::new(b, vec!["mem/b".into()]));

    let particle = signed_particle(
        &a.signer,
        "e2e-1",
        &format!("call op identity \"hello\"\nnext {b}"),
    );
    assert_eq!(a.node.ingest(particle), Ok(Ingested::Accepted));

    let request = a.outbound.recv().await.expect("one dispatch");
    assert_eq!(request.contact.peer_id, b);
    let sent = decode_particle_cbor(&request.bytes).expect("dispatched bytes decode");
    assert_eq!(sent.id.as_str(), "e2e-1");
    assert!(!sent.data.is_empty());
    request.complete(DispatchOutcome::Delivered);

    wait_for_state(&a.node, "e2e-1", ParticleState::Completed).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(a.outbound.try_recv().is_err(), "no duplicate dispatch");

    let stats = a.node.stats();
    assert_eq!(stats.vm_runs, 2);
    assert_eq!(stats.service_calls, 1);
    assert_eq!(stats.particles_dispatched, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn particle_hops_between_two_nodes() {
    let a = spawn_node(config(2, VmBackend::Line), 0xA2, None);
    let b = spawn_node(config(2, VmBackend::Line), 0xB2, None);
    let b_id = b.node.peer_id();
    a.resolver
        .insert(Contact::new(b_id, vec!["mem/b".into()]));

    // A's outbound goes straight into B's inbound
    let adapter = Arc::new(Mutex::new(InMemoryAdapter::default()));
    tokio::spawn(drive_dispatches(adapter.clone(), a.outbound));

    let particle = signed_particle(
        &a.signer,
        "hop-1",
        &format!("call op identity 1\nnext {b_id}\ncall peer identify"),
    );
    a.node.ingest(particle).expect("accepted on A");
    wait_for_state(&a.node, "hop-1", ParticleState::Completed).await;

    wait_until(|| a.node.stats().particles_dispatched == 1).await;
    let sent = adapter.lock().expect("adapter").take_outbound();
    assert_eq!(sent.len(), 1);
    let network = b.node.network_sender();
    for (_, bytes) in sent {
        network
            .send(NetworkEvent::Particle {
                from: a.node.peer_id(),
                bytes,
            })
            .expect("B loop alive");
    }

    wait_for_state(&b.node, "hop-1", ParticleState::Completed).await;
    assert_eq!(b.node.stats().service_calls, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_exhaustion_leaves_extra_particle_waiting_for_vm() {
    let gate = Gate::default();
    let order = Arc::new(Mutex::new(Vec::new()));
    let a = spawn_node(
        config(2, VmBackend::Noop),
        0xA3,
        Some(gated_factory(&gate, &order)),
    );

    for id in ["x-1", "x-2", "x-3"] {
        a.node
            .ingest(signed_particle(&a.signer, id, "gated"))
            .expect("accepted");
    }
    wait_until(|| a.node.vms_in_use() == 2).await;

    assert_eq!(a.node.state(&"x-1".into()), Some(ParticleState::Running));
    assert_eq!(a.node.state(&"x-2".into()), Some(ParticleState::Running));
    assert_eq!(
        a.node.state(&"x-3".into()),
        Some(ParticleState::Waiting(WaitReason::AwaitingVm))
    );

    gate.open();
    for id in ["x-1", "x-2", "x-3"] {
        wait_for_state(&a.node, id, ParticleState::Completed).await;
    }
    assert_eq!(a.node.vms_in_use(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lanes_are_served_round_robin() {
    let gate = Gate::default();
    let order = Arc::new(Mutex::new(Vec::new()));
    let a = spawn_node(
        config(1, VmBackend::Noop),
        0xA4,
        Some(gated_factory(&gate, &order)),
    );
    let other = Ed25519Signer::from_secret([0xC4; 32]);

    a.node
        .ingest(signed_particle(&a.signer, "a-1", "gated"))
        .expect("accepted");
    wait_until(|| a.node.vms_in_use() == 1).await;
    for (signer, id) in [
        (a.signer.as_ref(), "a-2"),
        (a.signer.as_ref(), "a-3"),
        (&other, "c-1"),
    ] {
        a.node
            .ingest(signed_particle(signer, id, "gated"))
            .expect("accepted");
    }

    gate.open();
    wait_for_state(&a.node, "a-3", ParticleState::Completed).await;
    wait_for_state(&a.node, "c-1", ParticleState::Completed).await;
    assert_eq!(
        *order.lock().expect("order lock"),
        vec!["a-1", "a-2", "c-1", "a-3"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reingesting_finished_particle_is_a_noop() {
    let mut a = spawn_node(config(2, VmBackend::Line), 0xA5, None);
    let b = peer(0xB5);
    a.resolver.insert(Contact::new(b, vec!["mem/b".into()]));

    let particle = signed_particle(&a.signer, "dup-1", &format!("next {b}"));
    a.node.ingest(particle.clone()).expect("accepted");
    let request = a.outbound.recv().await.expect("dispatch");
    request.complete(DispatchOutcome::Delivered);
    wait_for_state(&a.node, "dup-1", ParticleState::Completed).await;

    assert_eq!(
        a.node.ingest(particle),
        Ok(Ingested::AlreadyFinished(ParticleOutcome::Completed))
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(a.outbound.try_recv().is_err());
    assert_eq!(a.node.stats().duplicates, 1);
    assert_eq!(a.node.stats().vm_runs, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_particle_is_rejected_and_never_runs() {
    let a = spawn_node(config(2, VmBackend::Line), 0xA6, None);
    let mut particle = Particle::new("old-1", a.node.peer_id(), now_ms() - 10_000, 1_000, "call op noop");
    sign_particle(&mut particle, a.signer.as_ref()).expect("signed");

    assert!(matches!(
        a.node.ingest(particle),
        Err(IngestError::Expired { .. })
    ));
    assert_eq!(a.node.state(&"old-1".into()), None);
    assert_eq!(a.node.stats().vm_runs, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_service_call_faults_particle() {
    let a = spawn_node(config(2, VmBackend::Line), 0xA7, None);
    let mut events = a.node.subscribe();
    a.node
        .ingest(signed_particle(&a.signer, "fault-1", "call nowhere nothing"))
        .expect("accepted");

    wait_for_state(&a.node, "fault-1", ParticleState::Faulted).await;
    let record = a.node.record(&"fault-1".into()).expect("terminal record");
    match record.outcome {
        ParticleOutcome::Faulted(reason) => assert!(reason.contains("nowhere"), "{reason}"),
        other => panic!("unexpected outcome {other:?}"),
    }
    let event = events.recv().await.expect("finish event");
    assert_eq!(event.particle_id().as_str(), "fault-1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delivery_retries_alternate_contact() {
    let a = spawn_node(config(2, VmBackend::Line), 0xA8, None);
    let b = peer(0xB8);
    a.resolver.insert(Contact::new(b, vec!["mem/b-down".into()]));
    a.resolver.insert(Contact::new(b, vec!["mem/b-up".into()]));

    let mut adapter = InMemoryAdapter::default();
    adapter.set_address_reachable("mem/b-down", false);
    let adapter = Arc::new(Mutex::new(adapter));
    tokio::spawn(drive_dispatches(adapter.clone(), a.outbound));

    a.node
        .ingest(signed_particle(&a.signer, "retry-1", &format!("next {b}")))
        .expect("accepted");
    wait_until(|| a.node.stats().particles_dispatched == 1).await;

    let sent = adapter.lock().expect("adapter").take_outbound();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.addresses, vec!["mem/b-up".to_string()]);
    assert_eq!(a.node.stats().delivery_faults, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_retries_surface_delivery_fault() {
    let a = spawn_node(config(2, VmBackend::Line), 0xA9, None);
    let b = peer(0xB9);
    a.resolver.insert(Contact::new(b, vec!["mem/b1".into()]));
    a.resolver.insert(Contact::new(b, vec!["mem/b2".into()]));
    let mut events = a.node.subscribe();

    let mut adapter = InMemoryAdapter::default();
    adapter.set_peer_reachable(b, false);
    tokio::spawn(drive_dispatches(Arc::new(Mutex::new(adapter)), a.outbound));

    a.node
        .ingest(signed_particle(&a.signer, "lost-1", &format!("next {b}")))
        .expect("accepted");

    let fault = loop {
        match events.recv().await.expect("event stream open") {
            ParticleEvent::DeliveryFailed { particle_id, fault } => {
                assert_eq!(particle_id.as_str(), "lost-1");
                break fault;
            }
            ParticleEvent::Finished { .. } => continue,
        }
    };
    assert_eq!(fault.target, b);
    assert_eq!(fault.attempts, 3);
    assert!(matches!(fault.failure, DispatchFailure::Transport(_)));

    let record = a.node.record(&"lost-1".into()).expect("record kept");
    assert_eq!(record.outcome, ParticleOutcome::Completed);
    assert_eq!(record.delivery_faults, vec![fault]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn send_waits_for_peer_until_connected() {
    let mut a = spawn_node(config(2, VmBackend::Line), 0xAA, None);
    let b = peer(0xBA);

    a.node
        .ingest(signed_particle(&a.signer, "wait-1", &format!("next {b}")))
        .expect("accepted");
    wait_for_state(&a.node, "wait-1", ParticleState::Completed).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(a.outbound.try_recv().is_err(), "nothing to send to yet");
    assert_eq!(a.node.stats().awaiting_peer, 1);

    a.node
        .connection_event(ConnectionEvent::Connected(Contact::new(b, vec!["mem/b".into()])));
    let request = a.outbound.recv().await.expect("released on connect");
    assert_eq!(request.contact.peer_id, b);
    assert_eq!(a.node.stats().awaiting_peer, 0);
    request.complete(DispatchOutcome::Delivered);
}

/// Records every invocation; call 1 answers only after a delay.
#[derive(Default)]
struct CountingServices {
    invocations: Mutex<Vec<CallId>>,
}

impl CountingServices {
    fn invocations(&self) -> Vec<CallId> {
        self.invocations.lock().expect("invocations").clone()
    }
}

impl ServiceCalls for CountingServices {
    fn invoke(
        &self,
        _: CallParams,
        request: CallRequest,
    ) -> BoxFuture<'static, Result<JValue, ServiceCallError>> {
        self.invocations
            .lock()
            .expect("invocations")
            .push(request.call_id);
        let delay = if request.call_id == 1 { 200 } else { 0 };
        async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(json!(request.call_id))
        }
        .boxed()
    }
}

fn call(call_id: CallId) -> CallRequest {
    CallRequest {
        call_id,
        service_id: "svc".into(),
        function_name: "f".into(),
        args: vec![],
    }
}

/// Emits every call whose result is still missing, like a stateless interpreter.
struct ReplayVm;

impl ParticleVm for ReplayVm {
    fn run(&mut self, _: &Particle, results: &CallResults) -> Result<VmOutcome, VmFault> {
        let call_requests = (0..2)
            .filter(|id| !results.contains_key(id))
            .map(call)
            .collect();
        Ok(VmOutcome {
            call_requests,
            ..VmOutcome::default()
        })
    }
}

/// Outlives short TTLs, then asks for a send and a service call.
struct SlowVm {
    spin: Duration,
    target: PeerId,
}

impl ParticleVm for SlowVm {
    fn run(&mut self, _: &Particle, _: &CallResults) -> Result<VmOutcome, VmFault> {
        std::thread::sleep(self.spin);
        Ok(VmOutcome {
            next_peers: vec![self.target],
            call_requests: vec![call(0)],
            ..VmOutcome::default()
        })
    }
}

fn spawn_with_services(factory: VmFactory, services: Arc<CountingServices>) -> TestNode {
    let signer = Arc::new(Ed25519Signer::from_secret([0xC7; 32]));
    let resolver = Arc::new(StaticResolver::default());
    let params = NodeParams::new(config(2, VmBackend::Noop), signer.clone())
        .with_resolver(resolver.clone())
        .with_services(services)
        .with_vm_factory(factory);
    let (node, backend, outbound) = Node::new(params);
    backend.start();
    TestNode {
        node,
        signer,
        resolver,
        outbound,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reemitted_pending_calls_are_invoked_once() {
    let services = Arc::new(CountingServices::default());
    let factory: VmFactory = Arc::new(|| Box::new(ReplayVm) as Box<dyn ParticleVm>);
    let a = spawn_with_services(factory, services.clone());

    let particle = signed_particle(&a.signer, "replay", "two calls");
    assert_eq!(a.node.ingest(particle), Ok(Ingested::Accepted));
    wait_for_state(&a.node, "replay", ParticleState::Completed).await;

    assert_eq!(services.invocations(), vec![0, 1]);
    assert_eq!(a.node.stats().service_calls, 2);
    assert!(a.node.stats().vm_runs >= 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn particle_expiring_mid_step_discards_effects() {
    let services = Arc::new(CountingServices::default());
    let b = peer(0xB7);
    let factory: VmFactory = Arc::new(move || {
        Box::new(SlowVm {
            spin: Duration::from_millis(300),
            target: b,
        }) as Box<dyn ParticleVm>
    });
    let mut a = spawn_with_services(factory, services.clone());
    a.resolver.insert(Contact::new(b, vec!["mem/b".into()]));

    let mut particle = Particle::new("late", a.signer.peer_id(), now_ms(), 100, "slow");
    sign_particle(&mut particle, a.signer.as_ref()).expect("particle should sign");
    assert_eq!(a.node.ingest(particle), Ok(Ingested::Accepted));

    wait_for_state(&a.node, "late", ParticleState::Expired).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(a.outbound.try_recv().is_err());
    assert!(services.invocations().is_empty());
    assert_eq!(a.node.stats().vm_runs, 1);
    assert_eq!(a.node.stats().particles_dispatched, 0);
}
