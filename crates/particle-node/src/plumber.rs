use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use particle_codec::Particle;
use particle_core::clock::now_ms;
use particle_core::{CallId, ParticleId, PeerId};
use tracing::{debug, error, trace, warn};

use crate::effects::{
    AwaitedParticle, CallResults, CallServiceResult, StepperEffects, WaitReason,
};
use crate::ingest::{IngestError, Ingested};
use crate::records::{ParticleOutcome, TerminalRecords};
use crate::router::{DeliveryFault, EffectsRouter};
use crate::stats::{bump, StatsCounters};
use crate::vm_pool::{VmHandle, VmPool};
use crate::waiting_queues::WaitingQueues;

/// Lifecycle of a particle on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticleState {
    Queued,
    Running,
    Waiting(WaitReason),
    Completed,
    Expired,
    Faulted,
}

impl ParticleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Expired | Self::Faulted)
    }
}

impl From<&ParticleOutcome> for ParticleState {
    fn from(outcome: &ParticleOutcome) -> Self {
        match outcome {
            ParticleOutcome::Completed => Self::Completed,
            ParticleOutcome::Expired => Self::Expired,
            ParticleOutcome::Faulted(_) => Self::Faulted,
        }
    }
}

struct Entry {
    state: ParticleState,
    /// Call results that arrived while the particle was not parked on them.
    inbox: CallResults,
    /// Call ids already handed to services; a VM may re-emit them while unresolved.
    issued: BTreeSet<CallId>,
    delivery_faults: Vec<DeliveryFault>,
    deadline_ms: u64,
}

type Table = HashMap<ParticleId, Entry>;

/// Drives particles through the VM pool.
///
/// Lock order: particle table, then lane ring, then queue shards. No lock is
/// held across a VM run or an await.
pub(crate) struct Plumber {
    pool: VmPool,
    table: Mutex<Table>,
    /// Init peers with a non-empty AwaitingVm lane, served round-robin.
    ring: Mutex<VecDeque<PeerId>>,
    lanes: WaitingQueues<PeerId, AwaitedParticle>,
    call_waiters: WaitingQueues<(ParticleId, CallId), AwaitedParticle>,
    router: EffectsRouter,
    records: Arc<TerminalRecords>,
    stats: Arc<StatsCounters>,
}

impl Plumber {
    pub(crate) fn new(
        pool: VmPool,
        queue_shards: usize,
        router: EffectsRouter,
        records: Arc<TerminalRecords>,
        stats: Arc<StatsCounters>,
    ) -> Self {
        Self {
            pool,
            table: Mutex::new(HashMap::new()),
            ring: Mutex::new(VecDeque::new()),
            lanes: WaitingQueues::with_shards(queue_shards),
            call_waiters: WaitingQueues::with_shards(queue_shards),
            router,
            records,
            stats,
        }
    }

    pub(crate) fn router(&self) -> &EffectsRouter {
        &self.router
    }

    pub(crate) fn pool(&self) -> &VmPool {
        &self.pool
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ring(&self) -> MutexGuard<'_, VecDeque<PeerId>> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dedups, checks expiry and schedules a validated particle.
    pub(crate) fn admit(self: &Arc<Self>, particle: Particle, now_ms: u64) -> Result<Ingested, IngestError> {
        {
            let mut table = self.table();
            if table.contains_key(&particle.id) {
                bump(&self.stats.duplicates);
                return Ok(Ingested::InFlight);
            }
            if let Some(record) = self.records.get(&particle.id) {
                bump(&self.stats.duplicates);
                return Ok(Ingested::AlreadyFinished(record.outcome));
            }
            if particle.is_expired(now_ms) {
                bump(&self.stats.rejected);
                return Err(IngestError::Expired {
                    particle_id: particle.id.clone(),
                    deadline_ms: particle.deadline_ms(),
                    now_ms,
                });
            }

            table.insert(
                particle.id.clone(),
                Entry {
                    state: ParticleState::Queued,
                    inbox: CallResults::new(),
                    issued: BTreeSet::new(),
                    delivery_faults: Vec::new(),
                    deadline_ms: particle.deadline_ms(),
                },
            );
            bump(&self.stats.ingested);
            self.enqueue_for_vm(&mut table, AwaitedParticle::new(particle));
        }
        self.pump();
        Ok(Ingested::Accepted)
    }

    fn enqueue_for_vm(&self, table: &mut Table, awaited: AwaitedParticle) {
        let id = awaited.particle.id.clone();
        if let Some(entry) = table.get_mut(&id) {
            entry.state = ParticleState::Waiting(WaitReason::AwaitingVm);
        }
        let lane = awaited.particle.init_peer_id;
        let mut ring = self.ring();
        self.lanes.enqueue(lane, awaited.waiting_for(WaitReason::AwaitingVm));
        if self.lanes.len_of(&lane) == 1 {
            ring.push_back(lane);
        }
        trace!(particle_id = %id, "particle waiting for vm");
    }

    /// Pops the next live particle, round-robin over lanes, and marks it running.
    fn next_runnable(&self, table: &mut Table, now_ms: u64) -> Option<AwaitedParticle> {
        loop {
            let mut awaited = {
                let mut ring = self.ring();
                let lane = ring.pop_front()?;
                let Some(awaited) = self.lanes.pop_front(&lane) else {
                    continue;
                };
                if self.lanes.contains_key(&lane) {
                    ring.push_back(lane);
                }
                awaited
            };

            let id = awaited.particle.id.clone();
            if awaited.particle.is_expired(now_ms) {
                self.finish(table, &id, ParticleOutcome::Expired);
                continue;
            }
            let Some(entry) = table.get_mut(&id) else {
                warn!(particle_id = %id, "queued particle has no table entry");
                continue;
            };
            for (call_id, result) in std::mem::take(&mut entry.inbox) {
                awaited.call_results.entry(call_id).or_insert(result);
            }
            entry.state = ParticleState::Running;
            return Some(awaited);
        }
    }

    fn has_runnable(&self) -> bool {
        !self.ring().is_empty()
    }

    /// Starts as many steps as there are idle VMs and waiting particles.
    pub(crate) fn pump(self: &Arc<Self>) {
        loop {
            let Some(vm) = self.pool.try_acquire() else {
                return;
            };
            let next = {
                let mut table = self.table();
                self.next_runnable(&mut table, now_ms())
            };
            match next {
                Some(awaited) => {
                    let this = Arc::clone(self);
                    tokio::spawn(async move { this.run_step(vm, awaited).await });
                }
                None => {
                    self.pool.release(vm);
                    // a producer may have enqueued while we held the vm
                    if !self.has_runnable() {
                        return;
                    }
                }
            }
        }
    }

    async fn run_step(self: Arc<Self>, vm: VmHandle, awaited: AwaitedParticle) {
        let AwaitedParticle {
            mut particle,
            call_results,
            ..
        } = awaited;
        let id = particle.id.clone();
        bump(&self.stats.vm_runs);
        trace!(particle_id = %id, slot = vm.slot(), "running particle");

        let joined = tokio::task::spawn_blocking(move || {
            let mut vm = vm;
            let result = vm.run(&particle, &call_results);
            (vm, particle, call_results, result)
        })
        .await;
        let (vm, run_particle, call_results, result) = match joined {
            Ok(done) => done,
            Err(err) => {
                error!(particle_id = %id, "vm task did not finish: {err}");
                let mut table = self.table();
                self.finish(&mut table, &id, ParticleOutcome::Faulted(err.to_string()));
                return;
            }
        };
        particle = run_particle;
        self.pool.release(vm);

        match result {
            Err(fault) => {
                debug!(particle_id = %id, "vm fault: {fault}");
                let mut table = self.table();
                self.finish(&mut table, &id, ParticleOutcome::Faulted(fault.to_string()));
            }
            Ok(_) if particle.is_expired(now_ms()) => {
                debug!(particle_id = %id, "particle expired during its step, effects discarded");
                let mut table = self.table();
                self.finish(&mut table, &id, ParticleOutcome::Expired);
            }
            Ok(outcome) => {
                particle.data = outcome.data.clone();
                let pending = outcome.call_requests.iter().map(|c| c.call_id).min();
                let mut effects = StepperEffects::from_outcome(&particle, &outcome);
                if let Some(entry) = self.table().get_mut(&id) {
                    effects
                        .call_requests
                        .retain(|request| entry.issued.insert(request.call_id));
                }
                self.router.apply(&particle, effects);

                let mut table = self.table();
                match pending {
                    None => self.finish(&mut table, &id, ParticleOutcome::Completed),
                    Some(call_id) => self.park(&mut table, particle, call_results, call_id),
                }
            }
        }
        self.pump();
    }

    fn park(&self, table: &mut Table, particle: Particle, call_results: CallResults, call_id: CallId) {
        let id = particle.id.clone();
        let Some(entry) = table.get_mut(&id) else {
            return;
        };
        let awaited = AwaitedParticle {
            particle,
            call_results,
            reason: WaitReason::AwaitingCallResult(call_id),
        };
        if entry.inbox.contains_key(&call_id) {
            // the result beat us here
            self.enqueue_for_vm(table, awaited);
        } else {
            entry.state = ParticleState::Waiting(WaitReason::AwaitingCallResult(call_id));
            self.call_waiters.enqueue((id.clone(), call_id), awaited);
            trace!(particle_id = %id, call_id, "particle waiting for call result");
        }
    }

    /// Records a service call result and wakes the particle if it waits on it.
    pub(crate) fn on_call_result(self: &Arc<Self>, id: &ParticleId, call_id: CallId, result: CallServiceResult) {
        let woke = {
            let mut table = self.table();
            let Some(entry) = table.get_mut(id) else {
                trace!(particle_id = %id, call_id, "dropping result for finished particle");
                return;
            };
            entry.inbox.entry(call_id).or_insert(result);
            if entry.state != ParticleState::Waiting(WaitReason::AwaitingCallResult(call_id)) {
                false
            } else {
                let now = now_ms();
                let mut woke = false;
                for awaited in self.call_waiters.take(&(id.clone(), call_id)) {
                    if awaited.particle.is_expired(now) {
                        self.finish(&mut table, id, ParticleOutcome::Expired);
                    } else {
                        self.enqueue_for_vm(&mut table, awaited);
                        woke = true;
                    }
                }
                woke
            }
        };
        if woke {
            self.pump();
        }
    }

    /// Attaches a delivery fault to the live entry or to the terminal record.
    pub(crate) fn on_delivery_fault(&self, id: &ParticleId, fault: &DeliveryFault) {
        let mut table = self.table();
        match table.get_mut(id) {
            Some(entry) => entry.delivery_faults.push(fault.clone()),
            None => {
                self.records.attach_fault(id, fault);
            }
        }
    }

    /// Expires every waiting particle past its deadline.
    pub(crate) fn sweep_expired(&self, now_ms: u64) -> usize {
        let mut table = self.table();
        let mut expired = {
            let mut ring = self.ring();
            let expired = self
                .lanes
                .remove_where(|_, awaited| awaited.particle.is_expired(now_ms));
            ring.retain(|lane| self.lanes.contains_key(lane));
            expired.into_iter().map(|(_, a)| a.particle.id).collect::<Vec<_>>()
        };
        expired.extend(
            self.call_waiters
                .remove_where(|_, awaited| awaited.particle.is_expired(now_ms))
                .into_iter()
                .map(|((id, _), _)| id),
        );
        for id in &expired {
            self.finish(&mut table, id, ParticleOutcome::Expired);
        }
        drop(table);
        expired.len() + self.router.sweep_expired(now_ms)
    }

    fn finish(&self, table: &mut Table, id: &ParticleId, outcome: ParticleOutcome) {
        let Some(entry) = table.remove(id) else {
            return;
        };
        match &outcome {
            ParticleOutcome::Completed => bump(&self.stats.completed),
            ParticleOutcome::Expired => bump(&self.stats.expired),
            ParticleOutcome::Faulted(_) => bump(&self.stats.faulted),
        }
        debug!(particle_id = %id, ?outcome, "particle finished");
        self.records
            .finish(id.clone(), outcome, entry.delivery_faults, entry.deadline_ms);
    }

    pub(crate) fn state(&self, id: &ParticleId) -> Option<ParticleState> {
        let table = self.table();
        if let Some(entry) = table.get(id) {
            return Some(entry.state.clone());
        }
        self.records.get(id).map(|record| ParticleState::from(&record.outcome))
    }

    pub(crate) fn live_particles(&self) -> usize {
        self.table().len()
    }

    /// Drops every waiting particle; used on shutdown.
    pub(crate) fn drain(&self) -> usize {
        let mut table = self.table();
        let mut ring = self.ring();
        ring.clear();
        let dropped = self.lanes.remove_all().into_values().map(|v| v.len()).sum::<usize>()
            + self
                .call_waiters
                .remove_all()
                .into_values()
                .map(|v| v.len())
                .sum::<usize>();
        table.retain(|_, entry| entry.state == ParticleState::Running);
        dropped
    }
}
