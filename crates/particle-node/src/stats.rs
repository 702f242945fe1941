use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of pipeline counters and gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub ingested: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub vm_runs: u64,
    pub completed: u64,
    pub expired: u64,
    pub faulted: u64,
    pub particles_dispatched: u64,
    pub delivery_faults: u64,
    pub service_calls: u64,
    /// Particles not yet terminal.
    pub live_particles: u64,
    /// Sends parked until their target connects.
    pub awaiting_peer: u64,
    /// Entries in the terminal record cache.
    pub terminal_records: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub ingested: AtomicU64,
    pub duplicates: AtomicU64,
    pub rejected: AtomicU64,
    pub vm_runs: AtomicU64,
    pub completed: AtomicU64,
    pub expired: AtomicU64,
    pub faulted: AtomicU64,
    pub particles_dispatched: AtomicU64,
    pub delivery_faults: AtomicU64,
    pub service_calls: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl StatsCounters {
    pub(crate) fn snapshot(&self) -> PipelineStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PipelineStats {
            ingested: load(&self.ingested),
            duplicates: load(&self.duplicates),
            rejected: load(&self.rejected),
            vm_runs: load(&self.vm_runs),
            completed: load(&self.completed),
            expired: load(&self.expired),
            faulted: load(&self.faulted),
            particles_dispatched: load(&self.particles_dispatched),
            delivery_faults: load(&self.delivery_faults),
            service_calls: load(&self.service_calls),
            ..PipelineStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{bump, StatsCounters};

    #[test]
    fn snapshot_reflects_bumps() {
        let counters = StatsCounters::default();
        bump(&counters.vm_runs);
        bump(&counters.vm_runs);
        bump(&counters.completed);

        let snap = counters.snapshot();
        assert_eq!(snap.vm_runs, 2);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.faulted, 0);
    }
}
