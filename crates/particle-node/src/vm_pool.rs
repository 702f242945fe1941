use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};

use particle_codec::Particle;
use tracing::warn;

use crate::config::VmPoolConfig;
use crate::effects::{CallResults, VmOutcome};
use crate::vm::{backend_factory, ParticleVm, VmFactory, VmFault};

/// Exclusive lease on one interpreter instance.
///
/// The handle owns the VM while leased, so releasing it twice or running one
/// VM from two places cannot be expressed.
pub struct VmHandle {
    slot: usize,
    vm: Box<dyn ParticleVm>,
}

impl VmHandle {
    /// Stable index of the leased instance within the pool.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Runs one step, turning an interpreter panic into a fault.
    pub fn run(&mut self, particle: &Particle, call_results: &CallResults) -> Result<VmOutcome, VmFault> {
        let vm = &mut self.vm;
        match panic::catch_unwind(AssertUnwindSafe(|| vm.run(particle, call_results))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(slot = self.slot, particle_id = %particle.id, "vm panicked: {message}");
                Err(VmFault::Panicked(message))
            }
        }
    }
}

impl std::fmt::Debug for VmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmHandle").field("slot", &self.slot).finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Fixed-size set of interpreter instances.
pub struct VmPool {
    idle: Mutex<Vec<VmHandle>>,
    size: usize,
}

impl VmPool {
    pub fn from_config(config: VmPoolConfig) -> Self {
        Self::with_factory(config.pool_size, backend_factory(config.backend))
    }

    /// Builds `size` instances up front; a zero size is raised to one.
    pub fn with_factory(size: usize, factory: VmFactory) -> Self {
        let size = size.max(1);
        let idle = (0..size)
            .rev()
            .map(|slot| VmHandle {
                slot,
                vm: factory(),
            })
            .collect();
        Self {
            idle: Mutex::new(idle),
            size,
        }
    }

    /// Leases an idle VM; `None` means the pool is exhausted right now.
    pub fn try_acquire(&self) -> Option<VmHandle> {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    pub fn release(&self, handle: VmHandle) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn in_use(&self) -> usize {
        self.size - self.idle_count()
    }
}
