use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Interpreter implementation backing every VM in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmBackend {
    /// Line-oriented `call` / `next` interpreter.
    #[default]
    Line,
    /// Completes every particle immediately without effects.
    Noop,
}

/// Fixed VM pool shape, read once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmPoolConfig {
    /// Number of interpreter instances, i.e. max concurrent steps.
    pub pool_size: usize,
    pub backend: VmBackend,
}

impl Default for VmPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            backend: VmBackend::Line,
        }
    }
}

/// Delivery retry policy applied by the effects router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutePolicy {
    /// Total delivery attempts per send, across alternate contacts.
    pub max_attempts: u32,
    /// Fixed delay between consecutive attempts.
    pub backoff: Duration,
}

/// Periodic script runner settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptStorageConfig {
    /// How often the storage checks which scripts are due.
    pub timer_resolution: Duration,
    /// Failed runs after which a script is dropped.
    pub max_failures: u8,
}

impl Default for ScriptStorageConfig {
    fn default() -> Self {
        Self {
            timer_resolution: Duration::from_secs(3),
            max_failures: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub vm_pool: VmPoolConfig,
    /// TTL stamped on particles created by this node.
    pub default_particle_ttl: Duration,
    /// Delivery attempts per outbound particle before a delivery fault.
    pub max_route_attempts: u32,
    /// Delay between delivery attempts.
    pub route_retry_backoff: Duration,
    /// Interval of the sweep that expires parked particles.
    pub expiry_sweep_interval: Duration,
    /// Terminal records kept for dedup of retransmitted particles.
    pub terminal_record_capacity: usize,
    /// Lock shards per waiting queue.
    pub queue_shards: usize,
    /// Capacity of the particle event broadcast channel.
    pub event_buffer: usize,
    pub script_storage: ScriptStorageConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            vm_pool: VmPoolConfig::default(),
            default_particle_ttl: Duration::from_secs(20),
            max_route_attempts: 3,
            route_retry_backoff: Duration::from_millis(200),
            expiry_sweep_interval: Duration::from_secs(1),
            terminal_record_capacity: 16_384,
            queue_shards: 16,
            event_buffer: 1_024,
            script_storage: ScriptStorageConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Returns the delivery retry policy derived from config.
    pub fn route_policy(&self) -> RoutePolicy {
        RoutePolicy {
            max_attempts: self.max_route_attempts.max(1),
            backoff: self.route_retry_backoff,
        }
    }

    /// Default TTL clamped into the wire field.
    pub fn default_ttl_ms(&self) -> u32 {
        u32::try_from(self.default_particle_ttl.as_millis()).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{NodeConfig, VmBackend};

    #[test]
    fn route_policy_reflects_config_fields() {
        let cfg = NodeConfig {
            max_route_attempts: 5,
            route_retry_backoff: Duration::from_millis(7),
            ..NodeConfig::default()
        };

        let p = cfg.route_policy();
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.backoff, Duration::from_millis(7));
    }

    #[test]
    fn route_policy_always_allows_one_attempt() {
        let cfg = NodeConfig {
            max_route_attempts: 0,
            ..NodeConfig::default()
        };
        assert_eq!(cfg.route_policy().max_attempts, 1);
    }

    #[test]
    fn default_ttl_saturates_into_u32() {
        let cfg = NodeConfig {
            default_particle_ttl: Duration::from_secs(u64::MAX / 4),
            ..NodeConfig::default()
        };
        assert_eq!(cfg.default_ttl_ms(), u32::MAX);
        assert_eq!(NodeConfig::default().default_ttl_ms(), 20_000);
    }

    #[test]
    fn backend_names_are_snake_case() {
        let json = serde_json::to_string(&VmBackend::Noop).expect("backend should serialize");
        assert_eq!(json, "\"noop\"");
    }
}
