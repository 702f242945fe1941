use config::{Config, ConfigError, Environment, File};
use particle_core::{Contact, PeerId};
use particle_node::{NodeConfig, VmBackend, VmPoolConfig};
use particle_node::config::ScriptStorageConfig;
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// A script the relay stores at startup.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ScriptEntry {
    pub src: String,
    /// Runs once when absent.
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    pub log: String,
    pub node_key: Option<String>,
    pub pool_size: usize,
    pub vm_backend: VmBackend,
    #[serde(with = "humantime_serde")]
    pub particle_ttl: Duration,
    pub max_route_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub route_retry_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub expiry_sweep_interval: Duration,
    pub terminal_record_capacity: usize,
    pub queue_shards: usize,
    #[serde(with = "humantime_serde")]
    pub script_timer_resolution: Duration,
    pub script_max_failures: u8,
    #[serde(with = "humantime_serde")]
    pub stats_interval: Duration,
    /// `<peer-hex>@<address>` entries seeding the static resolver.
    #[serde(deserialize_with = "deserialize_list")]
    pub contacts: Vec<String>,
    #[serde(default)]
    pub scripts: Vec<ScriptEntry>,
}

fn deserialize_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ListVisitor;

    impl<'de> Visitor<'de> for ListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a sequence of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value
                .split(|c| c == ',' || c == ';')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect())
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: de::SeqAccess<'de>,
        {
            let mut vec = Vec::new();
            while let Some(element) = seq.next_element()? {
                vec.push(element);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(ListVisitor)
}

/// Splits a `<peer-hex>@<address>` contact entry.
pub fn parse_contact(entry: &str) -> Result<Contact, String> {
    let (peer, address) = entry
        .split_once('@')
        .ok_or_else(|| format!("contact `{entry}` is missing `@<address>`"))?;
    let peer_id: PeerId = peer
        .parse()
        .map_err(|err| format!("contact `{entry}`: {err}"))?;
    let address = address.trim();
    if address.is_empty() {
        return Err(format!("contact `{entry}` has an empty address"));
    }
    Ok(Contact::new(peer_id, vec![address.to_string()]))
}

impl RelayConfig {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("log", "info")?
            .set_default("node_key", None::<String>)?
            .set_default("pool_size", 4)?
            .set_default("vm_backend", "line")?
            .set_default("particle_ttl", "20s")?
            .set_default("max_route_attempts", 3)?
            .set_default("route_retry_backoff", "200ms")?
            .set_default("expiry_sweep_interval", "1s")?
            .set_default("terminal_record_capacity", 16_384)?
            .set_default("queue_shards", 16)?
            .set_default("script_timer_resolution", "3s")?
            .set_default("script_max_failures", 3)?
            .set_default("stats_interval", "30s")?
            .set_default("contacts", Vec::<String>::new())?;

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(Environment::with_prefix("PARTICLE_RELAY").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    /// Library config for the embedded node.
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            vm_pool: VmPoolConfig {
                pool_size: self.pool_size,
                backend: self.vm_backend,
            },
            default_particle_ttl: self.particle_ttl,
            max_route_attempts: self.max_route_attempts,
            route_retry_backoff: self.route_retry_backoff,
            expiry_sweep_interval: self.expiry_sweep_interval,
            terminal_record_capacity: self.terminal_record_capacity,
            queue_shards: self.queue_shards,
            script_storage: ScriptStorageConfig {
                timer_resolution: self.script_timer_resolution,
                max_failures: self.script_max_failures,
            },
            ..NodeConfig::default()
        }
    }
}
