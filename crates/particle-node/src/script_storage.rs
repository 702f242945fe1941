use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures_util::future::{self, BoxFuture, FutureExt, TryFutureExt};
use particle_core::ParticleId;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::Node;
use crate::config::ScriptStorageConfig;
use crate::records::{ParticleEvent, ParticleOutcome};

/// Prefix of particle ids created by the script runner.
pub const AUTO_PARTICLE_PREFIX: &str = "auto_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptStorageError {
    #[error("script storage is not running")]
    OutletError,
    #[error("script storage dropped the reply")]
    InletError,
}

/// Public view of a stored script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptInfo {
    pub id: String,
    pub src: String,
    pub interval: Option<Duration>,
    pub failures: u8,
}

#[derive(Debug, Clone)]
struct Script {
    src: String,
    failures: u8,
    /// `None` runs the script once.
    interval: Option<Duration>,
    executed_at: Option<Instant>,
}

impl Script {
    fn new(src: String, interval: Option<Duration>) -> Self {
        Self {
            src,
            failures: 0,
            interval,
            executed_at: None,
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        match (self.interval, self.executed_at) {
            (Some(interval), Some(at)) => at + interval <= now,
            _ => true,
        }
    }
}

struct SentParticle {
    script_id: String,
    deadline: Instant,
}

#[derive(Debug)]
enum Command {
    AddScript {
        id: String,
        src: String,
        interval: Option<Duration>,
    },
    RemoveScript {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    ListScripts {
        reply: oneshot::Sender<Vec<ScriptInfo>>,
    },
}

/// Client side of the script runner.
#[derive(Clone)]
pub struct ScriptStorageApi {
    outlet: mpsc::UnboundedSender<Command>,
}

impl ScriptStorageApi {
    fn send(&self, command: Command) -> Result<(), ScriptStorageError> {
        self.outlet
            .send(command)
            .map_err(|_| ScriptStorageError::OutletError)
    }

    /// Stores a script and returns its id. Without an interval it runs once.
    pub fn add_script(&self, src: String, interval: Option<Duration>) -> Result<String, ScriptStorageError> {
        let id = Uuid::new_v4().to_string();
        self.send(Command::AddScript {
            id: id.clone(),
            src,
            interval,
        })?;
        Ok(id)
    }

    pub fn remove_script(&self, id: String) -> BoxFuture<'static, Result<bool, ScriptStorageError>> {
        let (reply, inlet) = oneshot::channel();
        if let Err(err) = self.send(Command::RemoveScript { id, reply }) {
            return future::err(err).boxed();
        }
        inlet.map_err(|_| ScriptStorageError::InletError).boxed()
    }

    pub fn list_scripts(&self) -> BoxFuture<'static, Result<Vec<ScriptInfo>, ScriptStorageError>> {
        let (reply, inlet) = oneshot::channel();
        if let Err(err) = self.send(Command::ListScripts { reply }) {
            return future::err(err).boxed();
        }
        inlet.map_err(|_| ScriptStorageError::InletError).boxed()
    }
}

/// Runs stored scripts as locally originated particles.
///
/// Holds a [`Node`] handle for as long as it runs, which keeps the node loop
/// alive; dropping every [`ScriptStorageApi`] releases it.
pub struct ScriptStorageBackend {
    inlet: mpsc::UnboundedReceiver<Command>,
    node: Node,
    config: ScriptStorageConfig,
    scripts: HashMap<String, Script>,
    sent_particles: HashMap<ParticleId, SentParticle>,
}

impl ScriptStorageBackend {
    pub fn new(node: Node, config: ScriptStorageConfig) -> (ScriptStorageApi, Self) {
        let (outlet, inlet) = mpsc::unbounded_channel();
        let this = Self {
            inlet,
            node,
            config,
            scripts: HashMap::new(),
            sent_particles: HashMap::new(),
        };
        (ScriptStorageApi { outlet }, this)
    }

    /// Spawns the runner; it stops once every [`ScriptStorageApi`] is dropped.
    pub fn start(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut events = self.node.subscribe();
            let mut timer = tokio::time::interval(self.config.timer_resolution);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    command = self.inlet.recv() => match command {
                        Some(command) => self.execute_command(command),
                        None => break,
                    },
                    event = events.recv() => match event {
                        Ok(event) => self.on_particle_event(event),
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "script storage missed particle events");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = timer.tick() => {
                        self.execute_scripts();
                        self.cleanup();
                    }
                }
            }
            debug!("script storage stopped");
        })
    }

    fn execute_command(&mut self, command: Command) {
        match command {
            Command::AddScript { id, src, interval } => {
                info!(script_id = %id, ?interval, "script added");
                self.scripts.insert(id, Script::new(src, interval));
            }
            Command::RemoveScript { id, reply } => {
                let removed = self.scripts.remove(&id).is_some();
                reply.send(removed).ok();
            }
            Command::ListScripts { reply } => {
                let list = self
                    .scripts
                    .iter()
                    .map(|(id, s)| ScriptInfo {
                        id: id.clone(),
                        src: s.src.clone(),
                        interval: s.interval,
                        failures: s.failures,
                    })
                    .collect();
                reply.send(list).ok();
            }
        }
    }

    fn execute_scripts(&mut self) {
        let now = Instant::now();
        let mut due = Vec::new();
        self.scripts.retain(|id, script| {
            if script.interval.is_none() {
                due.push((id.clone(), script.src.clone()));
                return false;
            }
            if script.is_due(now) {
                script.executed_at = Some(now);
                due.push((id.clone(), script.src.clone()));
            }
            true
        });

        for (script_id, src) in due {
            let particle_id = format!("{AUTO_PARTICLE_PREFIX}{}", Uuid::new_v4());
            let particle = match self.node.new_particle(particle_id.as_str(), src) {
                Ok(particle) => particle,
                Err(err) => {
                    warn!(script_id = %script_id, "cannot build particle for script: {err}");
                    continue;
                }
            };
            self.sent_particles.insert(
                particle.id.clone(),
                SentParticle {
                    script_id: script_id.clone(),
                    deadline: now + self.node.config().default_particle_ttl,
                },
            );
            let id = particle.id.clone();
            if let Err(err) = self.node.ingest(particle) {
                warn!(script_id = %script_id, particle_id = %id, "script particle refused: {err}");
                self.record_failure(&id);
            }
        }
    }

    fn on_particle_event(&mut self, event: ParticleEvent) {
        if !event.particle_id().as_str().starts_with(AUTO_PARTICLE_PREFIX) {
            return;
        }
        match event {
            ParticleEvent::Finished {
                particle_id,
                outcome: ParticleOutcome::Completed,
            } => {
                // a later delivery fault is still reported while within the deadline
                if let Some(sent) = self.sent_particles.get(&particle_id) {
                    debug!(script_id = %sent.script_id, particle_id = %particle_id, "script particle completed");
                }
            }
            ParticleEvent::Finished { particle_id, .. }
            | ParticleEvent::DeliveryFailed { particle_id, .. } => self.record_failure(&particle_id),
        }
    }

    /// Counts one failure against the script that sent `particle_id`.
    fn record_failure(&mut self, particle_id: &ParticleId) {
        let Some(sent) = self.sent_particles.remove(particle_id) else {
            return;
        };
        let Some(script) = self.scripts.get_mut(&sent.script_id) else {
            return;
        };
        if script.failures + 1 < self.config.max_failures {
            script.failures += 1;
            debug!(script_id = %sent.script_id, failures = script.failures, "script particle failed");
        } else {
            self.scripts.remove(&sent.script_id);
            warn!(script_id = %sent.script_id, "script removed after too many failures");
        }
    }

    fn cleanup(&mut self) {
        let now = Instant::now();
        self.sent_particles.retain(|_, sent| sent.deadline > now);
    }
}

/// Convenience to run a storage next to a node.
pub fn spawn_script_storage(node: &Node) -> (ScriptStorageApi, JoinHandle<()>) {
    let (api, backend) = ScriptStorageBackend::new(node.clone(), node.config().script_storage);
    (api, backend.start())
}
