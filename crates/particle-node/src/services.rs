use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::{self, BoxFuture, FutureExt};
use particle_core::clock::now_ms;
use particle_core::{ParticleId, PeerId};
use serde::de::DeserializeOwned;
use serde_json::{json, Value as JValue};
use thiserror::Error;

use crate::effects::CallRequest;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceCallError {
    #[error("service `{0}` not found")]
    UnknownService(String),
    #[error("function `{function}` not found on service `{service}`")]
    UnknownFunction { service: String, function: String },
    #[error("argument `{name}`: {reason}")]
    Argument { name: &'static str, reason: String },
    #[error("{0}")]
    Failed(String),
}

/// Particle context passed to every host function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallParams {
    pub particle_id: ParticleId,
    pub init_peer_id: PeerId,
    pub host_peer_id: PeerId,
}

/// Local service execution boundary.
///
/// The pipeline never waits on the returned future in place; each call runs
/// on its own task and its result is fed back as a call result.
pub trait ServiceCalls: Send + Sync {
    fn invoke(
        &self,
        params: CallParams,
        request: CallRequest,
    ) -> BoxFuture<'static, Result<JValue, ServiceCallError>>;
}

pub type HostFunction =
    Arc<dyn Fn(Vec<JValue>, &CallParams) -> Result<JValue, ServiceCallError> + Send + Sync>;

/// Wraps a host closure into a registrable function.
pub fn closure<F>(f: F) -> HostFunction
where
    F: Fn(Vec<JValue>, &CallParams) -> Result<JValue, ServiceCallError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Pulls the next positional argument and deserializes it.
pub fn next_arg<T: DeserializeOwned>(
    name: &'static str,
    args: &mut impl Iterator<Item = JValue>,
) -> Result<T, ServiceCallError> {
    let value = args.next().ok_or(ServiceCallError::Argument {
        name,
        reason: "missing".to_string(),
    })?;
    serde_json::from_value(value).map_err(|e| ServiceCallError::Argument {
        name,
        reason: e.to_string(),
    })
}

/// Builtin host functions addressed by `(service_id, function_name)`.
#[derive(Default)]
pub struct ServiceRegistry {
    functions: RwLock<HashMap<String, HashMap<String, HostFunction>>>,
}

impl ServiceRegistry {
    /// Registry with the `op` and `peer` builtins installed.
    pub fn with_builtins() -> Self {
        let registry = Self::default();
        registry.register("op", "noop", closure(|_, _| Ok(JValue::Null)));
        registry.register(
            "op",
            "identity",
            closure(|args, _| match args.len() {
                0 => Ok(JValue::Null),
                1 => Ok(args.into_iter().next().unwrap_or_default()),
                n => Err(ServiceCallError::Argument {
                    name: "value",
                    reason: format!("identity takes at most one argument, got {n}"),
                }),
            }),
        );
        registry.register("op", "array", closure(|args, _| Ok(JValue::Array(args))));
        registry.register(
            "op",
            "array_length",
            closure(|args, _| {
                let array: Vec<JValue> = next_arg("array", &mut args.into_iter())?;
                Ok(json!(array.len()))
            }),
        );
        registry.register(
            "op",
            "concat_strings",
            closure(|args, _| {
                let mut out = String::new();
                for arg in args {
                    match arg {
                        JValue::String(s) => out.push_str(&s),
                        other => out.push_str(&other.to_string()),
                    }
                }
                Ok(JValue::String(out))
            }),
        );
        registry.register("peer", "timestamp_ms", closure(|_, _| Ok(json!(now_ms()))));
        registry.register(
            "peer",
            "identify",
            closure(|_, params| Ok(json!({ "peer_id": params.host_peer_id.to_hex() }))),
        );
        registry.register(
            "peer",
            "particle",
            closure(|_, params| {
                Ok(json!({
                    "id": params.particle_id.as_str(),
                    "init_peer_id": params.init_peer_id.to_hex(),
                }))
            }),
        );
        registry
    }

    /// Installs or replaces a host function.
    pub fn register(&self, service: &str, function: &str, host: HostFunction) {
        self.functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(service.to_string())
            .or_default()
            .insert(function.to_string(), host);
    }

    /// Removes a whole service; returns whether it existed.
    pub fn remove_service(&self, service: &str) -> bool {
        self.functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(service)
            .is_some()
    }

    fn lookup(&self, service: &str, function: &str) -> Result<HostFunction, ServiceCallError> {
        let functions = self.functions.read().unwrap_or_else(PoisonError::into_inner);
        let service_fns = functions
            .get(service)
            .ok_or_else(|| ServiceCallError::UnknownService(service.to_string()))?;
        service_fns
            .get(function)
            .cloned()
            .ok_or_else(|| ServiceCallError::UnknownFunction {
                service: service.to_string(),
                function: function.to_string(),
            })
    }
}

impl ServiceCalls for ServiceRegistry {
    fn invoke(
        &self,
        params: CallParams,
        request: CallRequest,
    ) -> BoxFuture<'static, Result<JValue, ServiceCallError>> {
        let result = self
            .lookup(&request.service_id, &request.function_name)
            .and_then(|host| host(request.args, &params));
        future::ready(result).boxed()
    }
}
