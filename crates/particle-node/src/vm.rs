use std::sync::Arc;

use particle_codec::Particle;
use particle_core::{CallId, PeerId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JValue;
use thiserror::Error;

use crate::config::VmBackend;
use crate::effects::{CallRequest, CallResults, VmOutcome};

/// Interpreter-level failure during one step. Terminal for the particle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VmFault {
    #[error("malformed script at line {line}: {reason}")]
    MalformedScript { line: usize, reason: String },
    #[error("invalid particle data: {0}")]
    InvalidData(String),
    #[error("service call {call_id} failed: {message}")]
    CallFailed { call_id: CallId, message: String },
    #[error("interpreter error: {0}")]
    Interpreter(String),
    #[error("interpreter panicked: {0}")]
    Panicked(String),
}

/// Opaque interpreter capability.
///
/// A run is a pure step from `(particle, call results so far)` to the next
/// effects; implementations may keep caches but no per-particle state.
pub trait ParticleVm: Send {
    fn run(&mut self, particle: &Particle, call_results: &CallResults)
        -> Result<VmOutcome, VmFault>;
}

/// Builds fresh interpreter instances for the pool.
pub type VmFactory = Arc<dyn Fn() -> Box<dyn ParticleVm> + Send + Sync>;

/// Returns the factory for a configured backend.
pub fn backend_factory(backend: VmBackend) -> VmFactory {
    match backend {
        VmBackend::Line => Arc::new(|| Box::new(LineVm) as Box<dyn ParticleVm>),
        VmBackend::Noop => Arc::new(|| Box::new(NoopVm) as Box<dyn ParticleVm>),
    }
}

/// Completes immediately, leaving data untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopVm;

impl ParticleVm for NoopVm {
    fn run(&mut self, particle: &Particle, _: &CallResults) -> Result<VmOutcome, VmFault> {
        Ok(VmOutcome {
            data: particle.data.clone(),
            ..VmOutcome::default()
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Instruction {
    /// `call <service> <function> [arg ...]`
    Call {
        service_id: String,
        function_name: String,
        args: Vec<Arg>,
    },
    /// `next <peer-hex>`
    Next(PeerId),
}

#[derive(Debug, Clone, PartialEq)]
enum Arg {
    Literal(JValue),
    /// `$N`: result of the N-th completed call.
    Result(usize),
}

/// Progress stored in particle data so every hop resumes where the last one stopped.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LineState {
    cursor: usize,
    results: Vec<JValue>,
}

/// Line-oriented interpreter.
///
/// One instruction per line, `#` starts a comment:
///
/// ```text
/// call op identity "hello"
/// call math add 1 2
/// next 4f1c...   # 64 hex chars
/// ```
///
/// The call id of an instruction is its index. A `call` without a result
/// suspends the script; `$N` passes the N-th call result as an argument.
/// `next` hands the particle over: the local step ends and the remaining
/// lines run on the target peers.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineVm;

impl ParticleVm for LineVm {
    fn run(
        &mut self,
        particle: &Particle,
        call_results: &CallResults,
    ) -> Result<VmOutcome, VmFault> {
        let program = parse_script(&particle.script)?;
        let mut state: LineState = if particle.data.is_empty() {
            LineState::default()
        } else {
            serde_json::from_slice(&particle.data)
                .map_err(|e| VmFault::InvalidData(e.to_string()))?
        };

        let mut outcome = VmOutcome::default();
        while let Some(instruction) = program.get(state.cursor) {
            let call_id = state.cursor as CallId;
            match instruction {
                Instruction::Next(peer) => {
                    outcome.next_peers.push(*peer);
                    state.cursor += 1;
                    // a run of `next` lines fans out; the rest runs on the targets
                    if matches!(program.get(state.cursor), Some(Instruction::Next(_))) {
                        continue;
                    }
                    break;
                }
                Instruction::Call {
                    service_id,
                    function_name,
                    args,
                } => match call_results.get(&call_id) {
                    Some(Ok(value)) => state.results.push(value.clone()),
                    Some(Err(message)) => {
                        return Err(VmFault::CallFailed {
                            call_id,
                            message: message.clone(),
                        })
                    }
                    None => {
                        outcome.call_requests.push(CallRequest {
                            call_id,
                            service_id: service_id.clone(),
                            function_name: function_name.clone(),
                            args: resolve_args(args, &state.results)?,
                        });
                        break;
                    }
                },
            }
            state.cursor += 1;
        }

        outcome.data =
            serde_json::to_vec(&state).map_err(|e| VmFault::InvalidData(e.to_string()))?;
        Ok(outcome)
    }
}

fn resolve_args(args: &[Arg], results: &[JValue]) -> Result<Vec<JValue>, VmFault> {
    args.iter()
        .map(|arg| match arg {
            Arg::Literal(value) => Ok(value.clone()),
            Arg::Result(idx) => results.get(*idx).cloned().ok_or_else(|| {
                VmFault::Interpreter(format!("result ${idx} is not available yet"))
            }),
        })
        .collect()
}

fn parse_script(script: &str) -> Result<Vec<Instruction>, VmFault> {
    let mut program = Vec::new();
    for (idx, raw) in script.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let malformed = |reason: &str| VmFault::MalformedScript {
            line: idx + 1,
            reason: reason.to_string(),
        };
        let mut words = line.split_whitespace();
        match words.next() {
            Some("call") => {
                let service_id = words.next().ok_or_else(|| malformed("missing service id"))?;
                let function_name = words
                    .next()
                    .ok_or_else(|| malformed("missing function name"))?;
                let args = words.map(parse_arg).collect::<Result<_, _>>().map_err(|r| malformed(r))?;
                program.push(Instruction::Call {
                    service_id: service_id.to_string(),
                    function_name: function_name.to_string(),
                    args,
                });
            }
            Some("next") => {
                let peer = words.next().ok_or_else(|| malformed("missing peer id"))?;
                let peer: PeerId = peer.parse().map_err(|_| malformed("invalid peer id"))?;
                if words.next().is_some() {
                    return Err(malformed("next takes exactly one peer"));
                }
                program.push(Instruction::Next(peer));
            }
            Some(other) => return Err(malformed(&format!("unknown instruction `{other}`"))),
            None => {}
        }
    }
    Ok(program)
}

fn parse_arg(word: &str) -> Result<Arg, &'static str> {
    if let Some(idx) = word.strip_prefix('$') {
        return idx
            .parse()
            .map(Arg::Result)
            .map_err(|_| "result reference must be `$<index>`");
    }
    Ok(Arg::Literal(
        serde_json::from_str(word).unwrap_or_else(|_| JValue::String(word.to_string())),
    ))
}

#[cfg(test)]
mod tests {
    use particle_codec::Particle;
    use particle_core::PeerId;
    use serde_json::json;

    use super::{backend_factory, LineVm, NoopVm, ParticleVm, VmFault};
    use crate::config::VmBackend;
    use crate::effects::CallResults;

    fn particle(script: &str) -> Particle {
        Particle::new("vm-test", PeerId([1; 32]), 0, 60_000, script)
    }

    #[test]
    fn line_vm_suspends_on_call_and_resumes_with_result() {
        let peer_b = PeerId([0xBB; 32]);
        let mut p = particle(&format!("call op identity \"hi\"\nnext {peer_b}"));
        let mut vm = LineVm;

        let first = vm.run(&p, &CallResults::new()).expect("first step should run");
        assert!(!first.is_complete());
        assert!(first.next_peers.is_empty());
        assert_eq!(first.call_requests[0].call_id, 0);
        assert_eq!(first.call_requests[0].args, vec![json!("hi")]);

        p.data = first.data;
        let mut results = CallResults::new();
        results.insert(0, Ok(json!("hi")));
        let second = vm.run(&p, &results).expect("second step should run");
        assert!(second.is_complete());
        assert_eq!(second.next_peers, vec![peer_b]);

        // replaying the final data emits nothing new
        p.data = second.data;
        let third = vm.run(&p, &results).expect("replay should run");
        assert!(third.is_complete());
        assert!(third.next_peers.is_empty());
    }

    #[test]
    fn next_hands_remaining_lines_to_targets() {
        let b = PeerId([0xB0; 32]);
        let c = PeerId([0xC0; 32]);
        let mut p = particle(&format!("next {b}\nnext {c}\ncall op noop"));

        let here = LineVm.run(&p, &CallResults::new()).expect("local step");
        assert!(here.is_complete());
        assert_eq!(here.next_peers, vec![b, c]);

        p.data = here.data;
        let there = LineVm.run(&p, &CallResults::new()).expect("remote step");
        assert!(there.next_peers.is_empty());
        assert_eq!(there.call_requests[0].call_id, 2);
    }

    #[test]
    fn result_references_feed_later_calls() {
        let mut p = particle("call op identity 5\ncall op echo $0 x");
        let mut vm = LineVm;
        let mut results = CallResults::new();
        results.insert(0, Ok(json!(5)));

        let out = vm.run(&p, &results).expect("step should run");
        assert_eq!(out.call_requests[0].call_id, 1);
        assert_eq!(out.call_requests[0].args, vec![json!(5), json!("x")]);

        p.data = out.data;
        results.insert(1, Ok(json!([5, "x"])));
        assert!(vm.run(&p, &results).expect("step should run").is_complete());
    }

    #[test]
    fn call_error_is_a_fault() {
        let p = particle("call op fail");
        let mut results = CallResults::new();
        results.insert(0, Err("boom".to_string()));
        assert_eq!(
            LineVm.run(&p, &results),
            Err(VmFault::CallFailed {
                call_id: 0,
                message: "boom".to_string()
            })
        );
    }

    #[test]
    fn malformed_scripts_report_line() {
        let err = LineVm
            .run(&particle("# header\njump somewhere"), &CallResults::new())
            .expect_err("unknown instruction should fault");
        assert!(matches!(err, VmFault::MalformedScript { line: 2, .. }));

        let err = LineVm
            .run(&particle("next not-a-peer"), &CallResults::new())
            .expect_err("bad peer should fault");
        assert!(matches!(err, VmFault::MalformedScript { line: 1, .. }));
    }

    #[test]
    fn corrupted_data_is_a_fault() {
        let mut p = particle("call op noop");
        p.data = b"{not json".to_vec();
        assert!(matches!(
            LineVm.run(&p, &CallResults::new()),
            Err(VmFault::InvalidData(_))
        ));
    }

    #[test]
    fn noop_vm_completes_with_same_data() {
        let mut p = particle("anything at all");
        p.data = vec![7, 7];
        let out = NoopVm.run(&p, &CallResults::new()).expect("noop never fails");
        assert!(out.is_complete());
        assert_eq!(out.data, vec![7, 7]);

        let mut vm = backend_factory(VmBackend::Noop)();
        assert!(vm.run(&p, &CallResults::new()).is_ok());
    }
}
