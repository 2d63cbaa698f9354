//! The conductor: executes a compiled [`Fsm`] one state at a time over a
//! parameter object and a runtime stack, suspending at synchronous actions
//! and resuming from a host-supplied continuation.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::{ConductError, EvalError};
use crate::eval::{self, EvalOutcome};
use crate::fsm::{Fsm, NodeKind};
use crate::host::{ContinuationState, Outcome, Resume};

/// A runtime stack frame. The stack grows on the front: index 0 is always
/// the innermost (most recently pushed) frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// A scope introducing the given variable bindings.
    Let { vars: serde_json::Map<String, Value> },
    /// A scope that hides `count` enclosing let-frames from nested code.
    Mask,
    /// An exception handler target, installed by `try`.
    Catch { target: usize },
}

/// Abstracts over the host's ability to invoke a remote action.
///
/// The conductor itself never blocks on a real remote completion for async
/// actions: it awaits only long enough to get back an activation
/// descriptor, matching the "fire and forget" contract for `action(async)`
/// states.
#[async_trait]
pub trait ActionInvoker: Send + Sync {
    async fn invoke_async(&self, name: &str, params: Value) -> Result<Value, String>;
}

#[derive(Debug, Clone)]
struct RuntimeState {
    index: Option<usize>,
    stack: Vec<Frame>,
}

/// Executes `fsm` starting from `params`, which may carry a `$resume` token
/// from a previous suspension.
pub async fn conduct(fsm: &Fsm, invoker: &dyn ActionInvoker, params: Value) -> Result<Outcome, ConductError> {
    let (mut params, mut state) = enter(fsm, params)?;

    loop {
        let idx = match state.index {
            Some(i) => i,
            None => break,
        };
        let node = fsm.get(idx).ok_or(ConductError::StateOutOfRange(idx))?;
        trace!(state = idx, op = ?node.kind, "conductor step");

        match &node.kind {
            NodeKind::Pass => {
                state.index = advance(idx, node.next);
            },
            NodeKind::Empty => {
                inspect(&mut params, &mut state);
                state.index = advance(idx, node.next);
            },
            NodeKind::Let { declarations } => {
                let vars = match declarations {
                    Some(Value::Object(m)) => m.clone(),
                    _ => serde_json::Map::new(),
                };
                let is_mask = declarations.is_none();
                push_frame(&mut state, if is_mask { Frame::Mask } else { Frame::Let { vars } });
                state.index = advance(idx, node.next);
            },
            NodeKind::Exit => {
                pop_frame(&mut state)?;
                state.index = advance(idx, node.next);
            },
            NodeKind::Try { catch } => {
                let target = (idx as i64 + catch) as usize;
                push_frame(&mut state, Frame::Catch { target });
                state.index = advance(idx, node.next);
            },
            NodeKind::Choice { then, else_ } => {
                let taken = if choice_value(&params) { *then } else { *else_ };
                state.index = Some((idx as i64 + taken) as usize);
            },
            NodeKind::Action { name, is_async } => {
                if *is_async {
                    match invoker.invoke_async(name, params.clone()).await {
                        Ok(activation) => params = activation,
                        Err(e) => params = serde_json::json!({"error": e}),
                    }
                    inspect(&mut params, &mut state);
                    state.index = advance(idx, node.next);
                } else {
                    let resume_index = advance(idx, node.next);
                    debug!(action = %name, "suspending for synchronous action");
                    return Ok(Outcome::Continuation {
                        action: name.clone(),
                        params,
                        state: ContinuationState { resume: Resume { state: resume_index, stack: state.stack } },
                    });
                }
            },
            NodeKind::Function { code } => {
                let env = collapse_visible_env(&state.stack);
                match eval::eval_function(code, env, &params) {
                    Ok((EvalOutcome::Value(v), new_env)) => {
                        params = v;
                        write_back_scope(&mut state.stack, &new_env);
                    },
                    Ok((EvalOutcome::Unchanged, new_env)) => {
                        write_back_scope(&mut state.stack, &new_env);
                    },
                    Err(e) => {
                        warn!(error = %e, "inline function evaluation failed");
                        params = materialize_eval_error(e);
                    },
                }
                inspect(&mut params, &mut state);
                state.index = advance(idx, node.next);
            },
        }
    }

    Ok(match params.get("error") {
        Some(err) => Outcome::Error { error: err.clone(), code: None },
        None => Outcome::Done { params },
    })
}

fn materialize_eval_error(e: EvalError) -> Value {
    serde_json::json!({"error": e.to_string()})
}

fn enter(fsm: &Fsm, mut params: Value) -> Result<(Value, RuntimeState), ConductError> {
    let resume = match params.as_object_mut().and_then(|m| m.remove("$resume")) {
        Some(v) => Some(serde_json::from_value::<Resume>(v).map_err(|e| ConductError::MalformedResume(e.to_string()))?),
        None => None,
    };

    match resume {
        None => Ok((params, RuntimeState { index: Some(0), stack: vec![] })),
        Some(resume) => {
            let index = match resume.state {
                Some(i) if i < fsm.len() => Some(i),
                Some(i) => return Err(ConductError::ResumeStateOutOfRange(i)),
                None => None,
            };
            let mut state = RuntimeState { index, stack: resume.stack };
            inspect(&mut params, &mut state);
            Ok((params, state))
        },
    }
}

fn advance(idx: usize, next: Option<i64>) -> Option<usize> {
    next.map(|n| (idx as i64 + n) as usize)
}

fn push_frame(state: &mut RuntimeState, frame: Frame) {
    state.stack.insert(0, frame);
}

fn pop_frame(state: &mut RuntimeState) -> Result<Frame, ConductError> {
    if state.stack.is_empty() {
        return Err(ConductError::EmptyStackPop);
    }
    Ok(state.stack.remove(0))
}

fn choice_value(params: &Value) -> bool {
    params.get("value").map(is_truthy).unwrap_or(false)
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// The `inspect` pass: boxes non-object params, then on `params.error`
/// unwinds the stack to the nearest catch-frame (or terminates).
fn inspect(params: &mut Value, state: &mut RuntimeState) {
    if !params.is_object() {
        *params = serde_json::json!({"value": params.clone()});
    }
    let error = params.get("error").cloned();
    if let Some(error) = error {
        *params = serde_json::json!({"error": error});
        loop {
            match state.stack.first() {
                None => {
                    state.index = None;
                    return;
                },
                Some(Frame::Catch { target }) => {
                    let target = *target;
                    state.stack.remove(0);
                    state.index = Some(target);
                    return;
                },
                Some(_) => {
                    state.stack.remove(0);
                },
            }
        }
    }
}

/// Computes the visible variable environment for a function state: walk
/// frames innermost-first, skipping one enclosing let-frame per mask frame
/// encountered, then merge outermost-to-innermost so inner bindings shadow
/// outer ones.
fn collapse_visible_env(stack: &[Frame]) -> BTreeMap<String, Value> {
    let mut skip = 0i32;
    let mut visible_innermost_first: Vec<&serde_json::Map<String, Value>> = Vec::new();
    for frame in stack {
        match frame {
            Frame::Mask => skip += 1,
            Frame::Let { vars } => {
                if skip == 0 {
                    visible_innermost_first.push(vars);
                } else {
                    skip -= 1;
                }
            },
            Frame::Catch { .. } => {},
        }
    }
    let mut env = BTreeMap::new();
    for vars in visible_innermost_first.into_iter().rev() {
        for (k, v) in vars.iter() {
            env.insert(k.clone(), v.clone());
        }
    }
    env
}

/// Writes mutated locals back into the innermost visible let-frame that
/// declares each symbol. Symbols with no declaring frame (function-local
/// temporaries) are dropped.
fn write_back_scope(stack: &mut [Frame], env: &BTreeMap<String, Value>) {
    let mut written: HashSet<&str> = HashSet::new();
    let mut skip = 0i32;
    for frame in stack.iter_mut() {
        match frame {
            Frame::Mask => skip += 1,
            Frame::Let { vars } => {
                if skip > 0 {
                    skip -= 1;
                    continue;
                }
                for (k, v) in env.iter() {
                    if written.contains(k.as_str()) {
                        continue;
                    }
                    if vars.contains_key(k) {
                        vars.insert(k.clone(), v.clone());
                        written.insert(k.as_str());
                    }
                }
            },
            Frame::Catch { .. } => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::FsmNode;

    struct NullInvoker;

    #[async_trait]
    impl ActionInvoker for NullInvoker {
        async fn invoke_async(&self, _name: &str, params: Value) -> Result<Value, String> {
            Ok(params)
        }
    }

    fn invoker() -> NullInvoker {
        NullInvoker
    }

    #[tokio::test]
    async fn pass_through_sequence_reaches_terminal() {
        let fsm = Fsm::new(vec![FsmNode::new(NodeKind::Pass).with_next(Some(1)), FsmNode::terminal(NodeKind::Pass)]);
        let outcome = conduct(&fsm, &invoker(), serde_json::json!({"x": 1})).await.unwrap();
        assert_eq!(outcome, Outcome::Done { params: serde_json::json!({"x": 1}) });
    }

    #[tokio::test]
    async fn function_reads_let_bound_local() {
        let mut decls = serde_json::Map::new();
        decls.insert("x".to_string(), serde_json::json!(5));
        let fsm = Fsm::new(vec![
            FsmNode::new(NodeKind::Let { declarations: Some(Value::Object(decls)) }).with_next(Some(1)),
            FsmNode::new(NodeKind::Function { code: "x".to_string() }).with_next(Some(1)),
            FsmNode::terminal(NodeKind::Exit),
        ]);
        let outcome = conduct(&fsm, &invoker(), serde_json::json!({})).await.unwrap();
        assert_eq!(outcome, Outcome::Done { params: serde_json::json!({"value": 5}) });
    }

    #[tokio::test]
    async fn mask_hides_enclosing_let() {
        let mut decls = serde_json::Map::new();
        decls.insert("x".to_string(), serde_json::json!(1));
        let fsm = Fsm::new(vec![
            FsmNode::new(NodeKind::Let { declarations: Some(Value::Object(decls)) }).with_next(Some(1)),
            FsmNode::new(NodeKind::Let { declarations: None }).with_next(Some(1)), // mask
            FsmNode::new(NodeKind::Function { code: "_in".to_string() }).with_next(Some(1)),
            FsmNode::terminal(NodeKind::Exit),
            FsmNode::terminal(NodeKind::Exit),
        ]);
        let outcome = conduct(&fsm, &invoker(), serde_json::json!({"seen": true})).await.unwrap();
        assert_eq!(outcome, Outcome::Done { params: serde_json::json!({"seen": true}) });
    }

    #[tokio::test]
    async fn try_routes_function_error_to_handler() {
        // try { function that errors } catch { pass } ; exit
        let fsm = Fsm::new(vec![
            FsmNode::new(NodeKind::Try { catch: 3 }).with_next(Some(1)), // 0
            FsmNode::new(NodeKind::Function { code: "{\"error\": \"boom\"}".to_string() }).with_next(Some(1)), // 1
            FsmNode::new(NodeKind::Exit).with_next(Some(2)), // 2 (normal path, skipped on error)
            FsmNode::terminal(NodeKind::Pass), // 3: handler
        ]);
        let outcome = conduct(&fsm, &invoker(), serde_json::json!({})).await.unwrap();
        assert_eq!(outcome, Outcome::Done { params: serde_json::json!({"error": "boom"}) });
    }

    #[tokio::test]
    async fn error_without_try_terminates_with_error() {
        let fsm = Fsm::new(vec![FsmNode::terminal(NodeKind::Function { code: "{\"error\": \"boom\"}".to_string() })]);
        let outcome = conduct(&fsm, &invoker(), serde_json::json!({})).await.unwrap();
        assert_eq!(outcome, Outcome::Error { error: Value::String("boom".to_string()), code: None });
    }

    #[tokio::test]
    async fn sync_action_suspends_with_continuation() {
        let fsm = Fsm::new(vec![FsmNode::terminal(NodeKind::Action { name: "/_/act/yes".to_string(), is_async: false })]);
        let outcome = conduct(&fsm, &invoker(), serde_json::json!({})).await.unwrap();
        match outcome {
            Outcome::Continuation { action, state, .. } => {
                assert_eq!(action, "/_/act/yes");
                assert_eq!(state.resume.state, None);
            },
            other => panic!("expected continuation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resume_after_sync_action_completes() {
        let fsm = Fsm::new(vec![FsmNode::new(NodeKind::Action { name: "/_/act/yes".to_string(), is_async: false }), FsmNode::terminal(NodeKind::Pass)]);
        let first = conduct(&fsm, &invoker(), serde_json::json!({})).await.unwrap();
        let resume_state = match first {
            Outcome::Continuation { state, .. } => state,
            other => panic!("expected continuation, got {other:?}"),
        };
        let mut resumed_params = serde_json::json!({"ok": 1});
        resumed_params["$resume"] = serde_json::to_value(&resume_state.resume).unwrap();
        let second = conduct(&fsm, &invoker(), resumed_params).await.unwrap();
        assert_eq!(second, Outcome::Done { params: serde_json::json!({"ok": 1}) });
    }

    #[tokio::test]
    async fn exit_on_empty_stack_is_fatal() {
        let fsm = Fsm::new(vec![FsmNode::terminal(NodeKind::Exit)]);
        let err = conduct(&fsm, &invoker(), serde_json::json!({})).await.unwrap_err();
        assert_eq!(err, ConductError::EmptyStackPop);
    }
}
