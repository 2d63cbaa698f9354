//! Exercises the full build -> lower -> compile -> conduct pipeline,
//! including a host-resume round trip, for each documented end-to-end
//! scenario.

use async_trait::async_trait;
use serde_json::{json, Value};

use composer::ast::{Arg, Composition};
use composer::combinator::{self, CombinatorRegistry};
use composer::conductor::ActionInvoker;
use composer::host::Outcome;
use composer::{compile, conduct, label, lower, LowerTarget};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).with_test_writer().try_init();
}

struct NullInvoker;

#[async_trait]
impl ActionInvoker for NullInvoker {
    async fn invoke_async(&self, _name: &str, params: Value) -> Result<Value, String> {
        Ok(params)
    }
}

fn run_pipeline(mut tree: Composition, params: Value) -> Outcome {
    init_tracing();
    label(&mut tree);
    let registry = CombinatorRegistry::with_defaults();
    let lowered = lower(&tree, &LowerTarget::Maximal, &registry).unwrap();
    let fsm = compile(&lowered).unwrap();
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(conduct(&fsm, &NullInvoker, params)).unwrap()
}

#[test]
fn sequence_of_a_single_function_reads_params() {
    let body = combinator::function("_in.n + 1").unwrap();
    let tree = Composition::new("sequence").with_components(vec![body]);
    let outcome = run_pipeline(tree, json!({"n": 2}));
    assert_eq!(outcome, Outcome::Done { params: json!({"value": 3}) });
}

#[test]
fn let_bound_local_is_visible_to_its_body() {
    let mut decls = serde_json::Map::new();
    decls.insert("x".to_string(), json!(5));
    let tree = Composition::new("let").with_arg("declarations", Arg::Object(decls)).with_components(vec![combinator::function("x").unwrap()]);
    let outcome = run_pipeline(tree, json!({}));
    assert_eq!(outcome, Outcome::Done { params: json!({"value": 5}) });
}

#[tokio::test]
async fn if_nosave_suspends_then_resumes_with_host_result() {
    init_tracing();
    let test = combinator::function("true").unwrap();
    let consequent = combinator::action("act/yes", None).unwrap();
    let alternate = combinator::action("act/no", None).unwrap();
    let mut tree = Composition::new("if_nosave").with_arg("test", test).with_arg("consequent", consequent).with_arg("alternate", alternate);
    label(&mut tree);
    let registry = CombinatorRegistry::with_defaults();
    let lowered = lower(&tree, &LowerTarget::Maximal, &registry).unwrap();
    let fsm = compile(&lowered).unwrap();

    let first = conduct(&fsm, &NullInvoker, json!({})).await.unwrap();
    let resume_state = match first {
        Outcome::Continuation { action, state, .. } => {
            assert_eq!(action, "/_/act/yes");
            state
        },
        other => panic!("expected continuation, got {other:?}"),
    };

    let mut resumed = json!({"ok": 1});
    resumed["$resume"] = serde_json::to_value(&resume_state.resume).unwrap();
    let second = conduct(&fsm, &NullInvoker, resumed).await.unwrap();
    assert_eq!(second, Outcome::Done { params: json!({"ok": 1}) });
}

#[tokio::test]
async fn retain_pairs_original_params_with_action_result() {
    init_tracing();
    let inner = combinator::action("act/double", None).unwrap();
    let mut tree = Composition::new("retain").with_components(vec![inner]);
    label(&mut tree);
    let registry = CombinatorRegistry::with_defaults();
    let lowered = lower(&tree, &LowerTarget::Maximal, &registry).unwrap();
    let fsm = compile(&lowered).unwrap();

    let first = conduct(&fsm, &NullInvoker, json!({"x": 3})).await.unwrap();
    let resume_state = match first {
        Outcome::Continuation { action, state, .. } => {
            assert_eq!(action, "/_/act/double");
            state
        },
        other => panic!("expected continuation, got {other:?}"),
    };

    let mut resumed = json!({"x": 6});
    resumed["$resume"] = serde_json::to_value(&resume_state.resume).unwrap();
    let second = conduct(&fsm, &NullInvoker, resumed).await.unwrap();
    assert_eq!(second, Outcome::Done { params: json!({"params": {"x": 3}, "result": {"x": 6}}) });
}

#[test]
fn retry_exhausts_attempts_and_surfaces_the_last_error() {
    let inner = combinator::function(r#"{"error": "e"}"#).unwrap();
    let tree = Composition::new("retry").with_arg("count", Arg::Number(2.0)).with_components(vec![inner]);
    let outcome = run_pipeline(tree, json!({}));
    assert_eq!(outcome, Outcome::Error { error: Value::String("e".to_string()), code: None });
}

// The bare `dowhile_nosave` primitive has no save/restore wrapper, so its
// test function (a function state like any other) overwrites `params` the
// same way its body does; nothing in the conductor special-cases a test
// fragment. Sustaining state across loop iterations needs the save/restore
// wrapper the enhanced `dowhile` rewrite builds on top, so that is what this
// exercises; see DESIGN.md.
#[test]
fn dowhile_counts_up_to_threshold() {
    let body = combinator::function(r#"{"n": _in.n + 1}"#).unwrap();
    let test = combinator::function("_in.n < 3").unwrap();
    let tree = Composition::new("dowhile").with_arg("body", body).with_arg("test", test);
    let outcome = run_pipeline(tree, json!({"n": 0}));
    assert_eq!(outcome, Outcome::Done { params: json!({"n": 3}) });
}
