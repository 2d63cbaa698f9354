//! Inline function evaluation.
//!
//! A `function` state's source is compiled, user-supplied code or the
//! synthetic statements the lowerer emits (see the canonical rewrites in
//! [`crate::lower`]). Expression evaluation is delegated to `cel`; a small
//! statement-splitting layer on top adds the assignment and
//! increment/decrement mutation forms the rewrites need, which pure CEL
//! (side-effect free by design) cannot express.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::EvalError;

/// The reserved name bound to the composition's actual running `params` at
/// the point a function state executes — the Rust stand-in for "the
/// function's sole argument" in the source system. `_in` rather than the
/// more suggestive `$in`: CEL identifiers are `[_a-zA-Z][_a-zA-Z0-9]*`, so
/// `$` is not a legal token.
pub const INPUT_BINDING: &str = "_in";

/// What running an inline function against an environment produced.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalOutcome {
    /// The function produced a value; it replaces `params`.
    Value(Value),
    /// The function had no trailing expression (only assignments); `params`
    /// is left unchanged.
    Unchanged,
}

static ASSIGN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(.+)$").unwrap());
static INCDEC_TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"([A-Za-z_][A-Za-z0-9_]*)(\+\+|--)").unwrap());

/// Evaluates inline function `source` against `env` (the collapsed visible
/// let-frame environment) plus the implicit `_in` binding for the
/// composition's current running params.
///
/// `env` is taken and returned so the caller can write mutated locals back
/// into the frame(s) that declare them (see
/// `crate::conductor::write_back_scope`).
pub fn eval_function(source: &str, mut env: BTreeMap<String, Value>, input: &Value) -> Result<(EvalOutcome, BTreeMap<String, Value>), EvalError> {
    let statements: Vec<&str> = split_statements(source);
    if statements.is_empty() {
        return Err(EvalError::MalformedSource("function body has no statements".to_string()));
    }

    let (last, init) = statements.split_last().expect("non-empty");
    for stmt in init {
        eval_statement_for_effect(stmt, &mut env, input)?;
    }

    // The final statement is an assignment (no return value) if it matches
    // the assignment form; otherwise it is the function's return
    // expression.
    if let Some(caps) = ASSIGN_RE.captures(last) {
        let ident = caps.get(1).unwrap().as_str().to_string();
        let expr = caps.get(2).unwrap().as_str();
        let value = eval_expression(expr, &mut env, input)?;
        env.insert(ident, value);
        return Ok((EvalOutcome::Unchanged, env));
    }
    if let Some(caps) = bare_incdec(last) {
        let (ident, delta) = caps;
        let old = env.get(&ident).cloned().unwrap_or(Value::Null);
        let new_val = apply_delta(&old, delta)?;
        env.insert(ident, new_val);
        return Ok((EvalOutcome::Unchanged, env));
    }

    let value = eval_expression(last, &mut env, input)?;
    Ok((EvalOutcome::Value(value), env))
}

fn eval_statement_for_effect(stmt: &str, env: &mut BTreeMap<String, Value>, input: &Value) -> Result<(), EvalError> {
    if let Some(caps) = ASSIGN_RE.captures(stmt) {
        let ident = caps.get(1).unwrap().as_str().to_string();
        let expr = caps.get(2).unwrap().as_str();
        let value = eval_expression(expr, env, input)?;
        env.insert(ident, value);
        return Ok(());
    }
    if let Some((ident, delta)) = bare_incdec(stmt) {
        let old = env.get(&ident).cloned().unwrap_or(Value::Null);
        let new_val = apply_delta(&old, delta)?;
        env.insert(ident, new_val);
        return Ok(());
    }
    // A bare expression statement in non-final position has no effect; run
    // it anyway so malformed references are still surfaced as errors.
    eval_expression(stmt, env, input).map(|_| ())
}

fn bare_incdec(stmt: &str) -> Option<(String, i64)> {
    let trimmed = stmt.trim();
    let caps = INCDEC_TOKEN_RE.captures(trimmed)?;
    if caps.get(0)?.as_str() != trimmed {
        return None;
    }
    let ident = caps.get(1)?.as_str().to_string();
    let delta = if &caps[2] == "++" { 1 } else { -1 };
    Some((ident, delta))
}

fn apply_delta(old: &Value, delta: i64) -> Result<Value, EvalError> {
    let n = old.as_f64().ok_or_else(|| EvalError::Expression(format!("cannot increment/decrement non-number `{old}`")))?;
    Ok(serde_json::json!(n + delta as f64))
}

/// Evaluates a single CEL expression, pre-substituting any `ident++`/
/// `ident--` tokens with the identifier's pre-mutation value (and applying
/// the mutation to `env` as a side effect, which the caller observes since
/// `env` is taken by mutable reference) before compiling, since CEL itself
/// has no mutation operators.
fn eval_expression(expr: &str, env: &mut BTreeMap<String, Value>, input: &Value) -> Result<Value, EvalError> {
    let mut text = expr.trim().to_string();
    while let Some(caps) = INCDEC_TOKEN_RE.captures(&text.clone()) {
        let whole = caps.get(0).unwrap().as_str().to_string();
        let ident = caps.get(1).unwrap().as_str().to_string();
        let delta = if &caps[2] == "++" { 1 } else { -1 };
        let old = env.get(&ident).cloned().unwrap_or(Value::Null);
        let new_val = apply_delta(&old, delta)?;
        env.insert(ident.clone(), new_val);
        let literal = old.to_string();
        text = text.replacen(&whole, &literal, 1);
    }
    compile_and_run(&text, env, input)
}

fn compile_and_run(expr: &str, env: &BTreeMap<String, Value>, input: &Value) -> Result<Value, EvalError> {
    let program = cel::Program::compile(expr).map_err(|e| EvalError::Expression(format!("{expr}: {e}")))?;
    let mut context = cel::Context::default();
    context.add_variable(INPUT_BINDING, json_to_cel(input)).map_err(|e| EvalError::Expression(e.to_string()))?;
    for (k, v) in env.iter() {
        context.add_variable(k.as_str(), json_to_cel(v)).map_err(|e| EvalError::Expression(e.to_string()))?;
    }
    let result = program.execute(&context).map_err(|e| EvalError::Expression(e.to_string()))?;
    cel_to_json(result)
}

/// Splits inline source into statements on `;` or newlines, ignoring blank
/// segments. This is intentionally simple: the only producers of function
/// source are the canonical rewrites (single-line, unambiguous) and
/// user-supplied code, which is expected to follow the same one-statement
/// per line/semicolon convention.
fn split_statements(source: &str) -> Vec<&str> {
    source.split(|c| c == ';' || c == '\n').map(str::trim).filter(|s| !s.is_empty()).collect()
}

fn json_to_cel(v: &Value) -> cel::Value {
    match v {
        Value::Null => cel::Value::Null,
        Value::Bool(b) => cel::Value::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                cel::Value::Int(i)
            } else {
                cel::Value::Float(n.as_f64().unwrap_or(0.0))
            }
        },
        Value::String(s) => cel::Value::String(s.clone().into()),
        Value::Array(items) => cel::Value::List(items.iter().map(json_to_cel).collect::<Vec<_>>().into()),
        Value::Object(map) => {
            let mut m = std::collections::HashMap::new();
            for (k, val) in map.iter() {
                m.insert(cel::objects::Key::String(k.clone().into()), json_to_cel(val));
            }
            cel::Value::Map(cel::objects::Map::from(m))
        },
    }
}

fn cel_to_json(v: cel::Value) -> Result<Value, EvalError> {
    Ok(match v {
        cel::Value::Null => Value::Null,
        cel::Value::Bool(b) => Value::Bool(b),
        cel::Value::Int(i) => serde_json::json!(i),
        cel::Value::UInt(u) => serde_json::json!(u),
        cel::Value::Float(f) => serde_json::json!(f),
        cel::Value::String(s) => Value::String(s.to_string()),
        cel::Value::Bytes(_) => return Err(EvalError::Expression("function returned an unsupported bytes value".to_string())),
        cel::Value::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items.iter() {
                out.push(cel_to_json(item.clone())?);
            }
            Value::Array(out)
        },
        cel::Value::Map(map) => {
            let mut out = serde_json::Map::new();
            for (k, val) in map.map.iter() {
                let key = match k {
                    cel::objects::Key::String(s) => s.to_string(),
                    cel::objects::Key::Int(i) => i.to_string(),
                    cel::objects::Key::Uint(u) => u.to_string(),
                    cel::objects::Key::Bool(b) => b.to_string(),
                };
                out.insert(key, cel_to_json(val.clone())?);
            }
            Value::Object(out)
        },
        cel::Value::Function(..) => return Err(EvalError::ReturnedCallable),
        _ => return Err(EvalError::Expression("unsupported value kind returned from expression".to_string())),
    })
}
