//! Labeling and lowering: rewriting enhanced combinators down to the
//! primitive set the compiler understands.

use serde_json::{Map, Value};

use crate::ast::{Arg, Composition};
use crate::combinator::{self, CombinatorRegistry};
use crate::error::{BuildError, LowerError};

/// Which combinator kinds a lowering pass should stop at.
#[derive(Debug, Clone, PartialEq)]
pub enum LowerTarget {
    /// Stop at any of these kinds.
    List(Vec<String>),
    /// Lower maximally: stop only at primitive combinators.
    Maximal,
    /// Perform no lowering at all.
    None,
    /// Stop at primitives plus any combinator whose `since` is `<=` this
    /// version.
    Version(Version),
}

/// A dotted `major.minor.patch` version, compared component-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(pub u32, pub u32, pub u32);

impl Version {
    pub fn parse(s: &str) -> Result<Self, LowerError> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(LowerError::InvalidVersion(s.to_string()));
        }
        let mut nums = [0u32; 3];
        for (i, p) in parts.iter().enumerate() {
            nums[i] = p.parse().map_err(|_| LowerError::InvalidVersion(s.to_string()))?;
        }
        Ok(Version(nums[0], nums[1], nums[2]))
    }
}

fn in_target(kind: &str, target: &LowerTarget, registry: &CombinatorRegistry) -> bool {
    match target {
        LowerTarget::List(names) => names.iter().any(|n| n == kind),
        LowerTarget::Maximal => registry.get(kind).map(|d| d.is_primitive()).unwrap_or(false),
        LowerTarget::None => true,
        LowerTarget::Version(v) => match registry.get(kind) {
            Some(d) => match d.since {
                None => true,
                Some(since) => Version::parse(since).map(|s| s <= *v).unwrap_or(false),
            },
            None => false,
        },
    }
}

/// Assigns JSON-pointer-like path labels throughout the tree, in place.
pub fn label(tree: &mut Composition) {
    label_at(tree, "");
}

fn label_at(node: &mut Composition, path: &str) {
    node.path = Some(path.to_string());
    if let Some(components) = &mut node.components {
        for (i, child) in components.iter_mut().enumerate() {
            label_at(child, &format!("{path}[{i}]"));
        }
    }
    for (name, arg) in node.args.iter_mut() {
        if let Arg::Composition(child) = arg {
            label_at(child, &format!("{path}.{name}"));
        }
    }
}

/// Repeatedly rewrites `tree`'s root until its kind is within `target`, then
/// recurses into children. Returns the fully lowered tree.
pub fn lower(tree: &Composition, target: &LowerTarget, registry: &CombinatorRegistry) -> Result<Composition, LowerError> {
    if matches!(target, LowerTarget::None) {
        return Ok(tree.clone());
    }

    let mut current = tree.clone();
    while !in_target(&current.kind, target, registry) {
        let original_path = current.path.clone();
        current = rewrite(&current)?;
        current.path = original_path;
    }

    if let Some(components) = current.components.take() {
        let lowered = components.iter().map(|c| lower(c, target, registry)).collect::<Result<Vec<_>, _>>()?;
        current.components = Some(lowered);
    }
    let names: Vec<String> = current.args.keys().cloned().collect();
    for name in names {
        if let Some(Arg::Composition(child)) = current.args.get(&name) {
            let lowered = lower(child, target, registry)?;
            current.args.insert(name, Arg::Composition(Box::new(lowered)));
        }
    }

    Ok(current)
}

fn fnnode(src: &str) -> Result<Composition, LowerError> {
    combinator::function(src).map_err(|e| LowerError::invalid_rewrite("function", e.to_string()))
}

fn obj(pairs: Vec<(&str, Value)>) -> Map<String, Value> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn require_child<'a>(node: &'a Composition, name: &str) -> Result<&'a Composition, LowerError> {
    node.child_composition(name).ok_or_else(|| LowerError::invalid_rewrite(node.kind.clone(), format!("missing `{name}`")))
}

fn components_or_err(node: &Composition) -> Result<&[Composition], LowerError> {
    Ok(node.components_or_empty())
}

/// Applies the single canonical rewrite for `node`'s kind, leaving its kind
/// unchanged if there is no rewrite defined (caller treats that as an
/// error when the kind is also outside the lowering target).
fn rewrite(node: &Composition) -> Result<Composition, LowerError> {
    match node.kind.as_str() {
        "empty" => Ok(Composition::new("sequence").with_components(vec![])),
        "seq" => Ok(Composition::new("sequence").with_components(components_or_err(node)?.to_vec())),
        "value" | "literal" => {
            let v = node.arg("value").and_then(Arg::as_value).cloned().unwrap_or(Value::Null);
            Ok(Composition::new("let").with_arg("declarations", Arg::Object(obj(vec![("value", v)]))).with_components(vec![fnnode("value")?]))
        },
        "retain" => rewrite_retain(components_or_err(node)?),
        "retain_catch" => rewrite_retain_catch(components_or_err(node)?),
        "if" => {
            let test = require_child(node, "test")?.clone();
            let consequent = require_child(node, "consequent")?.clone();
            let alternate = node.child_composition("alternate").cloned().unwrap_or_else(Composition::empty);
            rewrite_if(test, consequent, alternate)
        },
        "while" => {
            let test = require_child(node, "test")?.clone();
            let body = require_child(node, "body")?.clone();
            rewrite_while(test, body)
        },
        "dowhile" => {
            let body = require_child(node, "body")?.clone();
            let test = require_child(node, "test")?.clone();
            rewrite_dowhile(body, test)
        },
        "repeat" => {
            let count = node.arg("count").and_then(|a| if let Arg::Number(n) = a { Some(*n) } else { None }).unwrap_or(0.0);
            rewrite_repeat(count, components_or_err(node)?)
        },
        "retry" => {
            let count = node.arg("count").and_then(|a| if let Arg::Number(n) = a { Some(*n) } else { None }).unwrap_or(0.0);
            rewrite_retry(count, components_or_err(node)?)
        },
        "composition" => {
            // A deployable composition lowers to its body; the name/options
            // metadata is a deployment-time concern, out of scope here.
            let body = require_child(node, "composition")?.clone();
            Ok(body)
        },
        other => Err(LowerError::NoRewrite(other.to_string())),
    }
}

fn rewrite_retain(xs: &[Composition]) -> Result<Composition, LowerError> {
    Ok(Composition::new("let")
        .with_arg("declarations", Arg::Object(obj(vec![("params", Value::Null)])))
        .with_components(vec![
            fnnode("params = _in")?,
            Composition::new("mask").with_components(vec![Composition::new("sequence").with_components(xs.to_vec())]),
            fnnode(r#"{"params": params, "result": _in}"#)?,
        ]))
}

fn rewrite_retain_catch(xs: &[Composition]) -> Result<Composition, LowerError> {
    let inner = Composition::new("finally")
        .with_arg("body", Composition::new("sequence").with_components(xs.to_vec()))
        .with_arg("finalizer", fnnode(r#"{"result": _in}"#)?);
    let retained = rewrite_retain(std::slice::from_ref(&inner))?;
    Ok(Composition::new("sequence").with_components(vec![
        retained,
        fnnode(r#"{"params": _in.params, "result": _in.result.result}"#)?,
    ]))
}

fn rewrite_if(test: Composition, consequent: Composition, alternate: Composition) -> Result<Composition, LowerError> {
    Ok(Composition::new("let")
        .with_arg("declarations", Arg::Object(obj(vec![("params", Value::Null)])))
        .with_components(vec![
            fnnode("params = _in")?,
            Composition::new("if_nosave")
                .with_arg("test", Composition::new("mask").with_components(vec![test]))
                .with_arg(
                    "consequent",
                    Composition::new("sequence").with_components(vec![fnnode("params")?, Composition::new("mask").with_components(vec![consequent])]),
                )
                .with_arg(
                    "alternate",
                    Composition::new("sequence").with_components(vec![fnnode("params")?, Composition::new("mask").with_components(vec![alternate])]),
                ),
        ]))
}

fn rewrite_while(test: Composition, body: Composition) -> Result<Composition, LowerError> {
    Ok(Composition::new("let")
        .with_arg("declarations", Arg::Object(obj(vec![("params", Value::Null)])))
        .with_components(vec![
            fnnode("params = _in")?,
            Composition::new("while_nosave")
                .with_arg("test", Composition::new("mask").with_components(vec![test]))
                .with_arg(
                    "body",
                    Composition::new("sequence").with_components(vec![
                        fnnode("params")?,
                        Composition::new("mask").with_components(vec![body]),
                        fnnode("params = _in")?,
                    ]),
                ),
            fnnode("params")?,
        ]))
}

fn rewrite_dowhile(body: Composition, test: Composition) -> Result<Composition, LowerError> {
    Ok(Composition::new("let")
        .with_arg("declarations", Arg::Object(obj(vec![("params", Value::Null)])))
        .with_components(vec![
            fnnode("params = _in")?,
            Composition::new("dowhile_nosave")
                .with_arg(
                    "body",
                    Composition::new("sequence").with_components(vec![
                        fnnode("params")?,
                        Composition::new("mask").with_components(vec![body]),
                        fnnode("params = _in")?,
                    ]),
                )
                .with_arg("test", Composition::new("mask").with_components(vec![test])),
            fnnode("params")?,
        ]))
}

fn rewrite_repeat(count: f64, xs: &[Composition]) -> Result<Composition, LowerError> {
    Ok(Composition::new("let").with_arg("declarations", Arg::Object(obj(vec![("count", serde_json::json!(count))]))).with_components(vec![
        Composition::new("while").with_arg("test", fnnode("count-- > 0")?).with_arg(
            "body",
            Composition::new("mask").with_components(vec![Composition::new("sequence").with_components(xs.to_vec())]),
        ),
    ]))
}

fn rewrite_retry(count: f64, xs: &[Composition]) -> Result<Composition, LowerError> {
    Ok(Composition::new("let").with_arg("declarations", Arg::Object(obj(vec![("count", serde_json::json!(count))]))).with_components(vec![
        fnnode("params = _in")?,
        Composition::new("dowhile")
            .with_arg(
                "body",
                Composition::new("sequence").with_components(vec![
                    fnnode("params")?,
                    Composition::new("mask").with_components(vec![Composition::new("retain_catch").with_components(xs.to_vec())]),
                ]),
            )
            .with_arg("test", fnnode("_in.result.error != null && count-- > 0")?),
        fnnode("_in.result")?,
    ]))
}

// `BuildError` participates in `LowerError::invalid_rewrite` conversions via
// `function()`'s error type.
impl From<BuildError> for LowerError {
    fn from(e: BuildError) -> Self {
        LowerError::invalid_rewrite("function", e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CombinatorRegistry {
        CombinatorRegistry::with_defaults()
    }

    #[test]
    fn label_assigns_root_and_children() {
        let mut tree = Composition::new("sequence").with_components(vec![Composition::new("action").with_arg("name", Arg::String("/_/a".into()))]);
        label(&mut tree);
        assert_eq!(tree.path.as_deref(), Some(""));
        assert_eq!(tree.components.as_ref().unwrap()[0].path.as_deref(), Some("[0]"));
    }

    #[test]
    fn lowering_empty_reaches_sequence() {
        let tree = Composition::new("empty");
        let lowered = lower(&tree, &LowerTarget::Maximal, &registry()).unwrap();
        assert_eq!(lowered.kind, "sequence");
    }

    #[test]
    fn lowering_is_idempotent() {
        let reg = registry();
        let tree = Composition::new("repeat")
            .with_arg("count", Arg::Number(3.0))
            .with_components(vec![Composition::new("action").with_arg("name", Arg::String("/_/a".into()))]);
        let once = lower(&tree, &LowerTarget::Maximal, &reg).unwrap();
        let twice = lower(&once, &LowerTarget::Maximal, &reg).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn lowering_preserves_root_path() {
        let reg = registry();
        let mut tree = Composition::new("if")
            .with_arg("test", Composition::new("action").with_arg("name", Arg::String("/_/t".into())))
            .with_arg("consequent", Composition::new("action").with_arg("name", Arg::String("/_/c".into())));
        label(&mut tree);
        let lowered = lower(&tree, &LowerTarget::Maximal, &reg).unwrap();
        assert_eq!(lowered.path.as_deref(), Some(""));
    }

    #[test]
    fn no_lowering_target_is_identity() {
        let tree = Composition::new("if")
            .with_arg("test", Composition::new("action").with_arg("name", Arg::String("/_/t".into())))
            .with_arg("consequent", Composition::new("action").with_arg("name", Arg::String("/_/c".into())));
        let lowered = lower(&tree, &LowerTarget::None, &registry()).unwrap();
        assert_eq!(lowered.kind, "if");
    }
}
