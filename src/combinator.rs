//! Combinator registry and builder.
//!
//! Mirrors the shape of a compiled tool registry: a fixed table of
//! descriptors built once, wrapped for read-only sharing, with a builder
//! that validates positional arguments against each descriptor before
//! producing an AST node.

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::ast::{Arg, Composition};
use crate::error::BuildError;
use crate::host::parse_action_name;

/// The declared type of a named argument slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    /// A nested composition; bare values are coerced via [`task`].
    Composition,
    String,
    Number,
    /// A non-null, non-array JSON object.
    Object,
    /// Any JSON value except a function/callable.
    Value,
}

#[derive(Debug, Clone)]
pub struct ArgSlot {
    pub name: &'static str,
    pub ty: ArgType,
    pub optional: bool,
}

const fn slot(name: &'static str, ty: ArgType, optional: bool) -> ArgSlot {
    ArgSlot { name, ty, optional }
}

/// Describes the shape of one combinator: whether it accepts a variadic
/// `components` list, its named argument slots, and the minimum version at
/// which it is considered part of a version-targeted lowering set.
#[derive(Debug, Clone)]
pub struct CombinatorDescriptor {
    pub name: &'static str,
    pub variadic: bool,
    pub args: Vec<ArgSlot>,
    /// Minimum version string at which this combinator is available; `None`
    /// means it is primitive (always available, never lowered further).
    pub since: Option<&'static str>,
}

impl CombinatorDescriptor {
    fn primitive(name: &'static str, variadic: bool, args: Vec<ArgSlot>) -> Self {
        CombinatorDescriptor { name, variadic, args, since: None }
    }

    fn enhanced(name: &'static str, variadic: bool, args: Vec<ArgSlot>, since: &'static str) -> Self {
        CombinatorDescriptor { name, variadic, args, since: Some(since) }
    }

    pub fn is_primitive(&self) -> bool {
        self.since.is_none()
    }

    fn max_positional(&self) -> usize {
        self.args.len() + if self.variadic { usize::MAX / 2 } else { 0 }
    }
}

/// A table of combinator descriptors, mutable only at construction time.
///
/// Once handed to a [`Builder`] it is wrapped in an `Arc` and treated as
/// immutable for the rest of the pipeline, matching how a tool registry is
/// compiled once and then shared read-only across executors.
#[derive(Debug, Clone)]
pub struct CombinatorRegistry {
    entries: BTreeMap<String, CombinatorDescriptor>,
}

static DEFAULT_REGISTRY: Lazy<CombinatorRegistry> = Lazy::new(CombinatorRegistry::with_defaults);

impl CombinatorRegistry {
    pub fn empty() -> Self {
        CombinatorRegistry { entries: BTreeMap::new() }
    }

    /// The built-in table described in the combinator reference: primitives
    /// plus the enhanced combinators that lower onto them.
    pub fn with_defaults() -> Self {
        use ArgType::*;
        let mut reg = CombinatorRegistry::empty();
        let defs: Vec<CombinatorDescriptor> = vec![
            CombinatorDescriptor::primitive("empty", false, vec![]),
            CombinatorDescriptor::primitive("sequence", true, vec![]),
            CombinatorDescriptor::primitive(
                "if_nosave",
                false,
                vec![slot("test", Composition, false), slot("consequent", Composition, false), slot("alternate", Composition, true)],
            ),
            CombinatorDescriptor::primitive(
                "while_nosave",
                false,
                vec![slot("test", Composition, false), slot("body", Composition, false)],
            ),
            CombinatorDescriptor::primitive(
                "dowhile_nosave",
                false,
                vec![slot("body", Composition, false), slot("test", Composition, false)],
            ),
            CombinatorDescriptor::primitive(
                "try",
                false,
                vec![slot("body", Composition, false), slot("handler", Composition, false)],
            ),
            CombinatorDescriptor::primitive(
                "finally",
                false,
                vec![slot("body", Composition, false), slot("finalizer", Composition, false)],
            ),
            CombinatorDescriptor::primitive("let", true, vec![slot("declarations", Object, false)]),
            CombinatorDescriptor::primitive("mask", true, vec![]),
            CombinatorDescriptor::primitive(
                "action",
                false,
                vec![slot("name", String, false), slot("options", Object, true)],
            ),
            CombinatorDescriptor::primitive("function", false, vec![slot("function", Object, false)]),
            // Enhanced combinators lower to the primitives above.
            CombinatorDescriptor::enhanced(
                "if",
                false,
                vec![slot("test", Composition, false), slot("consequent", Composition, false), slot("alternate", Composition, true)],
                "0.1.0",
            ),
            CombinatorDescriptor::enhanced(
                "while",
                false,
                vec![slot("test", Composition, false), slot("body", Composition, false)],
                "0.1.0",
            ),
            CombinatorDescriptor::enhanced(
                "dowhile",
                false,
                vec![slot("body", Composition, false), slot("test", Composition, false)],
                "0.1.0",
            ),
            CombinatorDescriptor::enhanced("seq", true, vec![], "0.1.0"),
            CombinatorDescriptor::enhanced(
                "composition",
                false,
                vec![slot("name", String, false), slot("composition", Composition, false), slot("options", Object, true)],
                "0.1.0",
            ),
            CombinatorDescriptor::enhanced("retain", true, vec![], "0.1.0"),
            CombinatorDescriptor::enhanced("retain_catch", true, vec![], "0.2.0"),
            CombinatorDescriptor::enhanced("repeat", true, vec![slot("count", Number, false)], "0.1.0"),
            CombinatorDescriptor::enhanced("retry", true, vec![slot("count", Number, false)], "0.1.0"),
            CombinatorDescriptor::enhanced("value", false, vec![slot("value", Value, false)], "0.1.0"),
            CombinatorDescriptor::enhanced("literal", false, vec![slot("value", Value, false)], "0.1.0"),
        ];
        for d in defs {
            reg.entries.insert(d.name.to_string(), d);
        }
        reg
    }

    pub fn get(&self, name: &str) -> Option<&CombinatorDescriptor> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Merge in descriptors from a plugin. Existing names are never
    /// overridden, matching the "new names do not override existing ones"
    /// contract for plugin-contributed combinators.
    pub fn merge(&mut self, additions: Vec<CombinatorDescriptor>) {
        for d in additions {
            self.entries.entry(d.name.to_string()).or_insert(d);
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl Default for CombinatorRegistry {
    fn default() -> Self {
        DEFAULT_REGISTRY.clone()
    }
}

/// A raw, not-yet-coerced positional argument as supplied by a caller of the
/// builder API. Distinct from [`Arg`] in that it can represent a bare
/// function source (`Function`) or `Null`, both of which [`task`] coerces.
#[derive(Debug, Clone)]
pub enum BuilderArg {
    Null,
    Composition(Composition),
    /// Inline function source text; coerced to a `function` node by `task`.
    Function(String),
    String(String),
    Number(f64),
    Object(serde_json::Map<String, Value>),
    Value(Value),
}

impl From<Composition> for BuilderArg {
    fn from(c: Composition) -> Self {
        BuilderArg::Composition(c)
    }
}

impl From<&str> for BuilderArg {
    fn from(s: &str) -> Self {
        BuilderArg::String(s.to_string())
    }
}

const NATIVE_CODE_MARKER: &str = "[native code]";

/// `function(x)`: wrap inline source as a `function` node, rejecting native
/// (non-introspectable) code the way the source system rejects
/// `[native code]` function bodies.
pub fn function(source: impl Into<String>) -> Result<Composition, BuildError> {
    let source = source.into();
    if source.contains(NATIVE_CODE_MARKER) {
        return Err(BuildError::NativeFunctionCapture);
    }
    let mut exec = serde_json::Map::new();
    exec.insert("kind".to_string(), Value::String("nodejs:default".to_string()));
    exec.insert("code".to_string(), Value::String(source));
    let mut wrapper = serde_json::Map::new();
    wrapper.insert("exec".to_string(), Value::Object(exec));
    Ok(Composition::new("function").with_arg("function", Arg::Object(wrapper)))
}

/// `action(name, options)`: parse and validate the action name grammar,
/// attach any options payload verbatim.
pub fn action(name: &str, options: Option<serde_json::Map<String, Value>>) -> Result<Composition, BuildError> {
    let qualified = parse_action_name(name).map_err(|e| BuildError::InvalidName(e.to_string()))?;
    let mut c = Composition::new("action").with_arg("name", Arg::String(qualified));
    if let Some(o) = options {
        c = c.with_arg("options", Arg::Object(o));
    }
    Ok(c)
}

/// `task(x)`: the canonical coercion applied to every positional argument
/// typed `Composition` — `null` becomes `empty()`, an existing composition
/// passes through, a function source is wrapped, a bare string is treated
/// as an action name, anything else is an error.
pub fn task(x: BuilderArg) -> Result<Composition, BuildError> {
    match x {
        BuilderArg::Null => Ok(Composition::empty()),
        BuilderArg::Composition(c) => Ok(c),
        BuilderArg::Function(src) => function(src),
        BuilderArg::String(name) => action(&name, None),
        BuilderArg::Object(_) | BuilderArg::Number(_) | BuilderArg::Value(_) => {
            Err(BuildError::invalid_argument("task", "x", "expected null, composition, function, or action name string"))
        },
    }
}

/// Builds AST nodes from a [`CombinatorRegistry`], enforcing each
/// descriptor's positional-argument contract.
pub struct Builder {
    registry: Arc<CombinatorRegistry>,
}

impl Builder {
    pub fn new(registry: Arc<CombinatorRegistry>) -> Self {
        Builder { registry }
    }

    pub fn registry(&self) -> &CombinatorRegistry {
        &self.registry
    }

    /// Generic build entry point: validates argument count and per-slot
    /// types against the combinator's descriptor, coercing `Composition`
    /// slots via [`task`], then returns the assembled node. Combinators with
    /// bespoke construction rules (`action`, `function`, `composition`,
    /// `value`/`literal`) have dedicated constructors instead.
    pub fn build(&self, kind: &str, mut positional: Vec<BuilderArg>) -> Result<Composition, BuildError> {
        let desc = self.registry.get(kind).ok_or_else(|| BuildError::UnknownCombinator(kind.to_string()))?;

        if !desc.variadic && positional.len() > desc.args.len() {
            return Err(BuildError::too_many_arguments(kind, desc.args.len(), positional.len()));
        }

        let mut node = Composition::new(kind);
        let named_count = desc.args.len();
        let named: Vec<BuilderArg> = if positional.len() >= named_count {
            positional.drain(..named_count).collect()
        } else {
            let got = positional.len();
            positional.drain(..).chain(std::iter::repeat_with(|| BuilderArg::Null).take(named_count - got)).collect()
        };

        for (slot_desc, value) in desc.args.iter().zip(named.into_iter()) {
            let is_null = matches!(value, BuilderArg::Null);
            if is_null {
                if slot_desc.optional {
                    continue;
                }
                return Err(BuildError::invalid_argument(kind, slot_desc.name, "required argument missing"));
            }
            let arg = coerce_slot(kind, slot_desc, value)?;
            node.args.insert(slot_desc.name.to_string(), arg);
        }

        if desc.variadic {
            let rest = positional.into_iter().map(task).collect::<Result<Vec<_>, _>>()?;
            node.components = Some(rest);
        }

        Ok(node)
    }
}

fn coerce_slot(kind: &str, slot_desc: &ArgSlot, value: BuilderArg) -> Result<Arg, BuildError> {
    match slot_desc.ty {
        ArgType::Composition => Ok(Arg::Composition(Box::new(task(value)?))),
        ArgType::String => match value {
            BuilderArg::String(s) => Ok(Arg::String(s)),
            _ => Err(BuildError::invalid_argument(kind, slot_desc.name, "expected string")),
        },
        ArgType::Number => match value {
            BuilderArg::Number(n) => Ok(Arg::Number(n)),
            _ => Err(BuildError::invalid_argument(kind, slot_desc.name, "expected number")),
        },
        ArgType::Object => match value {
            BuilderArg::Object(m) => Ok(Arg::Object(m)),
            _ => Err(BuildError::invalid_argument(kind, slot_desc.name, "expected object")),
        },
        ArgType::Value => match value {
            BuilderArg::Function(_) => Err(BuildError::invalid_argument(kind, slot_desc.name, "value slot cannot hold a function")),
            BuilderArg::Null => Ok(Arg::Value(Value::Object(Default::default()))),
            BuilderArg::Composition(_) => Err(BuildError::invalid_argument(kind, slot_desc.name, "expected value, got composition")),
            BuilderArg::String(s) => Ok(Arg::Value(Value::String(s))),
            BuilderArg::Number(n) => Ok(Arg::Value(serde_json::json!(n))),
            BuilderArg::Object(m) => Ok(Arg::Value(Value::Object(m))),
            BuilderArg::Value(v) => Ok(Arg::Value(v)),
        },
    }
}

/// `value(v)` / `literal(v)`: produce a constant, bypassing the generic
/// builder since the value slot must accept any JSON value verbatim.
pub fn value(v: Value) -> Composition {
    Composition::new("value").with_arg("value", Arg::Value(v))
}

pub fn literal(v: Value) -> Composition {
    Composition::new("literal").with_arg("value", Arg::Value(v))
}

/// `composition(name, body, options)`: a named, deployable composition.
pub fn composition(name: &str, body: BuilderArg, options: Option<serde_json::Map<String, Value>>) -> Result<Composition, BuildError> {
    if name.trim().is_empty() {
        return Err(BuildError::AnonymousComposition);
    }
    let _ = parse_action_name(name).map_err(|e| BuildError::InvalidName(e.to_string()))?;
    let mut c = Composition::new("composition")
        .with_arg("name", Arg::String(name.to_string()))
        .with_arg("composition", Arg::Composition(Box::new(task(body)?)));
    if let Some(o) = options {
        c = c.with_arg("options", Arg::Object(o));
    }
    Ok(c)
}
