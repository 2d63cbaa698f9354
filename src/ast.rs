//! The composition AST: a dynamically-typed tree of combinator applications.
//!
//! The tree is deliberately open (a `kind` string plus a map of named
//! arguments) rather than a closed Rust enum. Plugins (see [`crate::plugin`])
//! register new combinator kinds at runtime, and a closed enum cannot grow to
//! accommodate that without recompiling the crate.

use std::collections::BTreeMap;

use serde_json::Value;

/// One named-argument slot on a composition node.
///
/// `Value` covers any JSON value (used for the `value`/`literal` combinator
/// and for free-form `options` payloads); it is distinct from `Object` in
/// that it permits scalars and arrays, which `Object` rejects.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Composition(Box<Composition>),
    String(String),
    Number(f64),
    Object(serde_json::Map<String, Value>),
    Value(Value),
}

impl Arg {
    pub fn as_composition(&self) -> Option<&Composition> {
        match self {
            Arg::Composition(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&serde_json::Map<String, Value>> {
        match self {
            Arg::Object(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Arg::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// A node in the composition tree.
///
/// `components` is populated only for variadic combinators (`sequence`,
/// `let`, `mask`, `retain`, `repeat`, `retry`, ...); `args` holds every named
/// slot the combinator's descriptor declares.
#[derive(Debug, Clone, PartialEq)]
pub struct Composition {
    pub kind: String,
    pub components: Option<Vec<Composition>>,
    pub args: BTreeMap<String, Arg>,
    /// JSON-pointer-like label assigned by `label()`; absent until labeled.
    pub path: Option<String>,
}

impl Composition {
    pub fn new(kind: impl Into<String>) -> Self {
        Composition { kind: kind.into(), components: None, args: BTreeMap::new(), path: None }
    }

    pub fn with_components(mut self, components: Vec<Composition>) -> Self {
        self.components = Some(components);
        self
    }

    pub fn with_arg(mut self, name: impl Into<String>, arg: Arg) -> Self {
        self.args.insert(name.into(), arg);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn arg(&self, name: &str) -> Option<&Arg> {
        self.args.get(name)
    }

    pub fn child_composition(&self, name: &str) -> Option<&Composition> {
        self.arg(name).and_then(Arg::as_composition)
    }

    pub fn components_or_empty(&self) -> &[Composition] {
        self.components.as_deref().unwrap_or(&[])
    }

    /// `empty()` — the canonical zero-child sequence, used as the result of
    /// coercing `null` in `task()`.
    pub fn empty() -> Self {
        Composition::new("empty")
    }
}
