//! Loads a composition (or a named table of compositions) from JSON.
//!
//! Grounded on the same shape as a registry client that turns a wire
//! descriptor into an in-memory, validated object: walk the JSON tree,
//! consult the combinator registry for each node's argument shape, and
//! recursively rebuild nested compositions. The result is identical to
//! what the builder produces from direct combinator calls, so lowering
//! and compilation don't need to know which path a tree came from.

use std::io::Read;

use serde_json::Value;

use crate::ast::{Arg, Composition};
use crate::combinator::{ArgType, CombinatorRegistry};
use crate::error::BuildError;

/// Deserializes a single composition node from its JSON form
/// (`{"type": "<kind>", ...fields, "components": [...]}`).
///
/// Idempotent: re-deserializing an already-built composition's JSON
/// representation produces an equal tree.
pub fn from_value(value: &Value, registry: &CombinatorRegistry) -> Result<Composition, BuildError> {
    let obj = value.as_object().ok_or_else(|| BuildError::MalformedJson("composition node must be a JSON object".to_string()))?;
    let kind = obj.get("type").and_then(Value::as_str).ok_or_else(|| BuildError::MalformedJson("composition node missing `type`".to_string()))?;

    let mut node = Composition::new(kind);
    if let Some(path) = obj.get("path").and_then(Value::as_str) {
        node.path = Some(path.to_string());
    }

    let descriptor = registry.get(kind);

    for (key, val) in obj.iter() {
        if key == "type" || key == "path" || key == "components" {
            continue;
        }
        let ty = descriptor.and_then(|d| d.args.iter().find(|s| s.name == key)).map(|s| s.ty);
        let arg = match ty {
            Some(ArgType::Composition) => Arg::Composition(Box::new(from_value(val, registry)?)),
            Some(ArgType::String) => {
                Arg::String(val.as_str().ok_or_else(|| BuildError::invalid_argument(kind, key, "expected string"))?.to_string())
            },
            Some(ArgType::Number) => Arg::Number(val.as_f64().ok_or_else(|| BuildError::invalid_argument(kind, key, "expected number"))?),
            Some(ArgType::Object) => {
                Arg::Object(val.as_object().ok_or_else(|| BuildError::invalid_argument(kind, key, "expected object"))?.clone())
            },
            Some(ArgType::Value) | None => Arg::Value(val.clone()),
        };
        node.args.insert(key.to_string(), arg);
    }

    if let Some(Value::Array(items)) = obj.get("components") {
        let mut components = Vec::with_capacity(items.len());
        for item in items {
            components.push(from_value(item, registry)?);
        }
        node.components = Some(components);
    }

    Ok(node)
}

/// Serializes a composition back to its JSON form.
pub fn to_value(node: &Composition) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert("type".to_string(), Value::String(node.kind.clone()));
    if let Some(path) = &node.path {
        obj.insert("path".to_string(), Value::String(path.clone()));
    }
    for (key, arg) in node.args.iter() {
        let v = match arg {
            Arg::Composition(c) => to_value(c),
            Arg::String(s) => Value::String(s.clone()),
            Arg::Number(n) => serde_json::json!(n),
            Arg::Object(m) => Value::Object(m.clone()),
            Arg::Value(v) => v.clone(),
        };
        obj.insert(key.clone(), v);
    }
    if let Some(components) = &node.components {
        obj.insert("components".to_string(), Value::Array(components.iter().map(to_value).collect()));
    }
    Value::Object(obj)
}

/// Parses a composition from a JSON string.
pub fn from_json(text: &str, registry: &CombinatorRegistry) -> Result<Composition, BuildError> {
    let value: Value = serde_json::from_str(text).map_err(|e| BuildError::MalformedJson(e.to_string()))?;
    from_value(&value, registry)
}

/// Parses a composition from any reader (a file handle, a byte slice
/// wrapped in `std::io::Cursor`, ...).
pub fn from_reader<R: Read>(mut reader: R, registry: &CombinatorRegistry) -> Result<Composition, BuildError> {
    let mut text = String::new();
    reader.read_to_string(&mut text).map_err(|e| BuildError::MalformedJson(e.to_string()))?;
    from_json(&text, registry)
}

/// Parses a named table of compositions, e.g. a deployment manifest mapping
/// action names to their composition bodies.
pub fn table_from_value(value: &Value, registry: &CombinatorRegistry) -> Result<std::collections::BTreeMap<String, Composition>, BuildError> {
    let obj = value.as_object().ok_or_else(|| BuildError::MalformedJson("composition table must be a JSON object".to_string()))?;
    let mut out = std::collections::BTreeMap::new();
    for (name, node_json) in obj.iter() {
        out.insert(name.clone(), from_value(node_json, registry)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_sequence_of_actions() {
        let registry = CombinatorRegistry::with_defaults();
        let original = Composition::new("sequence").with_components(vec![
            Composition::new("action").with_arg("name", Arg::String("/_/a".to_string())),
            Composition::new("action").with_arg("name", Arg::String("/_/b".to_string())),
        ]);
        let json = to_value(&original);
        let rebuilt = from_value(&json, &registry).unwrap();
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn deserialize_is_idempotent() {
        let registry = CombinatorRegistry::with_defaults();
        let json = serde_json::json!({"type": "action", "name": "/_/a"});
        let once = from_value(&json, &registry).unwrap();
        let again = from_value(&to_value(&once), &registry).unwrap();
        assert_eq!(once, again);
    }

    #[test]
    fn missing_type_is_malformed() {
        let registry = CombinatorRegistry::with_defaults();
        let err = from_value(&serde_json::json!({"name": "/_/a"}), &registry).unwrap_err();
        assert!(matches!(err, BuildError::MalformedJson(_)));
    }

    #[test]
    fn table_from_value_reads_named_compositions() {
        let registry = CombinatorRegistry::with_defaults();
        let json = serde_json::json!({
            "greet": {"type": "action", "name": "/_/greet"},
        });
        let table = table_from_value(&json, &registry).unwrap();
        assert!(table.contains_key("greet"));
    }
}
