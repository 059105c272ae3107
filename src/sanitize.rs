//! Depth-bounded JSON externalization
//!
//! Sessions and reports are converted to `serde_json::Value` trees before they
//! cross the persistence boundary or end up in logs. Free-form payload fields
//! can nest arbitrarily, so every tree is pruned to a maximum depth and a
//! maximum number of nodes. Owned `Value` trees cannot contain cycles.

use serde::Serialize;
use serde_json::{Map, Value};

/// Replacement for containers nested deeper than the configured limit
pub const DEPTH_MARKER: &str = "[max depth]";

/// Replacement for nodes past the node budget
pub const SIZE_MARKER: &str = "[truncated]";

/// Node budget for a single externalized tree
pub const DEFAULT_MAX_NODES: usize = 10_000;

/// Serialize `value` and prune the resulting tree to `max_depth`
pub fn bounded_json<T: Serialize>(value: &T, max_depth: usize) -> Result<Value, serde_json::Error> {
    let raw = serde_json::to_value(value)?;
    Ok(bound_value(&raw, max_depth))
}

/// Prune a JSON tree so no container sits deeper than `max_depth`
pub fn bound_value(value: &Value, max_depth: usize) -> Value {
    let mut budget = DEFAULT_MAX_NODES;
    prune(value, 0, max_depth, &mut budget)
}

/// Prune every value of an object map; used for free-form event fields
pub fn bound_map(map: &Map<String, Value>, max_depth: usize) -> Map<String, Value> {
    let mut budget = DEFAULT_MAX_NODES;
    map.iter()
        .map(|(k, v)| (k.clone(), prune(v, 1, max_depth, &mut budget)))
        .collect()
}

fn prune(value: &Value, depth: usize, max_depth: usize, budget: &mut usize) -> Value {
    if *budget == 0 {
        return Value::String(SIZE_MARKER.to_string());
    }
    *budget -= 1;

    match value {
        Value::Array(items) => {
            if depth >= max_depth {
                return Value::String(DEPTH_MARKER.to_string());
            }
            Value::Array(
                items
                    .iter()
                    .map(|v| prune(v, depth + 1, max_depth, budget))
                    .collect(),
            )
        }
        Value::Object(fields) => {
            if depth >= max_depth {
                return Value::String(DEPTH_MARKER.to_string());
            }
            Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), prune(v, depth + 1, max_depth, budget)))
                    .collect(),
            )
        }
        scalar => scalar.clone(),
    }
}
