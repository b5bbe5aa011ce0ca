//! Per-run workflow state and the `${N.path}` variable resolution grammar.

use serde_json::Value;
use std::collections::HashMap;

use crate::zerg::domain::{NodeId, OutputEnvelope};
use crate::zerg::error::ZergError;

/// Mutable state threaded through one workflow run: every node's output
/// envelope, completion order, and the first captured failure.
#[derive(Default)]
pub struct WorkflowState {
    pub node_outputs: HashMap<NodeId, OutputEnvelope>,
    pub completed_nodes: Vec<NodeId>,
    pub error: Option<String>,
}

impl WorkflowState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, node_id: NodeId, envelope: OutputEnvelope) {
        self.node_outputs.insert(node_id.clone(), envelope);
        self.completed_nodes.push(node_id);
    }
}

/// Resolve every `${...}` reference inside `raw`, recursively through
/// objects/arrays, against `state.node_outputs`.
///
/// Type preservation: when a JSON string value is *entirely* one `${...}`
/// expression, the resolved value replaces it verbatim (keeping its real
/// type); when the expression is embedded in a longer string, the resolved
/// value is stringified in place.
pub fn resolve_variables(raw: &Value, state: &WorkflowState) -> Result<Value, ZergError> {
    match raw {
        Value::String(s) => resolve_string(s, state),
        Value::Array(items) => {
            let resolved: Result<Vec<Value>, ZergError> =
                items.iter().map(|item| resolve_variables(item, state)).collect();
            Ok(Value::Array(resolved?))
        }
        Value::Object(map) => {
            let mut resolved = serde_json::Map::new();
            for (key, value) in map {
                resolved.insert(key.clone(), resolve_variables(value, state)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(s: &str, state: &WorkflowState) -> Result<Value, ZergError> {
    if is_single_expression(s) {
        let inner = &s[2..s.len() - 1];
        return resolve_reference(inner, state);
    }

    let mut output = String::new();
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(end_offset) = rest[start..].find('}') else {
            output.push_str(rest);
            rest = "";
            break;
        };
        let end = start + end_offset;
        output.push_str(&rest[..start]);
        let inner = &rest[start + 2..end];
        let resolved = resolve_reference(inner, state)?;
        output.push_str(&stringify(&resolved));
        rest = &rest[end + 1..];
    }
    output.push_str(rest);
    Ok(Value::String(output))
}

fn is_single_expression(s: &str) -> bool {
    s.starts_with("${") && s.ends_with('}') && s.matches("${").count() == 1 && s.find('}') == Some(s.len() - 1)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolve one `${...}` reference body (the part between `${` and `}`):
/// `N`, `N.value`, `N.result`, `N.meta.K`, `N.result.K`, `N.value.K`.
///
/// A node's `value` is occasionally itself a pre-existing flat envelope
/// (`{result: ..., meta: {...}}`, the shape older node outputs used before
/// `{value, meta}` was standardized). When a lookup misses against the
/// current envelope, this falls back to reading the same path out of that
/// nested shape before giving up.
fn resolve_reference(reference: &str, state: &WorkflowState) -> Result<Value, ZergError> {
    let mut parts = reference.splitn(2, '.');
    let node_id = parts.next().unwrap_or_default().to_string();
    let rest = parts.next();

    let envelope = state
        .node_outputs
        .get(&node_id)
        .ok_or_else(|| ZergError::validation(format!("unknown node reference: {node_id}")))?;

    let Some(rest) = rest else {
        return Ok(envelope.value.clone());
    };

    if let Some(meta_path) = rest.strip_prefix("meta.") {
        if let Some(value) = envelope.meta.get(meta_path) {
            return Ok(value.clone());
        }
        if let Some(value) = legacy_lookup(&envelope.value, "meta", meta_path) {
            return Ok(value);
        }
        return Err(ZergError::validation(format!("unknown meta field: {node_id}.meta.{meta_path}")));
    }

    if rest == "value" || rest == "result" {
        return Ok(envelope.value.clone());
    }

    for prefix in ["value.", "result."] {
        if let Some(path) = rest.strip_prefix(prefix) {
            if let Some(value) = lookup_nested(&envelope.value, path) {
                return Ok(value);
            }
            if let Some(value) = legacy_lookup(&envelope.value, "result", path) {
                return Ok(value);
            }
            return Err(ZergError::validation(format!("unknown path: {node_id}.{rest}")));
        }
    }

    Err(ZergError::validation(format!("unsupported reference: {node_id}.{rest}")))
}

/// Looks up `path` inside `envelope_value[legacy_field]`, the flat-envelope
/// fallback shape (`{result: {...}}` / `{meta: {...}}` nested one level
/// under the current value rather than being the value itself).
fn legacy_lookup(envelope_value: &Value, legacy_field: &str, path: &str) -> Option<Value> {
    let nested = envelope_value.get(legacy_field)?;
    lookup_nested(nested, path)
}

fn lookup_nested(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zerg::domain::OutputEnvelope;
    use serde_json::json;
    use std::collections::HashMap as Map;

    fn sample_state() -> WorkflowState {
        let mut state = WorkflowState::new();
        let mut meta = Map::new();
        meta.insert("tool_name".to_string(), json!("calculator"));
        state.record(
            "n1".to_string(),
            OutputEnvelope { value: json!({"total": 42, "label": "ok"}), meta },
        );
        state
    }

    #[test]
    fn whole_field_expression_preserves_type() {
        let state = sample_state();
        let resolved = resolve_variables(&json!("${n1.value.total}"), &state).unwrap();
        assert_eq!(resolved, json!(42));
    }

    #[test]
    fn embedded_expression_is_stringified() {
        let state = sample_state();
        let resolved = resolve_variables(&json!("total was ${n1.value.total} units"), &state).unwrap();
        assert_eq!(resolved, json!("total was 42 units"));
    }

    #[test]
    fn meta_reference_resolves() {
        let state = sample_state();
        let resolved = resolve_variables(&json!("${n1.meta.tool_name}"), &state).unwrap();
        assert_eq!(resolved, json!("calculator"));
    }

    #[test]
    fn unknown_node_reference_fails() {
        let state = sample_state();
        assert!(resolve_variables(&json!("${missing}"), &state).is_err());
    }

    #[test]
    fn nested_object_structure_is_resolved_recursively() {
        let state = sample_state();
        let resolved = resolve_variables(&json!({"x": "${n1}"}), &state).unwrap();
        assert_eq!(resolved["x"]["total"], json!(42));
    }
}
