//! Template resolution over JSON parameter trees.
//!
//! Two placeholder families exist: `{{secret:KEY}}` (resolved from the
//! secret store, after policy so audit keeps the template form) and
//! `{{task:ID.FIELD}}` (resolved from upstream task outputs, only inside the
//! plan executor). A string that is exactly one task reference substitutes
//! the referenced value preserving its JSON type; references embedded in a
//! larger string are stringified, with objects and arrays rendered as
//! compact JSON.

use crate::error::ToolError;
use crate::secrets::SecretStore;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

static SECRET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{secret:([A-Za-z0-9_]+)\}\}").expect("secret template regex"));

static TASK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{task:([^.}\s]+)(?:\.([^}\s]+))?\}\}").expect("task template regex"));

static TASK_RE_FULL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\{\{task:([^.}\s]+)(?:\.([^}\s]+))?\}\}$").expect("task template regex")
});

/// True when any string leaf of `params` contains a secret placeholder.
pub fn has_secret_templates(params: &Value) -> bool {
    match params {
        Value::String(s) => SECRET_RE.is_match(s),
        Value::Object(map) => map.values().any(has_secret_templates),
        Value::Array(items) => items.iter().any(has_secret_templates),
        _ => false,
    }
}

/// Expand `{{secret:KEY}}` placeholders across the tree. The input is left
/// untouched; callers keep it for policy and audit.
pub fn resolve_secrets(params: &Value, secrets: &SecretStore) -> Result<Value, ToolError> {
    match params {
        Value::String(s) => {
            let mut failed: Option<String> = None;
            let replaced = SECRET_RE.replace_all(s, |caps: &regex::Captures<'_>| {
                let key = &caps[1];
                match secrets.get(key) {
                    Some(v) => v,
                    None => {
                        failed.get_or_insert_with(|| key.to_string());
                        String::new()
                    }
                }
            });
            if let Some(key) = failed {
                let available = secrets.list_keys().join(", ");
                return Err(ToolError::invalid(format!(
                    "Secret key '{key}' not found. Available keys: {}",
                    if available.is_empty() {
                        "(none)"
                    } else {
                        available.as_str()
                    }
                )));
            }
            Ok(Value::String(replaced.into_owned()))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_secrets(v, secrets)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|v| resolve_secrets(v, secrets))
                .collect::<Result<_, _>>()?,
        )),
        other => Ok(other.clone()),
    }
}

fn lookup_task_ref(
    outputs: &HashMap<String, Value>,
    task_id: &str,
    field: Option<&str>,
) -> Result<Value, ToolError> {
    let output = outputs.get(task_id).ok_or_else(|| {
        ToolError::invalid(format!(
            "Task reference '{{{{task:{task_id}}}}}' does not match a completed task"
        ))
    })?;
    match field {
        None => Ok(output.clone()),
        Some(field) => output.get(field).cloned().ok_or_else(|| {
            ToolError::invalid(format!(
                "Task '{task_id}' output has no field '{field}'"
            ))
        }),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Expand `{{task:ID.FIELD}}` placeholders from completed task outputs.
pub fn resolve_task_refs(
    params: &Value,
    outputs: &HashMap<String, Value>,
) -> Result<Value, ToolError> {
    match params {
        Value::String(s) => {
            if let Some(caps) = TASK_RE_FULL.captures(s) {
                // Entire string is one reference: preserve the value's type.
                let task_id = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                let field = caps.get(2).map(|m| m.as_str());
                return lookup_task_ref(outputs, task_id, field);
            }
            let mut failed: Option<ToolError> = None;
            let replaced = TASK_RE.replace_all(s, |caps: &regex::Captures<'_>| {
                let task_id = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                let field = caps.get(2).map(|m| m.as_str());
                match lookup_task_ref(outputs, task_id, field) {
                    Ok(v) => stringify(&v),
                    Err(e) => {
                        failed.get_or_insert(e);
                        String::new()
                    }
                }
            });
            if let Some(err) = failed {
                return Err(err);
            }
            Ok(Value::String(replaced.into_owned()))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_task_refs(v, outputs)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|v| resolve_task_refs(v, outputs))
                .collect::<Result<_, _>>()?,
        )),
        other => Ok(other.clone()),
    }
}
