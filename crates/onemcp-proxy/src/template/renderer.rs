//! Placeholder rendering over configuration JSON.
//!
//! Placeholders use `{{dotted.path}}` syntax and resolve against the session
//! context. Extraction is static: a template declares exactly the variables
//! that appear in its serialized configuration, so two contexts that agree on
//! those variables render identically.

use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;
use thiserror::Error;

use crate::context::SessionContext;

/// Rendering failures.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unresolved placeholder '{{{{{0}}}}}'")]
    UnresolvedPlaceholder(String),

    #[error("template serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn placeholder_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder regex is valid")
    })
}

/// Collect every placeholder path appearing in string leaves of `value`.
pub fn extract_placeholders(value: &Value) -> BTreeSet<String> {
    let mut paths = BTreeSet::new();
    collect(value, &mut paths);
    paths
}

fn collect(value: &Value, paths: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            for capture in placeholder_regex().captures_iter(s) {
                paths.insert(capture[1].to_string());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, paths);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect(item, paths);
            }
        }
        _ => {}
    }
}

/// Resolve the subset of context variables a template references.
pub fn resolve_variables(
    value: &Value,
    context: &SessionContext,
) -> Result<BTreeMap<String, String>, TemplateError> {
    let mut variables = BTreeMap::new();
    for path in extract_placeholders(value) {
        let resolved = context
            .lookup(&path)
            .ok_or_else(|| TemplateError::UnresolvedPlaceholder(path.clone()))?;
        variables.insert(path, resolved);
    }
    Ok(variables)
}

/// Substitute placeholders in every string leaf.
pub fn render_value(
    value: &Value,
    variables: &BTreeMap<String, String>,
) -> Result<Value, TemplateError> {
    Ok(match value {
        Value::String(s) => Value::String(render_str(s, variables)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_value(item, variables))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                rendered.insert(key.clone(), render_value(item, variables)?);
            }
            Value::Object(rendered)
        }
        other => other.clone(),
    })
}

/// Substitute placeholders in a single string.
pub fn render_str(
    input: &str,
    variables: &BTreeMap<String, String>,
) -> Result<String, TemplateError> {
    let mut missing: Option<String> = None;
    let rendered = placeholder_regex().replace_all(input, |caps: &regex::Captures<'_>| {
        match variables.get(&caps[1]) {
            Some(value) => value.clone(),
            None => {
                if missing.is_none() {
                    missing = Some(caps[1].to_string());
                }
                String::new()
            }
        }
    });
    match missing {
        Some(path) => Err(TemplateError::UnresolvedPlaceholder(path)),
        None => Ok(rendered.into_owned()),
    }
}

/// Deterministic identity hash over a rendered variable set.
///
/// The map is key-sorted (`BTreeMap`), so any two contexts that resolve the
/// same variables to the same values produce the same hash.
pub fn rendered_hash(variables: &BTreeMap<String, String>) -> String {
    let mut buffer = String::new();
    for (key, value) in variables {
        buffer.push_str(key);
        buffer.push('=');
        buffer.push_str(value);
        buffer.push('\n');
    }
    format!("{:x}", md5::compute(buffer.as_bytes()))
}
