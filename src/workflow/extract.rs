// apiflow — Value extraction from JSON response bodies
//
// Supported path syntax: dot-separated keys, optionally prefixed with `$.`,
// where a segment may index one array level: `data.items[0].id`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;

static INDEXED_SEGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^\[\]]*)\[(\d+)\]$").unwrap());

/// Evaluate `path` against `body`.
pub fn extract_path<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    let path = path
        .strip_prefix("$.")
        .or_else(|| path.strip_prefix('$'))
        .unwrap_or(path);
    if path.is_empty() {
        return Some(body);
    }

    let mut current = body;
    for segment in path.split('.') {
        current = match INDEXED_SEGMENT_RE.captures(segment) {
            Some(caps) => {
                let name = &caps[1];
                let index: usize = caps[2].parse().ok()?;
                let container = if name.is_empty() {
                    current
                } else {
                    current.get(name)?
                };
                container.get(index)?
            }
            None => current.get(segment)?,
        };
    }
    Some(current)
}

/// Render an extracted value for the string-typed variable layer.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Evaluate every `name -> path` pair; missing paths are logged and skipped.
pub fn extract_all(body: &Value, paths: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, path) in paths {
        match extract_path(body, path) {
            Some(value) => {
                out.insert(name.clone(), value_to_string(value));
            }
            None => {
                tracing::warn!(
                    variable = %name,
                    path = %path,
                    "Extraction path not found in response body"
                );
            }
        }
    }
    out
}
