// apiflow — Template resolution against the layered variable context
//
// Resolution is best-effort: a name that cannot be resolved is logged and its
// `{{name}}` placeholder is left in the output untouched.

use super::dynamic::DynamicVariableRegistry;
use super::{VariableContext, VariableError, KEY_RE};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

static TEMPLATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{([^{}]*)\}\}").unwrap());
static NESTED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{[^}]*\{\{").unwrap());
static EMPTY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\s*\}\}").unwrap());

const SECRET_MASK: &str = "********";

/// The layer a value was resolved from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VariableSource {
    Dynamic,
    Resolved,
    Workflow,
    Request,
    Collection,
    Environment,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TemplateValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Resolution outcome of one variable, for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VariablePreview {
    pub name: String,
    pub value: Option<String>,
    pub source: Option<VariableSource>,
    pub is_secret: bool,
    pub error: Option<String>,
}

struct Lookup {
    value: String,
    source: VariableSource,
    is_secret: bool,
}

#[derive(Clone)]
pub struct VariableResolver {
    dynamic: DynamicVariableRegistry,
}

impl VariableResolver {
    pub fn new(dynamic: DynamicVariableRegistry) -> Self {
        Self { dynamic }
    }

    pub fn dynamic(&self) -> &DynamicVariableRegistry {
        &self.dynamic
    }

    fn lookup(&self, name: &str, ctx: &VariableContext) -> Result<Lookup, VariableError> {
        if name.starts_with('$') {
            return self
                .dynamic
                .generate(name)
                .map(|value| Lookup {
                    value,
                    source: VariableSource::Dynamic,
                    is_secret: false,
                })
                .ok_or_else(|| VariableError::VariableNotFound(name.to_string()));
        }

        if let Some(value) = ctx.resolved.get(name) {
            return Ok(Lookup {
                value: value.clone(),
                source: VariableSource::Resolved,
                is_secret: false,
            });
        }

        for (source, layer) in ctx.layers() {
            if let Some(var) = layer.get(name).filter(|v| v.enabled) {
                return Ok(Lookup {
                    value: var.value.clone(),
                    source,
                    is_secret: var.is_secret,
                });
            }
        }

        Err(VariableError::VariableNotFound(name.to_string()))
    }

    /// Resolve a single variable name (without braces).
    pub fn resolve_name(&self, name: &str, ctx: &VariableContext) -> Result<String, VariableError> {
        self.lookup(name.trim(), ctx).map(|l| l.value)
    }

    /// Substitute every `{{name}}` span in `template`.
    pub fn resolve(&self, template: &str, ctx: &VariableContext) -> String {
        if !template.contains("{{") {
            return template.to_string();
        }
        TEMPLATE_RE
            .replace_all(template, |caps: &Captures| {
                let name = caps[1].trim();
                match self.lookup(name, ctx) {
                    Ok(found) => found.value,
                    Err(e) => {
                        tracing::warn!(variable = %name, "Leaving placeholder in place: {}", e);
                        caps[0].to_string()
                    }
                }
            })
            .into_owned()
    }

    /// Resolve every string leaf of a JSON value; other leaves are kept as is.
    pub fn resolve_value(&self, value: &Value, ctx: &VariableContext) -> Value {
        match value {
            Value::String(s) => Value::String(self.resolve(s, ctx)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.resolve_value(v, ctx)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v, ctx)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Like [`resolve`](Self::resolve) but reports value and origin per name.
    pub fn preview_resolution(
        &self,
        template: &str,
        ctx: &VariableContext,
    ) -> Vec<VariablePreview> {
        extract_variables(template)
            .into_iter()
            .map(|name| match self.lookup(&name, ctx) {
                Ok(found) => VariablePreview {
                    value: Some(if found.is_secret {
                        SECRET_MASK.to_string()
                    } else {
                        found.value
                    }),
                    source: Some(found.source),
                    is_secret: found.is_secret,
                    error: None,
                    name,
                },
                Err(e) => VariablePreview {
                    value: None,
                    source: None,
                    is_secret: false,
                    error: Some(e.to_string()),
                    name,
                },
            })
            .collect()
    }
}

impl Default for VariableResolver {
    fn default() -> Self {
        Self::new(DynamicVariableRegistry::new())
    }
}

/// Distinct variable names referenced in `template`, in first-seen order.
pub fn extract_variables(template: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    TEMPLATE_RE
        .captures_iter(template)
        .map(|c| c[1].trim().to_string())
        .filter(|name| !name.is_empty() && seen.insert(name.clone()))
        .collect()
}

/// Names whose placeholders are still present in an already-resolved string.
pub fn unresolved_variables(resolved: &str) -> Vec<String> {
    extract_variables(resolved)
}

/// Check the brace structure and variable names of a template.
pub fn validate_template(template: &str) -> TemplateValidation {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let opening = template.matches("{{").count();
    let closing = template.matches("}}").count();
    if opening != closing {
        errors.push(format!(
            "Mismatched braces: {} opening '{{{{' and {} closing '}}}}'",
            opening, closing
        ));
    }

    if EMPTY_RE.is_match(template) {
        errors.push("Empty variable name in '{{}}'".to_string());
    }

    let nested = NESTED_RE.is_match(template);
    if nested {
        warnings.push("Nested variables are not supported".to_string());
    } else if opening == closing {
        let leftover = TEMPLATE_RE.replace_all(template, "");
        if leftover.contains("{{") || leftover.contains("}}") {
            errors.push("Malformed brace sequence".to_string());
        }
        for m in TEMPLATE_RE.find_iter(template) {
            let before = template[..m.start()].ends_with('{');
            let after = template[m.end()..].starts_with('}');
            if before || after {
                errors.push(format!("Stray brace next to '{}'", m.as_str()));
            }
        }
    }

    for name in extract_variables(template) {
        let plain = name.strip_prefix('$').unwrap_or(&name);
        if !KEY_RE.is_match(plain) {
            warnings.push(format!("Invalid variable name '{}'", name));
        }
    }

    TemplateValidation {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}
