// apiflow — Variables and the layered variable context

pub mod dynamic;
pub mod resolver;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Maximum length of an ordinary variable key.
pub const MAX_KEY_LEN: usize = 100;

static KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_.\-]*$").expect("valid key regex"));

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VariableError {
    #[error("invalid variable key '{0}'")]
    InvalidKey(String),
    #[error("variable key '{0}' is reserved for dynamic variables")]
    ReservedKey(String),
    #[error("variable '{0}' not found")]
    VariableNotFound(String),
}

// ---------------------------------------------------------------------------
// Variable
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    #[default]
    Environment,
    Collection,
    Request,
    Dynamic,
    Secret,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VariableScope {
    #[default]
    Global,
    Collection,
    Request,
    Workflow,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub key: String,
    pub value: String,
    #[serde(rename = "type", default)]
    pub var_type: VariableType,
    #[serde(default)]
    pub scope: VariableScope,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub is_secret: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Variable {
    /// Create an enabled, non-secret variable after validating its key.
    pub fn new(
        key: impl Into<String>,
        value: impl Into<String>,
        var_type: VariableType,
        scope: VariableScope,
    ) -> Result<Self, VariableError> {
        let key = key.into();
        validate_key(&key)?;
        Ok(Self {
            is_secret: var_type == VariableType::Secret,
            key,
            value: value.into(),
            var_type,
            scope,
            enabled: true,
            description: None,
        })
    }

    pub fn secret(mut self) -> Self {
        self.is_secret = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Check that `key` is usable for an ordinary (non-dynamic) variable.
pub fn validate_key(key: &str) -> Result<(), VariableError> {
    if key.starts_with('$') {
        return Err(VariableError::ReservedKey(key.to_string()));
    }
    if key.is_empty() || key.len() > MAX_KEY_LEN || !KEY_RE.is_match(key) {
        return Err(VariableError::InvalidKey(key.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// VariableContext
// ---------------------------------------------------------------------------

/// The five precedence-ordered variable layers of one execution.
///
/// Lookup order (highest first): `resolved`, `workflow`, `request`,
/// `collection`, `environment`. Dynamic variables sit above all of them and
/// are handled by the resolver.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VariableContext {
    #[serde(default)]
    pub environment: BTreeMap<String, Variable>,
    #[serde(default)]
    pub collection: BTreeMap<String, Variable>,
    #[serde(default)]
    pub request: BTreeMap<String, Variable>,
    #[serde(default)]
    pub workflow: BTreeMap<String, Variable>,
    #[serde(default)]
    pub resolved: BTreeMap<String, String>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a layer map from a list of variables, dropping invalid keys.
    pub fn layer_from(variables: &[Variable]) -> BTreeMap<String, Variable> {
        let mut layer = BTreeMap::new();
        for var in variables {
            if let Err(e) = validate_key(&var.key) {
                tracing::warn!(key = %var.key, "Skipping variable: {}", e);
                continue;
            }
            layer.insert(var.key.clone(), var.clone());
        }
        layer
    }

    /// Set a value in the execution-local override layer.
    pub fn set_resolved(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.resolved.insert(key.into(), value.into());
    }

    /// Merge extracted values into the override layer.
    pub fn merge_resolved<'a, I>(&mut self, values: I)
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (k, v) in values {
            self.resolved.insert(k.clone(), v.clone());
        }
    }

    /// The ordered static layers, highest precedence first.
    pub(crate) fn layers(&self) -> [(resolver::VariableSource, &BTreeMap<String, Variable>); 4] {
        use resolver::VariableSource;
        [
            (VariableSource::Workflow, &self.workflow),
            (VariableSource::Request, &self.request),
            (VariableSource::Collection, &self.collection),
            (VariableSource::Environment, &self.environment),
        ]
    }
}
