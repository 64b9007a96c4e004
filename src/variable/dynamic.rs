// apiflow — Dynamic ($-prefixed) variable registry

use super::VariableError;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

pub type Generator = Arc<dyn Fn() -> String + Send + Sync>;

/// A synthetic variable regenerated on every use.
#[derive(Clone)]
pub struct DynamicVariable {
    pub key: String,
    pub description: String,
    generator: Generator,
}

impl DynamicVariable {
    pub fn new<F>(key: impl Into<String>, description: impl Into<String>, generator: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            description: description.into(),
            generator: Arc::new(generator),
        }
    }

    pub fn generate(&self) -> String {
        (self.generator)()
    }
}

impl fmt::Debug for DynamicVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicVariable")
            .field("key", &self.key)
            .field("description", &self.description)
            .finish()
    }
}

const FIRST_NAMES: &[&str] = &[
    "alice", "bob", "carol", "dave", "erin", "frank", "grace", "heidi", "ivan", "judy",
];

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn random_user_name() -> String {
    let mut rng = rand::thread_rng();
    let name = FIRST_NAMES[rng.gen_range(0..FIRST_NAMES.len())];
    format!("{}{}", name, rng.gen_range(10..10_000))
}

/// Catalog of `$`-prefixed generators. Shared read-mostly across executions.
#[derive(Clone)]
pub struct DynamicVariableRegistry {
    vars: Arc<RwLock<HashMap<String, DynamicVariable>>>,
}

impl DynamicVariableRegistry {
    /// An empty registry with no built-ins.
    pub fn empty() -> Self {
        Self {
            vars: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// A registry pre-populated with the built-in generators.
    pub fn new() -> Self {
        let registry = Self::empty();
        for var in builtin_variables() {
            // Built-in keys are all `$`-prefixed.
            let _ = registry.register(var);
        }
        registry
    }

    pub fn register(&self, var: DynamicVariable) -> Result<(), VariableError> {
        if !var.key.starts_with('$') || var.key.len() < 2 {
            return Err(VariableError::InvalidKey(var.key));
        }
        tracing::debug!(key = %var.key, "Registering dynamic variable");
        if let Ok(mut vars) = self.vars.write() {
            vars.insert(var.key.clone(), var);
        }
        Ok(())
    }

    pub fn unregister(&self, key: &str) -> bool {
        match self.vars.write() {
            Ok(mut vars) => vars.remove(key).is_some(),
            Err(_) => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<DynamicVariable> {
        self.vars.read().ok().and_then(|v| v.get(key).cloned())
    }

    /// Evaluate the generator for `key`, if registered.
    pub fn generate(&self, key: &str) -> Option<String> {
        self.get(key).map(|v| v.generate())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .vars
            .read()
            .map(|v| v.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

impl Default for DynamicVariableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn builtin_variables() -> Vec<DynamicVariable> {
    vec![
        DynamicVariable::new("$timestamp", "Current unix timestamp in seconds", || {
            chrono::Utc::now().timestamp().to_string()
        }),
        DynamicVariable::new("$isoTimestamp", "Current time in RFC 3339 format", || {
            chrono::Utc::now().to_rfc3339()
        }),
        DynamicVariable::new("$uuid", "Random v4 UUID", || uuid::Uuid::new_v4().to_string()),
        DynamicVariable::new("$guid", "Random v4 UUID", || uuid::Uuid::new_v4().to_string()),
        DynamicVariable::new("$randomInt", "Random integer between 0 and 1000", || {
            rand::thread_rng().gen_range(0..=1000).to_string()
        }),
        DynamicVariable::new("$randomString", "Random 10-character alphanumeric string", || {
            random_string(10)
        }),
        DynamicVariable::new("$randomBoolean", "Random true/false", || {
            rand::thread_rng().gen_bool(0.5).to_string()
        }),
        DynamicVariable::new("$randomUserName", "Random user name", random_user_name),
        DynamicVariable::new("$randomEmail", "Random email address", || {
            format!("{}@example.com", random_user_name())
        }),
    ]
}
