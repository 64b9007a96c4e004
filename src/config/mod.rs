// apiflow — Configuration (~/.apiflow/config.json + APIFLOW_* overrides)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("home directory not found")]
    NoHomeDir,
    #[error("invalid environment variable name: {0}")]
    InvalidEnvironmentKey(String),
    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Values for the environment variable layer.
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Request timeout for steps without their own. `None` = transport default.
    #[serde(default)]
    pub default_step_timeout_ms: Option<u64>,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_pause_poll_interval_ms")]
    pub pause_poll_interval_ms: u64,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub pause_on_failure: bool,
    #[serde(default)]
    pub max_jumps: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_ms: None,
            retry_base_delay_ms: default_retry_base_delay_ms(),
            pause_poll_interval_ms: default_pause_poll_interval_ms(),
            continue_on_error: false,
            pause_on_failure: false,
            max_jumps: None,
        }
    }
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_pause_poll_interval_ms() -> u64 {
    1000
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Proxy URL. Empty = no proxy.
    #[serde(default)]
    pub proxy: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            user_agent: default_user_agent(),
            proxy: String::new(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_user_agent() -> String {
    format!("apiflow/{}", env!("CARGO_PKG_VERSION"))
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    File,
}

impl std::str::FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "file" => Ok(StorageBackend::File),
            other => Err(ConfigError::Other(format!(
                "unknown storage backend '{}' (expected 'memory' or 'file')",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> String {
    "~/.apiflow/data".to_string()
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a JSON file, falling back to defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            serde_json::from_str(&contents)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (prefix: APIFLOW_)
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("APIFLOW_ENGINE_DEFAULT_STEP_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                self.engine.default_step_timeout_ms = Some(n);
            }
        }
        if let Ok(v) = std::env::var("APIFLOW_ENGINE_RETRY_BASE_DELAY_MS") {
            if let Ok(n) = v.parse() {
                self.engine.retry_base_delay_ms = n;
            }
        }
        if let Ok(v) = std::env::var("APIFLOW_ENGINE_PAUSE_POLL_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                self.engine.pause_poll_interval_ms = n;
            }
        }
        if let Ok(v) = std::env::var("APIFLOW_ENGINE_CONTINUE_ON_ERROR") {
            self.engine.continue_on_error = v.parse().unwrap_or(false);
        }
        if let Ok(v) = std::env::var("APIFLOW_ENGINE_PAUSE_ON_FAILURE") {
            self.engine.pause_on_failure = v.parse().unwrap_or(false);
        }
        if let Ok(v) = std::env::var("APIFLOW_ENGINE_MAX_JUMPS") {
            if let Ok(n) = v.parse() {
                self.engine.max_jumps = Some(n);
            }
        }
        // HTTP overrides
        if let Ok(v) = std::env::var("APIFLOW_HTTP_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.http.timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("APIFLOW_HTTP_USER_AGENT") {
            self.http.user_agent = v;
        }
        if let Ok(v) = std::env::var("APIFLOW_HTTP_PROXY") {
            self.http.proxy = v;
        }
        // Storage overrides
        if let Ok(v) = std::env::var("APIFLOW_STORAGE_BACKEND") {
            match v.parse() {
                Ok(backend) => self.storage.backend = backend,
                Err(e) => tracing::warn!("Ignoring APIFLOW_STORAGE_BACKEND: {}", e),
            }
        }
        if let Ok(v) = std::env::var("APIFLOW_STORAGE_PATH") {
            self.storage.path = v;
        }
    }

    /// Resolve the storage path, expanding `~` to home directory.
    pub fn storage_path(&self) -> Result<PathBuf, ConfigError> {
        let p = &self.storage.path;
        if let Some(stripped) = p.strip_prefix('~') {
            let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
            Ok(home.join(p.strip_prefix("~/").unwrap_or(stripped)))
        } else {
            Ok(PathBuf::from(p))
        }
    }

    /// Get the default config file path: ~/.apiflow/config.json
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(".apiflow").join("config.json"))
    }

    /// Validate configuration for basic correctness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http.timeout_secs == 0 {
            return Err(ConfigError::Other(
                "http.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.engine.pause_poll_interval_ms == 0 {
            return Err(ConfigError::Other(
                "engine.pause_poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if !self.http.proxy.is_empty() && url::Url::parse(&self.http.proxy).is_err() {
            return Err(ConfigError::Other(format!(
                "http.proxy is not a valid URL: {}",
                self.http.proxy
            )));
        }
        for key in self.environment.keys() {
            if crate::variable::validate_key(key).is_err() {
                return Err(ConfigError::InvalidEnvironmentKey(key.clone()));
            }
        }
        if self.storage.backend == StorageBackend::File {
            self.storage_path()?;
        }
        if self.engine.retry_base_delay_ms == 0 {
            tracing::warn!("engine.retry_base_delay_ms is 0, retries will not back off");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.engine.retry_base_delay_ms, 1000);
        assert_eq!(cfg.engine.max_jumps, None);
        assert_eq!(cfg.http.timeout_secs, 30);
        assert_eq!(cfg.storage.backend, StorageBackend::File);
        assert!(cfg.http.user_agent.starts_with("apiflow/"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_minimal_json() {
        let json = r#"{"engine": {"continue_on_error": true}}"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert!(cfg.engine.continue_on_error);
        assert_eq!(cfg.engine.pause_poll_interval_ms, 1000);
        assert_eq!(cfg.storage.path, "~/.apiflow/data");
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "engine": {"default_step_timeout_ms": 5000, "max_jumps": 50},
            "http": {"timeout_secs": 5, "proxy": "http://127.0.0.1:8080"},
            "storage": {"backend": "memory"},
            "environment": {"baseUrl": "https://api.example.com"}
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.engine.default_step_timeout_ms, Some(5000));
        assert_eq!(cfg.engine.max_jumps, Some(50));
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
        assert_eq!(cfg.environment["baseUrl"], "https://api.example.com");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_storage_path_tilde() {
        let cfg = Config::default();
        let path = cfg.storage_path().unwrap();
        assert!(path.to_str().unwrap().contains(".apiflow"));
        assert!(!path.to_str().unwrap().starts_with('~'));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.environment.insert("$reserved".into(), "x".into());
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidEnvironmentKey(_))
        ));

        let mut cfg = Config::default();
        cfg.http.proxy = "not a url".into();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.http.timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = Config::load(&tmp.path().join("absent.json")).unwrap();
        assert_eq!(cfg.http.connect_timeout_secs, 10);
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"storage": {"backend": "file", "path": "/tmp/flows"}}"#)
            .unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.storage_path().unwrap(), PathBuf::from("/tmp/flows"));
    }

    #[test]
    fn test_storage_backend_from_str() {
        assert_eq!("Memory".parse::<StorageBackend>().unwrap(), StorageBackend::Memory);
        assert!("redis".parse::<StorageBackend>().is_err());
    }
}
