//! TOML-based configuration for the import engine.
//!
//! Remote access tokens are stored as `token_env` fields that reference
//! environment variable names. The actual tokens are resolved at runtime via
//! [`EngineConfig::resolve_env_vars`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::options::MergeStrategy;
use crate::pool::DEFAULT_CONCURRENCY;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level engine configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub write: WriteConfig,

    #[serde(default)]
    pub merge: MergeConfig,

    /// Remote scopes keyed by scope name.
    #[serde(default)]
    pub remotes: BTreeMap<String, RemoteConfig>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory holding the local scope database.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(".compsync")
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl EngineSection {
    /// Path of the local scope database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("scope.db")
    }
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Ceiling on in-flight fetch tasks (default 30).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Fail the session when any requested id cannot be fetched.
    #[serde(default)]
    pub strict_seed_fetch: bool,

    /// Fetch the full version history of every target.
    #[serde(default)]
    pub all_history: bool,

    /// Number of history snaps to fetch per target when not fetching all.
    #[serde(default)]
    pub history_depth: Option<u32>,

    /// Resolve dependencies by reading each one instead of trusting the
    /// remote's dependency graph; also reports missing dependencies.
    #[serde(default)]
    pub fetch_deps: bool,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            strict_seed_fetch: false,
            all_history: false,
            history_depth: None,
            fetch_deps: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Write
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteConfig {
    /// Ceiling on in-flight file materialization tasks (default 30).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_true")]
    pub install_dependencies: bool,

    #[serde(default = "default_true")]
    pub write_config_files: bool,
}

fn default_true() -> bool {
    true
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            install_dependencies: true,
            write_config_files: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Strategy applied without prompting. Unset means prompt on conflicts.
    #[serde(default)]
    pub default_strategy: Option<MergeStrategy>,
}

// ---------------------------------------------------------------------------
// Remotes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub url: String,

    /// Environment variable holding the access token.
    #[serde(default)]
    pub token_env: Option<String>,

    /// Resolved token (populated at runtime, not serialized).
    #[serde(skip)]
    pub token: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl EngineConfig {
    /// Load an [`EngineConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: EngineConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!(remotes = config.remotes.len(), "configuration parsed");
        Ok(config)
    }

    /// Resolve every remote's `token_env` from the environment.
    ///
    /// A missing variable logs a warning but does **not** fail; anonymous
    /// access is valid for public scopes.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");
        for (scope, remote) in self.remotes.iter_mut() {
            if let Some(ref env_name) = remote.token_env {
                let field = format!("remotes.{scope}.token_env");
                remote.token = resolve_optional_env(env_name, &field);
            }
        }
        Ok(())
    }

    /// Validate that all values are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "fetch.concurrency".into(),
                detail: "concurrency must be > 0".into(),
            });
        }
        if self.write.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "write.concurrency".into(),
                detail: "concurrency must be > 0".into(),
            });
        }
        if self.fetch.history_depth == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "fetch.history_depth".into(),
                detail: "history depth must be > 0 when set".into(),
            });
        }
        for (scope, remote) in &self.remotes {
            if remote.url.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("remotes.{scope}.url"),
                    detail: "remote URL must not be empty".into(),
                });
            }
        }
        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Read an environment variable by name; warn and return `None` when it is
/// unset or empty.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
