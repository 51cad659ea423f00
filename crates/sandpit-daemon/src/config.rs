//! Daemon configuration
//!
//! Defaults, then an optional TOML file, then environment overrides.

use sandpit_core::SandboxConfig;
use sandpit_core::collab::{DEFAULT_ENTRIES_PER_CONTEXT, DEFAULT_MAX_CONTEXTS};
use sandpit_core::config::{default_listen_addr, duration_ms};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where runs execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Pre-spawned worker processes, killed on overrun
    Process,
    /// Interpreter threads inside the daemon
    Thread,
}

impl IsolationMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Thread => "thread",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// HTTP listen address
    pub listen_addr: SocketAddr,

    /// Number of workers, and the bound on concurrent runs
    pub num_workers: usize,

    /// Recycle workers after this many executions
    pub recycle_after: u64,

    /// Extra time a worker gets past the deadline before it is killed
    #[serde(with = "duration_ms")]
    pub kill_grace: Duration,

    pub isolation: IsolationMode,

    /// JSON challenge catalog; no challenges are served without it
    pub challenges: Option<PathBuf>,

    /// Contexts kept by the in-memory entry store, oldest evicted first
    pub max_contexts: usize,

    /// Entries kept per context, oldest dropped first
    pub entry_capacity: usize,

    /// Sandbox configuration for every run
    pub sandbox: SandboxConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            num_workers: 4,
            recycle_after: 100,
            kill_grace: Duration::from_millis(500),
            isolation: IsolationMode::Process,
            challenges: None,
            max_contexts: DEFAULT_MAX_CONTEXTS,
            entry_capacity: DEFAULT_ENTRIES_PER_CONTEXT,
            sandbox: SandboxConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },

    #[error("{0}")]
    Invalid(String),
}

impl DaemonConfig {
    /// Load from an optional file and apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(value) = lookup("SANDPIT_ADDR") {
            self.listen_addr = value.parse().map_err(|_| ConfigError::Env {
                var: "SANDPIT_ADDR",
                value,
            })?;
        }
        if let Some(value) = lookup("SANDPIT_WORKERS") {
            self.num_workers = value.parse().map_err(|_| ConfigError::Env {
                var: "SANDPIT_WORKERS",
                value,
            })?;
        }
        if let Some(value) = lookup("SANDPIT_CHALLENGES") {
            self.challenges = Some(PathBuf::from(value));
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::Invalid("num_workers must be at least 1".into()));
        }
        if self.sandbox.timeout.is_zero() || self.sandbox.challenge_timeout.is_zero() {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if self.max_contexts == 0 || self.entry_capacity == 0 {
            return Err(ConfigError::Invalid(
                "max_contexts and entry_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
listen_addr = "0.0.0.0:9000"
num_workers = 2
isolation = "thread"
kill_grace = 250

[sandbox]
timeout = 3000
allow_network = false
"#
        )
        .unwrap();

        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.isolation, IsolationMode::Thread);
        assert_eq!(config.kill_grace, Duration::from_millis(250));
        assert_eq!(config.sandbox.timeout, Duration::from_secs(3));
        assert!(!config.sandbox.allow_network);
        // untouched keys keep their defaults
        assert_eq!(config.recycle_after, 100);
        assert_eq!(config.sandbox.challenge_timeout, Duration::from_secs(2));
    }

    #[test]
    fn env_overrides_apply_last() {
        let env: HashMap<&str, &str> = [
            ("SANDPIT_ADDR", "127.0.0.1:4000"),
            ("SANDPIT_WORKERS", "8"),
            ("SANDPIT_CHALLENGES", "/srv/challenges.json"),
        ]
        .into_iter()
        .collect();

        let mut config = DaemonConfig::default();
        config
            .apply_env(|var| env.get(var).map(ToString::to_string))
            .unwrap();
        assert_eq!(config.listen_addr.port(), 4000);
        assert_eq!(config.num_workers, 8);
        assert_eq!(config.challenges, Some(PathBuf::from("/srv/challenges.json")));
    }

    #[test]
    fn bad_env_value_is_rejected() {
        let mut config = DaemonConfig::default();
        let err = config
            .apply_env(|var| (var == "SANDPIT_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "SANDPIT_WORKERS", .. }));
    }

    #[test]
    fn zero_workers_is_invalid() {
        let config = DaemonConfig {
            num_workers: 0,
            ..DaemonConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn entry_store_bounds_must_be_positive() {
        assert!(DaemonConfig::default().validate().is_ok());
        let config = DaemonConfig {
            max_contexts: 0,
            ..DaemonConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
