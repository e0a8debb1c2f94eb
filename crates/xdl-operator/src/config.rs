//! Default values applied to XDLJobs
//!
//! The values live in one struct that is built once at startup (from the
//! built-in constants or a TOML file) and passed into the defaulting code.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::crd::{CleanPodPolicy, RestartPolicy};

pub const DEFAULT_CLEAN_POD_POLICY: CleanPodPolicy = CleanPodPolicy::Running;
pub const DEFAULT_MIN_FINISH_WORKER_PERCENTAGE: i32 = 100;
pub const DEFAULT_BACKOFF_LIMIT: i32 = 3;
pub const DEFAULT_REPLICAS: i32 = 1;
pub const DEFAULT_RESTART_POLICY: RestartPolicy = RestartPolicy::Never;
pub const DEFAULT_CONTAINER_NAME: &str = "xdl";
pub const DEFAULT_CONTAINER_PORT_NAME: &str = "xdl-port";
pub const DEFAULT_PORT: i32 = 2222;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Values filled into an XDLJob when the user left them out
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct JobDefaults {
    pub clean_pod_policy: CleanPodPolicy,
    pub min_finish_worker_percentage: i32,
    pub backoff_limit: i32,
    pub replicas: i32,
    pub restart_policy: RestartPolicy,
    /// Name of the container that must expose the job port
    pub container_name: String,
    pub port_name: String,
    pub port: i32,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            clean_pod_policy: DEFAULT_CLEAN_POD_POLICY,
            min_finish_worker_percentage: DEFAULT_MIN_FINISH_WORKER_PERCENTAGE,
            backoff_limit: DEFAULT_BACKOFF_LIMIT,
            replicas: DEFAULT_REPLICAS,
            restart_policy: DEFAULT_RESTART_POLICY,
            container_name: DEFAULT_CONTAINER_NAME.to_string(),
            port_name: DEFAULT_CONTAINER_PORT_NAME.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl JobDefaults {
    /// Load defaults from a TOML file. Keys left out keep their built-in value.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = expand_tilde(path.as_ref());
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let defaults: JobDefaults =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
        defaults.validate()?;
        Ok(defaults)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0..=100).contains(&self.min_finish_worker_percentage) {
            return Err(invalid(
                "min-finish-worker-percentage",
                format!("{} is not within 0..=100", self.min_finish_worker_percentage),
            ));
        }
        if self.backoff_limit < 0 {
            return Err(invalid(
                "backoff-limit",
                format!("{} is negative", self.backoff_limit),
            ));
        }
        if self.replicas < 1 {
            return Err(invalid(
                "replicas",
                format!("{} is less than 1", self.replicas),
            ));
        }
        if !(1..=65535).contains(&self.port) {
            return Err(invalid(
                "port",
                format!("{} is not a valid port number", self.port),
            ));
        }
        if self.container_name.is_empty() {
            return Err(invalid("container-name", "must not be empty".to_string()));
        }
        if self.port_name.is_empty() {
            return Err(invalid("port-name", "must not be empty".to_string()));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}
