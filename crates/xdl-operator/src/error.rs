//! Operator error types

use std::path::PathBuf;

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("failed to read manifest {path}: {source}")]
    ReadManifest {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("timed out waiting for CRD {0} to be established")]
    CrdNotEstablished(String),

    #[error("failed waiting for CRD: {0}")]
    CrdWait(#[from] kube::runtime::wait::Error),

    #[error("logging setup failed: {0}")]
    Logging(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
