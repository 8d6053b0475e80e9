// Error types for Edge Tunnel Manager

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tunnel not found: {0}")]
    TunnelNotFound(String),

    #[error("Tunnel already exists: {0}")]
    TunnelExists(String),

    #[error("Tunnel executable not found: {0}")]
    ExecutableMissing(PathBuf),

    #[error("Tunnel is already running: {0}")]
    AlreadyRunning(String),

    #[error("Tunnel is not running: {0}")]
    NotRunning(String),

    #[error("Control plane error: {0}")]
    Gateway(String),

    /// Saga partial failure: the remote create succeeded, so retrying the
    /// whole operation would produce a duplicate. The created id is carried
    /// so the caller can surface it (or delete the orphan).
    #[error("tunnel {tunnel_id} was created remotely but writing the local config failed: {reason}")]
    SagaLocalWrite { tunnel_id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
