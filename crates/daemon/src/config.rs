// Edge Tunnel Manager - Daemon Config Module
// Handles daemon configuration (listener mode, bind address)
// Tunnel supervision settings live in edge-tunnel-common::Settings

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Get the runtime directory for daemon state
pub fn runtime_dir() -> Result<PathBuf> {
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .ok_or_else(|| anyhow::anyhow!("Could not determine runtime directory"))
}

/// Get the socket path for the daemon
pub fn socket_path() -> Result<PathBuf> {
    Ok(runtime_dir()?.join("edge-tunnel-manager.sock"))
}

/// Listener mode for the daemon
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ListenerMode {
    /// Unix domain socket (local-only)
    #[default]
    UnixSocket,
    /// TCP with HTTP (localhost-only, no encryption)
    TcpHttp,
}

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Listener mode (UnixSocket or TcpHttp)
    #[serde(default)]
    pub listener_mode: ListenerMode,

    /// Bind address for TCP mode (loopback only)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_bind_address() -> String {
    "127.0.0.1:3780".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listener_mode: ListenerMode::default(),
            bind_address: default_bind_address(),
        }
    }
}

impl DaemonConfig {
    /// Validate the daemon configuration
    pub fn validate(&self) -> Result<()> {
        if self.listener_mode == ListenerMode::TcpHttp {
            let is_loopback = self.bind_address.starts_with("127.")
                || self.bind_address.starts_with("localhost:")
                || self.bind_address == "localhost";

            // The API carries no authentication or encryption, so a
            // non-loopback bind would expose tunnel control to the network
            if !is_loopback {
                anyhow::bail!(
                    "Refusing non-loopback bind_address {} in tcp-http mode. \
                     Use a 127.0.0.1/localhost address or the unix-socket listener.",
                    self.bind_address
                );
            }
        }

        Ok(())
    }

    /// Load daemon configuration from file
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("No daemon configuration found, using defaults");
            info!("Configuration will be saved to: {}", config_path.display());
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let contents =
            fs::read_to_string(&config_path).context("Failed to read daemon configuration")?;

        let config: Self =
            toml::from_str(&contents).context("Failed to parse daemon configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        info!("Loaded daemon configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Save daemon configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }

        let contents =
            toml::to_string_pretty(self).context("Failed to serialize daemon configuration")?;

        fs::write(&config_path, contents).context("Failed to write daemon configuration")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&config_path, permissions)
                .context("Failed to set config file permissions")?;
        }

        info!("Saved daemon configuration to: {}", config_path.display());
        Ok(())
    }

    /// Get the path to the daemon configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("edge-tunnel-manager").join("daemon.toml"))
    }
}
