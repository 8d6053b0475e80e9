// Edge Tunnel Manager - Settings Module
// Shared settings consumed by the daemon (and any future clients)

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Lower bound for the periodic status check; the reconciliation pass is
/// self-healing, not a poll loop, so it must not run hot.
pub const MIN_CHECK_INTERVAL_SECS: u64 = 5;

/// Shared settings for tunnel supervision
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Directory of per-tunnel config files (user-editable, watched)
    #[serde(default = "default_tunnel_dir")]
    pub tunnel_dir: PathBuf,

    /// Directory holding remote credentials files (<tunnel-id>.json)
    #[serde(default = "default_tunnel_dir")]
    pub credentials_dir: PathBuf,

    /// Path to the tunnel client executable
    #[serde(default = "default_cloudflared_path")]
    pub cloudflared_path: PathBuf,

    /// Interval of the periodic status reconciliation pass, in seconds
    /// (clamped to at least MIN_CHECK_INTERVAL_SECS)
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Bounded wait for interactive (synchronous) stops, in milliseconds
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

fn default_tunnel_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cloudflared")
}

fn default_cloudflared_path() -> PathBuf {
    PathBuf::from("/usr/local/bin/cloudflared")
}

fn default_check_interval_secs() -> u64 {
    10
}

fn default_stop_timeout_ms() -> u64 {
    2500
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tunnel_dir: default_tunnel_dir(),
            credentials_dir: default_tunnel_dir(),
            cloudflared_path: default_cloudflared_path(),
            check_interval_secs: default_check_interval_secs(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl Settings {
    /// Load settings from the config file, writing defaults on first run
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            info!("No settings found, using defaults");
            info!("Settings will be saved to: {}", path.display());
            let settings = Self::default();
            settings.save()?;
            return Ok(settings);
        }

        let contents =
            fs::read_to_string(&path).context("Failed to read settings file")?;
        let settings: Self =
            toml::from_str(&contents).context("Failed to parse settings file")?;

        Ok(settings)
    }

    /// Save settings to the config file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize settings")?;
        fs::write(&path, contents)
            .context(format!("Failed to write settings to {}", path.display()))?;

        Ok(())
    }

    /// Path of the settings file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("edge-tunnel-manager").join("settings.toml"))
    }

    /// Status-check interval with the lower bound applied
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(MIN_CHECK_INTERVAL_SECS))
    }

    /// Bounded wait for interactive stops
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}
