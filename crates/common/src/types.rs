// Common types for Edge Tunnel Manager

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a supervised tunnel process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Stopped,  // no live process for this record
    Starting, // process spawned, waiting for the confirmation delay
    Running,  // process confirmed alive
    Stopping, // graceful termination signalled, exit not yet observed
    Error,    // process died unexpectedly or could not be started
}

impl TunnelStatus {
    /// A live process is expected to exist for this status.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TunnelStatus::Starting | TunnelStatus::Running | TunnelStatus::Stopping
        )
    }

    /// Transitional states survive a directory merge untouched.
    pub fn is_transitional(&self) -> bool {
        matches!(self, TunnelStatus::Starting | TunnelStatus::Stopping)
    }
}

/// A tunnel backed by a persistent config file in the watched directory.
///
/// The record never holds the process handle itself — the supervisor owns
/// that, keyed by `config_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedTunnel {
    /// Derived from the config file name (without extension)
    pub name: String,
    /// Absolute path of the backing config file; unique across the set
    pub config_path: PathBuf,
    /// Remote tunnel identifier parsed from the `tunnel:` key, if present
    pub remote_id: Option<String>,
    /// Public hostname parsed from the config, if present
    pub hostname: Option<String>,
    pub status: TunnelStatus,
    pub last_error: Option<String>,
}

impl ManagedTunnel {
    pub fn new(name: String, config_path: PathBuf) -> Self {
        Self {
            name,
            config_path,
            remote_id: None,
            hostname: None,
            status: TunnelStatus::Stopped,
            last_error: None,
        }
    }
}

/// An ephemeral tunnel started ad hoc from a local URL.
///
/// Has no backing file; the record is discarded once its process exits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickTunnel {
    pub instance_id: Uuid,
    pub local_url: String,
    /// Set at most once, never cleared or overwritten
    pub public_url: Option<String>,
    pub status: TunnelStatus,
    pub last_error: Option<String>,
}

impl QuickTunnel {
    pub fn new(local_url: String) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            local_url,
            public_url: None,
            status: TunnelStatus::Starting,
            last_error: None,
        }
    }
}

/// Events emitted by the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelEvent {
    /// The managed or quick record set changed in some way; observers
    /// should refresh their view.
    RecordsChanged { timestamp: DateTime<Utc> },

    /// A user-visible notification (executable missing, start/stop
    /// success, unexpected error, quick-tunnel URL ready, bulk completion)
    Notification {
        identifier: String,
        title: String,
        body: String,
        timestamp: DateTime<Utc>,
    },

    /// A managed tunnel reached Running
    Started { name: String, timestamp: DateTime<Utc> },

    /// A managed tunnel reached Stopped after an intentional stop
    Stopped { name: String, timestamp: DateTime<Utc> },

    /// A tunnel process died unexpectedly
    Error {
        name: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A quick tunnel's public URL became available
    QuickReady {
        instance_id: Uuid,
        public_url: String,
        timestamp: DateTime<Utc>,
    },
}

impl TunnelEvent {
    pub fn records_changed() -> Self {
        TunnelEvent::RecordsChanged {
            timestamp: Utc::now(),
        }
    }

    pub fn notification(identifier: &str, title: &str, body: &str) -> Self {
        TunnelEvent::Notification {
            identifier: identifier.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Result of the two-step create saga (remote create + local config write)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedTunnel {
    pub name: String,
    pub tunnel_id: String,
    pub config_path: PathBuf,
}
