// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Edge Tunnel Manager Contributors

// Edge Tunnel Manager - Common Library
// Shared types, errors, and settings

pub mod config;
pub mod error;
pub mod types;

pub use config::{Settings, MIN_CHECK_INTERVAL_SECS};
pub use error::{Error, Result};
pub use types::{CreatedTunnel, ManagedTunnel, QuickTunnel, TunnelEvent, TunnelStatus};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;
