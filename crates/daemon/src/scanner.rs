// Edge Tunnel Manager - Config Repository Scanner
// Discovers declared tunnels from the user-editable config directory

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

/// File extensions recognised as tunnel config files
const CONFIG_SUFFIXES: &[&str] = &["yml", "yaml"];

/// One tunnel declared by a config file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredTunnel {
    pub name: String,
    pub config_path: PathBuf,
    pub remote_id: Option<String>,
    pub hostname: Option<String>,
}

/// Scan failures, split by how callers must treat existing records
#[derive(Debug, Error)]
pub enum ScanError {
    /// The source of truth is gone (missing and uncreatable, or not a
    /// directory): callers clear their managed records.
    #[error("tunnel directory unavailable: {0}")]
    Fatal(String),

    /// The directory exists but reading it failed; possibly transient,
    /// callers keep their records.
    #[error("tunnel directory read failed: {0}")]
    Transient(String),
}

/// Read the config directory and produce a snapshot of declared tunnels.
///
/// A missing directory is created on first scan. Unreadable or malformed
/// individual files are skipped with a warning, never fatal.
pub fn scan(dir: &Path) -> Result<Vec<DiscoveredTunnel>, ScanError> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| {
            ScanError::Fatal(format!("cannot create {}: {}", dir.display(), e))
        })?;
        debug!(path = %dir.display(), "created tunnel config directory");
        return Ok(Vec::new());
    }

    if !dir.is_dir() {
        return Err(ScanError::Fatal(format!(
            "{} is not a directory",
            dir.display()
        )));
    }

    let entries = fs::read_dir(dir)
        .map_err(|e| ScanError::Transient(format!("{}: {}", dir.display(), e)))?;

    let mut discovered = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        let path = entry.path();

        let Some(ext) = path.extension().and_then(|s| s.to_str()) else {
            continue;
        };
        if !CONFIG_SUFFIXES.contains(&ext) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable config file");
                continue;
            }
        };

        discovered.push(DiscoveredTunnel {
            name: name.to_string(),
            config_path: path.clone(),
            remote_id: extract_value(&contents, "tunnel"),
            hostname: extract_hostname(&contents),
        });
    }

    Ok(discovered)
}

/// Return the value of the first non-comment top-level `key:` line, with
/// surrounding quotes stripped. Missing keys yield None; malformed content
/// never errors. This is a narrow extractor, not a YAML parser.
pub fn extract_value(contents: &str, key: &str) -> Option<String> {
    let prefix = format!("{key}:");
    for line in contents.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            continue;
        }
        // Top level only: the key must start at column zero
        if let Some(rest) = line.strip_prefix(&prefix) {
            let value = strip_quotes(rest.trim());
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Hostname lookup: a top-level `hostname:` wins; otherwise the first
/// service entry's hostname inside the `ingress:` block (detected by
/// indentation) is used.
pub fn extract_hostname(contents: &str) -> Option<String> {
    if let Some(value) = extract_value(contents, "hostname") {
        return Some(value);
    }

    let mut in_ingress = false;
    for line in contents.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') || trimmed.is_empty() {
            continue;
        }

        if line.starts_with("ingress:") {
            in_ingress = true;
            continue;
        }
        if in_ingress {
            // A non-indented line ends the block
            if !line.starts_with(' ') && !line.starts_with('\t') {
                break;
            }
            let entry = trimmed.strip_prefix("- ").unwrap_or(trimmed);
            if let Some(rest) = entry.strip_prefix("hostname:") {
                let value = strip_quotes(rest.trim());
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

fn strip_quotes(value: &str) -> &str {
    value
        .trim_matches('"')
        .trim_matches('\'')
        .trim()
}
