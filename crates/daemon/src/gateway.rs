// Edge Tunnel Manager - Control-Plane Gateway
// Thin wrapper around the tunnel CLI for create/delete/route/login

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use edge_tunnel_common::{Error, Result};

/// Substrings in stderr that make a failed delete an idempotent success
const DELETE_NOT_FOUND_MARKERS: &[&str] = &["tunnel not found", "does not exist"];

/// Invokes the external tunnel CLI. Exit code 0 is success; any other exit
/// becomes a structured failure carrying the raw stderr.
#[derive(Clone)]
pub struct Gateway {
    executable: PathBuf,
}

struct CliOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl Gateway {
    pub fn new(executable: PathBuf) -> Self {
        Self { executable }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// `tunnel create <name>`: returns the remote tunnel id parsed from the
    /// CLI output.
    pub async fn create_tunnel(&self, name: &str) -> Result<String> {
        let out = self.run(&["tunnel", "create", name]).await?;
        if !out.success {
            return Err(Error::Gateway(format!(
                "tunnel create failed: {}",
                tail(&out.stderr)
            )));
        }

        // The CLI prints e.g. "Created tunnel site with id <uuid>" on stdout
        parse_tunnel_id(&out.stdout)
            .or_else(|| parse_tunnel_id(&out.stderr))
            .ok_or_else(|| {
                Error::Gateway(format!(
                    "tunnel created but no id found in output: {}",
                    tail(&out.stdout)
                ))
            })
    }

    /// `tunnel delete <id>`: "tunnel not found" counts as success so the
    /// operation can be retried safely.
    pub async fn delete_tunnel(&self, id: &str) -> Result<()> {
        let out = self.run(&["tunnel", "delete", "-f", id]).await?;
        if out.success {
            info!(id, "remote tunnel deleted");
            return Ok(());
        }

        let stderr_lower = out.stderr.to_lowercase();
        if DELETE_NOT_FOUND_MARKERS
            .iter()
            .any(|marker| stderr_lower.contains(marker))
        {
            debug!(id, "remote tunnel already gone");
            return Ok(());
        }

        Err(Error::Gateway(format!(
            "tunnel delete failed: {}",
            tail(&out.stderr)
        )))
    }

    /// `tunnel route dns <id> <hostname>`
    pub async fn route_dns(&self, id: &str, hostname: &str) -> Result<()> {
        let out = self.run(&["tunnel", "route", "dns", id, hostname]).await?;
        if !out.success {
            return Err(Error::Gateway(format!(
                "dns route failed: {}",
                tail(&out.stderr)
            )));
        }
        Ok(())
    }

    /// `login`: opens the browser-based flow; returns whatever the CLI printed.
    pub async fn login(&self) -> Result<String> {
        let out = self.run(&["login"]).await?;
        if !out.success {
            return Err(Error::Gateway(format!("login failed: {}", tail(&out.stderr))));
        }
        Ok(out.stdout)
    }

    async fn run(&self, args: &[&str]) -> Result<CliOutput> {
        debug!(executable = %self.executable.display(), ?args, "invoking tunnel CLI");
        let output = Command::new(&self.executable)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                Error::Gateway(format!(
                    "failed to run {}: {}",
                    self.executable.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            warn!(
                executable = %self.executable.display(),
                ?args,
                code = output.status.code(),
                "tunnel CLI returned non-zero"
            );
        }

        Ok(CliOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Render the fixed managed-tunnel config template: identifier, credentials
/// path, one ingress rule routing to `service`, trailing catch-all.
pub fn config_template(
    tunnel_id: &str,
    credentials_dir: &Path,
    hostname: &str,
    service: &str,
) -> String {
    let credentials = credentials_dir.join(format!("{tunnel_id}.json"));
    format!(
        "tunnel: {tunnel_id}\n\
         credentials-file: {credentials}\n\
         ingress:\n  \
         - hostname: {hostname}\n    \
         service: {service}\n  \
         - service: http_status:404\n",
        credentials = credentials.display(),
    )
}

/// Find the first UUID-shaped token in CLI output
fn parse_tunnel_id(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .find(|token| Uuid::parse_str(token).is_ok())
        .map(|token| token.to_string())
}

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "(no output)".to_string();
    }
    trimmed
        .lines()
        .rev()
        .take(3)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join(" / ")
}
