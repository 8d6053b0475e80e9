// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Edge Tunnel Manager Contributors

// Edge Tunnel Manager - Subprocess Supervisor
// Owns every live tunnel child process, keyed by config path or instance id

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use edge_tunnel_common::{Error, Result};

/// Liveness polling interval for synchronous stops
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Key identifying one supervised process.
///
/// Managed tunnels and quick tunnels never share identity space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProcessKey {
    /// Managed tunnel, keyed by its config file path
    Managed(PathBuf),
    /// Quick tunnel, keyed by its instance id
    Quick(Uuid),
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessKey::Managed(path) => write!(f, "managed:{}", path.display()),
            ProcessKey::Quick(id) => write!(f, "quick:{}", id),
        }
    }
}

/// Exit report delivered exactly once per started process.
///
/// Carries the token of the start it belongs to, so a report for a process
/// that was already replaced under the same key can be told apart from an
/// unexpected death of the current one.
#[derive(Debug)]
pub struct ProcessExit {
    pub key: ProcessKey,
    pub token: u64,
    /// Exit code; None when the process was terminated by a signal
    pub code: Option<i32>,
    pub signalled: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Per-chunk observer invoked on the capture task as output arrives.
/// Receives the full accumulated buffer of the stream that grew.
pub type OutputObserver = Arc<dyn Fn(&str) + Send + Sync>;

/// What the exit loop found when it consumed a report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// Key was still registered for this start: the death was unexpected
    Unexpected,
    /// Key was absent (or re-used by a later start): the stop was intentional
    Intentional,
}

struct LiveHandle {
    token: u64,
    pid: u32,
}

/// Supervises tunnel child processes.
///
/// A record never holds the child itself; it holds only a `ProcessKey` into
/// this table. A start request is rejected while the key is present, which
/// serialises start/stop per key.
#[derive(Clone)]
pub struct ProcessSupervisor {
    handles: Arc<Mutex<HashMap<ProcessKey, LiveHandle>>>,
    exit_tx: mpsc::UnboundedSender<ProcessExit>,
    next_token: Arc<AtomicU64>,
}

impl ProcessSupervisor {
    /// Create a supervisor delivering exit reports on the given channel.
    /// The consumer of the channel owns all record mutation.
    pub fn new(exit_tx: mpsc::UnboundedSender<ProcessExit>) -> Self {
        Self {
            handles: Arc::new(Mutex::new(HashMap::new())),
            exit_tx,
            next_token: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Spawn a process for `key` and begin capturing its output.
    ///
    /// Returns immediately after the spawn; completion is observed via the
    /// exit channel. Rejects the request if `key` already has a live handle.
    pub fn start(
        &self,
        key: ProcessKey,
        executable: &Path,
        args: &[String],
        working_dir: Option<&Path>,
        observer: Option<OutputObserver>,
    ) -> Result<()> {
        let mut handles = self.handles.lock();
        if handles.contains_key(&key) {
            return Err(Error::AlreadyRunning(key.to_string()));
        }

        let mut cmd = Command::new(executable);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id().unwrap_or(0);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        debug!(%key, pid, "spawned tunnel process");

        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let stderr_buf = Arc::new(Mutex::new(String::new()));

        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(pump(out, stdout_buf.clone(), observer.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(pump(err, stderr_buf.clone(), observer)));

        handles.insert(key.clone(), LiveHandle { token, pid });
        drop(handles);

        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            // Drain both streams fully before reading the buffers
            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            if let Some(task) = stderr_task {
                let _ = task.await;
            }

            let status = child.wait().await;
            let (code, signalled) = match &status {
                Ok(status) => (status.code(), exit_signal(status).is_some()),
                Err(e) => {
                    warn!(%key, error = %e, "waiting on tunnel process failed");
                    (None, false)
                }
            };

            let exit = ProcessExit {
                key,
                token,
                code,
                signalled,
                stdout: stdout_buf.lock().clone(),
                stderr: stderr_buf.lock().clone(),
            };
            let _ = exit_tx.send(exit);
        });

        Ok(())
    }

    /// Remove the live handle for `key`, returning its pid.
    ///
    /// Callers remove the key *before* signalling termination, so the exit
    /// report can tell an intentional stop (key absent) from an unexpected
    /// death (key still present).
    pub fn take(&self, key: &ProcessKey) -> Option<u32> {
        self.handles.lock().remove(key).map(|h| h.pid)
    }

    /// Consume an exit report against the table.
    ///
    /// Deregisters the key only when the token matches the start the report
    /// belongs to; a key already re-used by a newer start is left alone.
    pub fn consume_exit(&self, exit: &ProcessExit) -> ExitDisposition {
        let mut handles = self.handles.lock();
        match handles.get(&exit.key) {
            Some(handle) if handle.token == exit.token => {
                handles.remove(&exit.key);
                ExitDisposition::Unexpected
            }
            _ => ExitDisposition::Intentional,
        }
    }

    pub fn contains(&self, key: &ProcessKey) -> bool {
        self.handles.lock().contains_key(key)
    }

    /// Whether the key has a handle whose process still answers a liveness probe
    pub fn is_alive(&self, key: &ProcessKey) -> bool {
        self.handles
            .lock()
            .get(key)
            .map(|h| is_process_alive(h.pid))
            .unwrap_or(false)
    }

    pub fn live_count(&self) -> usize {
        self.handles.lock().len()
    }
}

async fn pump(
    mut reader: impl AsyncRead + Unpin,
    buffer: Arc<Mutex<String>>,
    observer: Option<OutputObserver>,
) {
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&chunk[..n]);
                let snapshot = {
                    let mut buf = buffer.lock();
                    buf.push_str(&text);
                    buf.clone()
                };
                if let Some(obs) = &observer {
                    obs(&snapshot);
                }
            }
        }
    }
}

/// Send a graceful termination signal. Never escalates to SIGKILL; a process
/// that ignores the signal remains until its exit report eventually fires.
pub fn terminate(pid: u32) {
    if pid == 0 {
        return;
    }
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

/// Check whether a process with the given PID is running (kill(pid, 0))
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    unsafe {
        if libc::kill(pid as i32, 0) == 0 {
            return true;
        }
        // EPERM means the process exists but belongs to someone else
        *libc::__errno_location() == libc::EPERM
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    warn!("process liveness check not implemented for this platform");
    true
}

/// Signal termination and poll liveness until the process exits or the
/// timeout elapses. Returns whether it exited.
pub async fn stop_sync_with_timeout(pid: u32, timeout: Duration) -> bool {
    terminate(pid);
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !is_process_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
