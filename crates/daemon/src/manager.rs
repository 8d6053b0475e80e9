// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Edge Tunnel Manager Contributors

// Edge Tunnel Manager - Tunnel Lifecycle Manager
// Owns the record tables and drives every status transition

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use edge_tunnel_common::types::{CreatedTunnel, ManagedTunnel, QuickTunnel, TunnelEvent, TunnelStatus};
use edge_tunnel_common::{Error, Result, Settings};

use crate::gateway::{self, Gateway};
use crate::output::{OutputParser, OutputSignal};
use crate::scanner::{self, DiscoveredTunnel, ScanError};
use crate::supervisor::{
    self, ExitDisposition, OutputObserver, ProcessExit, ProcessKey, ProcessSupervisor,
};

/// Capacity of the broadcast event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tuning knobs for the manager, derived from [`Settings`] in production
/// and shortened in tests.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub cloudflared_path: PathBuf,
    pub tunnel_dir: PathBuf,
    pub credentials_dir: PathBuf,
    /// Delay before a spawned process is confirmed as Running
    pub start_confirm_delay: Duration,
    /// Bounded wait for interactive stops
    pub stop_timeout: Duration,
}

impl ManagerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            cloudflared_path: settings.cloudflared_path.clone(),
            tunnel_dir: settings.tunnel_dir.clone(),
            credentials_dir: settings.credentials_dir.clone(),
            start_confirm_delay: Duration::from_secs(2),
            stop_timeout: settings.stop_timeout(),
        }
    }
}

#[derive(Default)]
struct State {
    managed: HashMap<String, ManagedTunnel>,
    quick: HashMap<Uuid, QuickTunnel>,
}

struct Inner {
    state: RwLock<State>,
    supervisor: ProcessSupervisor,
    gateway: Gateway,
    event_tx: broadcast::Sender<TunnelEvent>,
    quick_tx: mpsc::UnboundedSender<(Uuid, OutputSignal)>,
    opts: ManagerOptions,
}

/// Manages tunnel records and their lifecycle.
///
/// All record mutation funnels through this type: API handlers, the
/// directory watcher, the periodic status check, and the exit loop all
/// call into the same manager.
#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<Inner>,
}

impl TunnelManager {
    /// Create the manager and spawn its event loop.
    pub fn new(opts: ManagerOptions) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (quick_tx, quick_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let manager = Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                supervisor: ProcessSupervisor::new(exit_tx),
                gateway: Gateway::new(opts.cloudflared_path.clone()),
                event_tx,
                quick_tx,
                opts,
            }),
        };

        let loop_manager = manager.clone();
        tokio::spawn(loop_manager.run_event_loop(exit_rx, quick_rx));

        manager
    }

    /// Subscribe to daemon events
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.event_tx.subscribe()
    }

    pub async fn list_managed(&self) -> Vec<ManagedTunnel> {
        let state = self.inner.state.read().await;
        let mut tunnels: Vec<_> = state.managed.values().cloned().collect();
        tunnels.sort_by(|a, b| a.name.cmp(&b.name));
        tunnels
    }

    pub async fn list_quick(&self) -> Vec<QuickTunnel> {
        let state = self.inner.state.read().await;
        let mut tunnels: Vec<_> = state.quick.values().cloned().collect();
        tunnels.sort_by_key(|t| t.instance_id);
        tunnels
    }

    pub async fn get_managed(&self, name: &str) -> Result<ManagedTunnel> {
        let state = self.inner.state.read().await;
        state
            .managed
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TunnelNotFound(name.to_string()))
    }

    pub fn live_process_count(&self) -> usize {
        self.inner.supervisor.live_count()
    }

    /// Re-read the config directory and merge the result into the records.
    ///
    /// A fatal scan failure (the directory itself is gone) stops every
    /// managed process and clears the table; a transient read failure
    /// leaves the records untouched.
    pub async fn rescan(&self) -> Result<()> {
        match scanner::scan(&self.inner.opts.tunnel_dir) {
            Ok(discovered) => {
                self.reconcile(discovered).await;
                Ok(())
            }
            Err(ScanError::Transient(msg)) => {
                warn!(%msg, "directory scan failed transiently, keeping records");
                Ok(())
            }
            Err(ScanError::Fatal(msg)) => {
                error!(%msg, "tunnel directory unavailable, clearing records");
                let names: Vec<String> = {
                    let state = self.inner.state.read().await;
                    state.managed.keys().cloned().collect()
                };
                for name in &names {
                    let key = {
                        let state = self.inner.state.read().await;
                        state
                            .managed
                            .get(name)
                            .map(|t| ProcessKey::Managed(t.config_path.clone()))
                    };
                    if let Some(key) = key {
                        if let Some(pid) = self.inner.supervisor.take(&key) {
                            supervisor::stop_sync_with_timeout(pid, self.inner.opts.stop_timeout)
                                .await;
                        }
                    }
                }
                self.inner.state.write().await.managed.clear();
                self.emit(TunnelEvent::records_changed());
                Err(Error::Config(msg))
            }
        }
    }

    /// Merge a directory snapshot into the managed records.
    async fn reconcile(&self, mut discovered: Vec<DiscoveredTunnel>) {
        // Deterministic merge order; when two files (site.yml, site.yaml)
        // share a name, the lexicographically first path wins
        discovered.sort_by(|a, b| a.config_path.cmp(&b.config_path));

        let mut vanished_pids = Vec::new();
        let mut changed = false;

        {
            let mut state = self.inner.state.write().await;
            let mut next: HashMap<String, ManagedTunnel> = HashMap::new();

            for found in discovered {
                if next.contains_key(&found.name) {
                    warn!(
                        name = found.name,
                        path = %found.config_path.display(),
                        "duplicate tunnel name, keeping the earlier config file"
                    );
                    continue;
                }
                let key = ProcessKey::Managed(found.config_path.clone());
                match state.managed.remove(&found.name) {
                    Some(mut record) => {
                        if record.remote_id != found.remote_id
                            || record.hostname != found.hostname
                        {
                            changed = true;
                        }
                        record.config_path = found.config_path;
                        record.remote_id = found.remote_id;
                        record.hostname = found.hostname;

                        // Transitional and Error statuses survive the merge;
                        // everything else is recomputed from the handle table.
                        if !record.status.is_transitional()
                            && record.status != TunnelStatus::Error
                        {
                            let actual = if self.inner.supervisor.contains(&key) {
                                TunnelStatus::Running
                            } else {
                                TunnelStatus::Stopped
                            };
                            if record.status != actual {
                                record.status = actual;
                                changed = true;
                            }
                        }
                        next.insert(record.name.clone(), record);
                    }
                    None => {
                        let mut record =
                            ManagedTunnel::new(found.name.clone(), found.config_path);
                        record.remote_id = found.remote_id;
                        record.hostname = found.hostname;
                        if self.inner.supervisor.contains(&key) {
                            record.status = TunnelStatus::Running;
                        }
                        next.insert(found.name, record);
                        changed = true;
                    }
                }
            }

            // Whatever is left in the old table lost its backing file
            for (name, record) in state.managed.drain() {
                changed = true;
                let key = ProcessKey::Managed(record.config_path.clone());
                if let Some(pid) = self.inner.supervisor.take(&key) {
                    info!(name, "config file vanished, stopping its tunnel");
                    vanished_pids.push(pid);
                }
            }

            state.managed = next;
        }

        for pid in vanished_pids {
            supervisor::stop_sync_with_timeout(pid, self.inner.opts.stop_timeout).await;
        }

        if changed {
            self.emit(TunnelEvent::records_changed());
        }
    }

    /// Start a managed tunnel's process and schedule its confirmation.
    pub async fn start_managed(&self, name: &str) -> Result<()> {
        let exe = self.inner.opts.cloudflared_path.clone();

        // Record lookup comes first: an unknown name is a plain not-found,
        // not a start failure
        let config_path = {
            let mut state = self.inner.state.write().await;
            let record = state
                .managed
                .get_mut(name)
                .ok_or_else(|| Error::TunnelNotFound(name.to_string()))?;
            if record.status.is_active() {
                return Err(Error::AlreadyRunning(name.to_string()));
            }
            if !exe.exists() {
                record.status = TunnelStatus::Error;
                record.last_error =
                    Some(format!("executable not found: {}", exe.display()));
                None
            } else {
                record.status = TunnelStatus::Starting;
                record.last_error = None;
                Some(record.config_path.clone())
            }
        };

        let Some(config_path) = config_path else {
            self.emit(TunnelEvent::notification(
                name,
                "Tunnel failed to start",
                &format!("tunnel executable not found at {}", exe.display()),
            ));
            self.emit(TunnelEvent::records_changed());
            return Err(Error::ExecutableMissing(exe));
        };
        self.emit(TunnelEvent::records_changed());

        let key = ProcessKey::Managed(config_path.clone());
        let args = vec![
            "tunnel".to_string(),
            "run".to_string(),
            "--config".to_string(),
            config_path.display().to_string(),
        ];

        if let Err(e) = self.inner.supervisor.start(key, &exe, &args, None, None) {
            let mut state = self.inner.state.write().await;
            if let Some(record) = state.managed.get_mut(name) {
                record.status = TunnelStatus::Error;
                record.last_error = Some(e.to_string());
            }
            drop(state);
            self.emit(TunnelEvent::notification(
                name,
                "Tunnel failed to start",
                &e.to_string(),
            ));
            self.emit(TunnelEvent::records_changed());
            return Err(e);
        }

        info!(name, "tunnel process spawned");

        let manager = self.clone();
        let name = name.to_string();
        let delay = self.inner.opts.start_confirm_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.confirm_start(&name).await;
        });

        Ok(())
    }

    /// Promote a Starting tunnel to Running once its process survived the
    /// confirmation delay. A process that died in the meantime is handled
    /// by the exit report, not here.
    async fn confirm_start(&self, name: &str) {
        let mut state = self.inner.state.write().await;
        let Some(record) = state.managed.get_mut(name) else {
            return;
        };
        if record.status != TunnelStatus::Starting {
            return;
        }
        let key = ProcessKey::Managed(record.config_path.clone());
        if self.inner.supervisor.is_alive(&key) {
            record.status = TunnelStatus::Running;
            drop(state);
            info!(name, "tunnel confirmed running");
            self.emit(TunnelEvent::Started {
                name: name.to_string(),
                timestamp: chrono::Utc::now(),
            });
            self.emit(TunnelEvent::notification(
                name,
                "Tunnel started",
                &format!("{name} is running"),
            ));
            self.emit(TunnelEvent::records_changed());
        } else if self.inner.supervisor.contains(&key) {
            // Handle registered but the process no longer answers: its exit
            // report has not arrived yet. Mark the failure now; the report
            // will find the key taken and stay quiet.
            record.status = TunnelStatus::Error;
            record.last_error = Some("process exited during startup".to_string());
            drop(state);
            self.emit(TunnelEvent::records_changed());
        }
    }

    /// Stop a managed tunnel, waiting a bounded time for the process to
    /// exit. The record is marked Stopped as soon as the signal round is
    /// over, even when the process ignored it.
    pub async fn stop_managed(&self, name: &str) -> Result<()> {
        self.stop_managed_inner(name, true).await
    }

    /// Signal a managed tunnel to stop and return immediately; the exit
    /// report owns the Stopping→Stopped transition.
    pub async fn request_stop(&self, name: &str) -> Result<()> {
        self.stop_managed_inner(name, false).await
    }

    async fn stop_managed_inner(&self, name: &str, sync: bool) -> Result<()> {
        let key = {
            let mut state = self.inner.state.write().await;
            let record = state
                .managed
                .get_mut(name)
                .ok_or_else(|| Error::TunnelNotFound(name.to_string()))?;
            if record.status == TunnelStatus::Stopping {
                debug!(name, "stop already in progress");
                return Ok(());
            }
            // Stopping is entered only from an active state; a stop on an
            // inactive record changes nothing and fires no event
            if !record.status.is_active() {
                return Err(Error::NotRunning(name.to_string()));
            }
            record.status = TunnelStatus::Stopping;
            ProcessKey::Managed(record.config_path.clone())
        };
        self.emit(TunnelEvent::records_changed());

        // The key comes out of the table before any signal is sent, so the
        // exit report classifies this death as intentional.
        let Some(pid) = self.inner.supervisor.take(&key) else {
            // Active-looking record without a live process: self-heal the
            // status quietly, no stop actually happened
            warn!(name, "record was active but no process handle existed");
            {
                let mut state = self.inner.state.write().await;
                if let Some(record) = state.managed.get_mut(name) {
                    record.status = TunnelStatus::Stopped;
                }
            }
            self.emit(TunnelEvent::records_changed());
            return Err(Error::NotRunning(name.to_string()));
        };

        if !sync {
            supervisor::terminate(pid);
            return Ok(());
        }

        let exited =
            supervisor::stop_sync_with_timeout(pid, self.inner.opts.stop_timeout).await;
        if !exited {
            warn!(name, pid, "tunnel did not exit within the stop timeout");
        }
        self.mark_stopped(name).await;
        self.emit(TunnelEvent::notification(
            name,
            "Tunnel stopped",
            &format!("{name} has been stopped"),
        ));
        Ok(())
    }

    async fn mark_stopped(&self, name: &str) {
        let mut state = self.inner.state.write().await;
        if let Some(record) = state.managed.get_mut(name) {
            record.status = TunnelStatus::Stopped;
        }
        drop(state);
        self.emit(TunnelEvent::Stopped {
            name: name.to_string(),
            timestamp: chrono::Utc::now(),
        });
        self.emit(TunnelEvent::records_changed());
    }

    /// Start the tunnel when stopped, stop it when active.
    pub async fn toggle_managed(&self, name: &str) -> Result<()> {
        let active = {
            let state = self.inner.state.read().await;
            state
                .managed
                .get(name)
                .ok_or_else(|| Error::TunnelNotFound(name.to_string()))?
                .status
                .is_active()
        };
        if active {
            self.stop_managed(name).await
        } else {
            self.start_managed(name).await
        }
    }

    /// Create a new managed tunnel: remote create, DNS route, local config.
    ///
    /// `service` optionally points the ingress rule at a companion web
    /// server; the default routes to `http://localhost:<local_port>`.
    /// Failures after the remote create succeeded return
    /// [`Error::SagaLocalWrite`] carrying the created id, because retrying
    /// from scratch would produce a duplicate remote tunnel.
    pub async fn create_managed(
        &self,
        name: &str,
        hostname: &str,
        local_port: u16,
        service: Option<&str>,
    ) -> Result<CreatedTunnel> {
        {
            let state = self.inner.state.read().await;
            if state.managed.contains_key(name) {
                return Err(Error::TunnelExists(name.to_string()));
            }
        }
        let config_path = self.inner.opts.tunnel_dir.join(format!("{name}.yml"));
        if config_path.exists() {
            return Err(Error::TunnelExists(name.to_string()));
        }

        let tunnel_id = self.inner.gateway.create_tunnel(name).await?;
        info!(name, tunnel_id, "remote tunnel created");

        if let Err(e) = self.inner.gateway.route_dns(&tunnel_id, hostname).await {
            return Err(Error::SagaLocalWrite {
                tunnel_id,
                reason: e.to_string(),
            });
        }

        let service = service
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("http://localhost:{local_port}"));
        let contents = gateway::config_template(
            &tunnel_id,
            &self.inner.opts.credentials_dir,
            hostname,
            &service,
        );
        if let Err(e) = std::fs::write(&config_path, contents) {
            return Err(Error::SagaLocalWrite {
                tunnel_id,
                reason: format!("writing {}: {}", config_path.display(), e),
            });
        }

        {
            let mut state = self.inner.state.write().await;
            let mut record = ManagedTunnel::new(name.to_string(), config_path.clone());
            record.remote_id = Some(tunnel_id.clone());
            record.hostname = Some(hostname.to_string());
            state.managed.insert(name.to_string(), record);
        }
        self.emit(TunnelEvent::records_changed());
        self.emit(TunnelEvent::notification(
            name,
            "Tunnel created",
            &format!("{name} is ready at {hostname}"),
        ));

        Ok(CreatedTunnel {
            name: name.to_string(),
            tunnel_id,
            config_path,
        })
    }

    /// Delete a managed tunnel: stop it, delete the remote tunnel, remove
    /// the config file and the record. The remote delete is idempotent, so
    /// a partially-deleted tunnel can be deleted again.
    pub async fn delete_managed(&self, name: &str) -> Result<()> {
        let (config_path, remote_id, active) = {
            let state = self.inner.state.read().await;
            let record = state
                .managed
                .get(name)
                .ok_or_else(|| Error::TunnelNotFound(name.to_string()))?;
            (
                record.config_path.clone(),
                record.remote_id.clone(),
                record.status.is_active(),
            )
        };

        if active {
            if let Err(e) = self.stop_managed(name).await {
                debug!(name, error = %e, "stop before delete was a no-op");
            }
        }

        if let Some(id) = remote_id {
            self.inner.gateway.delete_tunnel(&id).await?;
        }

        match std::fs::remove_file(&config_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.inner.state.write().await.managed.remove(name);
        self.emit(TunnelEvent::records_changed());
        self.emit(TunnelEvent::notification(
            name,
            "Tunnel deleted",
            &format!("{name} has been removed"),
        ));
        Ok(())
    }

    /// Start an ephemeral tunnel exposing `local_url`.
    pub async fn start_quick(&self, local_url: &str) -> Result<QuickTunnel> {
        let exe = self.inner.opts.cloudflared_path.clone();
        if !exe.exists() {
            self.emit(TunnelEvent::notification(
                "quick",
                "Quick tunnel failed",
                &format!("tunnel executable not found at {}", exe.display()),
            ));
            return Err(Error::ExecutableMissing(exe));
        }

        let record = QuickTunnel::new(local_url.to_string());
        let instance_id = record.instance_id;
        let key = ProcessKey::Quick(instance_id);

        let observer = self.quick_observer(instance_id);
        let args = vec![
            "tunnel".to_string(),
            "--url".to_string(),
            local_url.to_string(),
        ];

        self.inner
            .state
            .write()
            .await
            .quick
            .insert(instance_id, record.clone());

        if let Err(e) = self
            .inner
            .supervisor
            .start(key, &exe, &args, None, Some(observer))
        {
            self.inner.state.write().await.quick.remove(&instance_id);
            return Err(e);
        }

        info!(%instance_id, local_url, "quick tunnel spawned");
        self.emit(TunnelEvent::records_changed());
        Ok(record)
    }

    /// Observer closure run on the capture task for a quick tunnel. Scans
    /// the accumulated output and forwards at most one URL signal.
    fn quick_observer(&self, instance_id: Uuid) -> OutputObserver {
        let parser = OutputParser::new();
        let url_found = Arc::new(AtomicBool::new(false));
        let tx = self.inner.quick_tx.clone();
        Arc::new(move |buffer: &str| {
            if let Some(signal) = parser.observe(buffer, url_found.load(Ordering::Relaxed)) {
                if matches!(signal, OutputSignal::PublicUrl(_)) {
                    url_found.store(true, Ordering::Relaxed);
                }
                let _ = tx.send((instance_id, signal));
            }
        })
    }

    /// Stop a quick tunnel. The record disappears when the exit report
    /// arrives; a record with no live process is removed immediately.
    pub async fn stop_quick(&self, instance_id: Uuid) -> Result<()> {
        {
            let mut state = self.inner.state.write().await;
            let record = state
                .quick
                .get_mut(&instance_id)
                .ok_or_else(|| Error::TunnelNotFound(instance_id.to_string()))?;
            record.status = TunnelStatus::Stopping;
        }

        let key = ProcessKey::Quick(instance_id);
        match self.inner.supervisor.take(&key) {
            Some(pid) => {
                supervisor::terminate(pid);
                Ok(())
            }
            None => {
                self.inner.state.write().await.quick.remove(&instance_id);
                self.emit(TunnelEvent::records_changed());
                Ok(())
            }
        }
    }

    /// Periodic self-healing pass: align record statuses with the actual
    /// process table without touching transitional states.
    pub async fn check_status(&self) {
        let mut changed = false;
        {
            let mut state = self.inner.state.write().await;
            for record in state.managed.values_mut() {
                if record.status.is_transitional() {
                    continue;
                }
                let key = ProcessKey::Managed(record.config_path.clone());
                let alive = self.inner.supervisor.is_alive(&key);
                match (&record.status, alive) {
                    (TunnelStatus::Stopped, true) | (TunnelStatus::Error, true) => {
                        debug!(name = record.name, "found live process for inactive record");
                        record.status = TunnelStatus::Running;
                        record.last_error = None;
                        changed = true;
                    }
                    (TunnelStatus::Running, false) => {
                        debug!(name = record.name, "record claims Running but no process");
                        record.status = TunnelStatus::Stopped;
                        changed = true;
                    }
                    _ => {}
                }
            }
        }
        if changed {
            self.emit(TunnelEvent::records_changed());
        }
    }

    /// Stop every active tunnel, bounded per process. Used at shutdown and
    /// exposed as a bulk operation.
    pub async fn stop_all(&self) -> usize {
        let names: Vec<String> = {
            let state = self.inner.state.read().await;
            state
                .managed
                .values()
                .filter(|t| t.status.is_active())
                .map(|t| t.name.clone())
                .collect()
        };
        let quick_ids: Vec<Uuid> = {
            let state = self.inner.state.read().await;
            state.quick.keys().copied().collect()
        };

        let mut stopped = 0;
        for name in &names {
            if self.stop_managed(name).await.is_ok() {
                stopped += 1;
            }
        }
        for id in quick_ids {
            if self.stop_quick(id).await.is_ok() {
                stopped += 1;
            }
        }

        if stopped > 0 {
            self.emit(TunnelEvent::notification(
                "all",
                "Tunnels stopped",
                &format!("stopped {stopped} tunnel(s)"),
            ));
        }
        stopped
    }

    /// Run the interactive control-plane login flow.
    pub async fn login(&self) -> Result<String> {
        self.inner.gateway.login().await
    }

    async fn run_event_loop(
        self,
        mut exit_rx: mpsc::UnboundedReceiver<ProcessExit>,
        mut quick_rx: mpsc::UnboundedReceiver<(Uuid, OutputSignal)>,
    ) {
        loop {
            tokio::select! {
                exit = exit_rx.recv() => match exit {
                    Some(exit) => self.handle_exit(exit).await,
                    None => break,
                },
                signal = quick_rx.recv() => match signal {
                    Some((id, signal)) => self.handle_quick_signal(id, signal).await,
                    None => break,
                },
            }
        }
        debug!("manager event loop finished");
    }

    async fn handle_exit(&self, exit: ProcessExit) {
        let disposition = self.inner.supervisor.consume_exit(&exit);
        debug!(key = %exit.key, ?disposition, code = exit.code, "process exit");

        match &exit.key {
            ProcessKey::Managed(path) => {
                let name = {
                    let state = self.inner.state.read().await;
                    state
                        .managed
                        .values()
                        .find(|t| &t.config_path == path)
                        .map(|t| t.name.clone())
                };
                let Some(name) = name else {
                    return;
                };

                match disposition {
                    ExitDisposition::Unexpected => {
                        let message = failure_message(&exit);
                        {
                            let mut state = self.inner.state.write().await;
                            if let Some(record) = state.managed.get_mut(&name) {
                                record.status = TunnelStatus::Error;
                                record.last_error = Some(message.clone());
                            }
                        }
                        error!(name, message, "tunnel died unexpectedly");
                        self.emit(TunnelEvent::Error {
                            name: name.clone(),
                            error: message.clone(),
                            timestamp: chrono::Utc::now(),
                        });
                        self.emit(TunnelEvent::notification(
                            &name,
                            "Tunnel error",
                            &format!("{name} stopped unexpectedly: {message}"),
                        ));
                        self.emit(TunnelEvent::records_changed());
                    }
                    ExitDisposition::Intentional => {
                        // The stop path already marked the record Stopped
                        // and notified; only repair stragglers here.
                        let needs_update = {
                            let state = self.inner.state.read().await;
                            state
                                .managed
                                .get(&name)
                                .map(|t| t.status != TunnelStatus::Stopped)
                                .unwrap_or(false)
                        };
                        if needs_update {
                            self.mark_stopped(&name).await;
                        }
                    }
                }
            }
            ProcessKey::Quick(id) => {
                let removed = self.inner.state.write().await.quick.remove(id);
                if let Some(record) = removed {
                    if disposition == ExitDisposition::Unexpected
                        && record.public_url.is_none()
                    {
                        let message = failure_message(&exit);
                        self.emit(TunnelEvent::notification(
                            &id.to_string(),
                            "Quick tunnel failed",
                            &message,
                        ));
                    }
                    self.emit(TunnelEvent::records_changed());
                }
            }
        }
    }

    async fn handle_quick_signal(&self, instance_id: Uuid, signal: OutputSignal) {
        match signal {
            OutputSignal::PublicUrl(url) => {
                let updated = {
                    let mut state = self.inner.state.write().await;
                    match state.quick.get_mut(&instance_id) {
                        // public_url is written at most once
                        Some(record) if record.public_url.is_none() => {
                            record.public_url = Some(url.clone());
                            record.status = TunnelStatus::Running;
                            record.last_error = None;
                            true
                        }
                        _ => false,
                    }
                };
                if updated {
                    info!(%instance_id, url, "quick tunnel ready");
                    self.emit(TunnelEvent::QuickReady {
                        instance_id,
                        public_url: url.clone(),
                        timestamp: chrono::Utc::now(),
                    });
                    self.emit(TunnelEvent::notification(
                        &instance_id.to_string(),
                        "Quick tunnel ready",
                        &url,
                    ));
                    self.emit(TunnelEvent::records_changed());
                }
            }
            OutputSignal::ProvisionalError(line) => {
                let mut state = self.inner.state.write().await;
                if let Some(record) = state.quick.get_mut(&instance_id) {
                    if record.public_url.is_none() {
                        record.last_error = Some(line);
                    }
                }
            }
        }
    }

    fn emit(&self, event: TunnelEvent) {
        // Send fails only when nobody is subscribed, which is fine
        let _ = self.inner.event_tx.send(event);
    }
}

/// Human-readable reason extracted from an exit report: the leading
/// stderr lines, where the root cause is printed
fn failure_message(exit: &ProcessExit) -> String {
    let stderr = exit.stderr.trim();
    if !stderr.is_empty() {
        return stderr.lines().take(2).collect::<Vec<_>>().join(" / ");
    }
    match (exit.code, exit.signalled) {
        (Some(code), _) => format!("process exited with code {code}"),
        (None, true) => "process terminated by signal".to_string(),
        (None, false) => "process terminated unexpectedly".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    const CONFIG: &str = "\
tunnel: abc-123
credentials-file: /tmp/abc-123.json
ingress:
  - hostname: foo.example.com
    service: http://localhost:8000
  - service: http_status:404
";

    struct Fixture {
        _tmp: TempDir,
        tunnel_dir: PathBuf,
        manager: TunnelManager,
    }

    /// Build a manager over a temp directory and a fake executable script.
    /// The script receives the subcommand args the real CLI would.
    fn fixture(script: &str) -> Fixture {
        fixture_with_stop_timeout(script, Duration::from_secs(2))
    }

    fn fixture_with_stop_timeout(script: &str, stop_timeout: Duration) -> Fixture {
        let tmp = TempDir::new().expect("tempdir");
        let tunnel_dir = tmp.path().join("tunnels");
        std::fs::create_dir_all(&tunnel_dir).expect("create tunnel dir");

        let exe = tmp.path().join("cloudflared");
        std::fs::write(&exe, format!("#!/bin/sh\n{script}\n")).expect("write script");
        let mut perms = std::fs::metadata(&exe).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&exe, perms).expect("chmod");

        let manager = TunnelManager::new(ManagerOptions {
            cloudflared_path: exe,
            tunnel_dir: tunnel_dir.clone(),
            credentials_dir: tunnel_dir.clone(),
            start_confirm_delay: Duration::from_millis(100),
            stop_timeout,
        });

        Fixture {
            _tmp: tmp,
            tunnel_dir,
            manager,
        }
    }

    fn write_config(dir: &Path, name: &str) {
        std::fs::write(dir.join(format!("{name}.yml")), CONFIG).expect("write config");
    }

    /// Count Stopped events arriving within the window
    async fn count_stopped_events(
        rx: &mut broadcast::Receiver<TunnelEvent>,
        window: Duration,
    ) -> usize {
        let deadline = tokio::time::Instant::now() + window;
        let mut count = 0;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(TunnelEvent::Stopped { .. })) => count += 1,
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => break,
            }
        }
        count
    }

    async fn wait_for_status(
        manager: &TunnelManager,
        name: &str,
        status: TunnelStatus,
    ) -> ManagedTunnel {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let record = manager.get_managed(name).await.expect("record exists");
            if record.status == status {
                return record;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {name} to reach {status:?}, currently {:?}",
                record.status
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn rescan_discovers_and_removes_records() {
        let fx = fixture("sleep 30");
        write_config(&fx.tunnel_dir, "site");
        write_config(&fx.tunnel_dir, "blog");

        fx.manager.rescan().await.expect("rescan");
        let tunnels = fx.manager.list_managed().await;
        assert_eq!(tunnels.len(), 2);
        assert_eq!(tunnels[0].name, "blog");
        assert_eq!(tunnels[1].name, "site");
        assert_eq!(tunnels[1].status, TunnelStatus::Stopped);
        assert_eq!(tunnels[1].remote_id, Some("abc-123".to_string()));
        assert_eq!(tunnels[1].hostname, Some("foo.example.com".to_string()));

        std::fs::remove_file(fx.tunnel_dir.join("blog.yml")).expect("remove");
        fx.manager.rescan().await.expect("rescan");
        let tunnels = fx.manager.list_managed().await;
        assert_eq!(tunnels.len(), 1);
        assert_eq!(tunnels[0].name, "site");
    }

    #[tokio::test]
    async fn start_confirm_and_stop_lifecycle() {
        let fx = fixture("sleep 30");
        write_config(&fx.tunnel_dir, "site");
        fx.manager.rescan().await.expect("rescan");

        fx.manager.start_managed("site").await.expect("start");
        let record = fx.manager.get_managed("site").await.expect("record");
        assert_eq!(record.status, TunnelStatus::Starting);

        wait_for_status(&fx.manager, "site", TunnelStatus::Running).await;
        assert_eq!(fx.manager.live_process_count(), 1);

        fx.manager.stop_managed("site").await.expect("stop");
        let record = fx.manager.get_managed("site").await.expect("record");
        assert_eq!(record.status, TunnelStatus::Stopped);
        assert_eq!(fx.manager.live_process_count(), 0);
    }

    #[tokio::test]
    async fn unexpected_death_sets_error_with_stderr() {
        let fx = fixture("echo 'connection refused' >&2; exit 1");
        write_config(&fx.tunnel_dir, "site");
        fx.manager.rescan().await.expect("rescan");

        fx.manager.start_managed("site").await.expect("start");
        let record = wait_for_status(&fx.manager, "site", TunnelStatus::Error).await;
        assert!(record.last_error.expect("error set").contains("connection refused"));
    }

    #[tokio::test]
    async fn start_with_missing_executable_sets_error() {
        let fx = fixture("sleep 30");
        write_config(&fx.tunnel_dir, "site");
        fx.manager.rescan().await.expect("rescan");

        std::fs::remove_file(fx.manager.inner.opts.cloudflared_path.clone())
            .expect("remove exe");
        let err = fx.manager.start_managed("site").await.expect_err("must fail");
        assert!(matches!(err, Error::ExecutableMissing(_)));
        let record = fx.manager.get_managed("site").await.expect("record");
        assert_eq!(record.status, TunnelStatus::Error);
    }

    #[tokio::test]
    async fn duplicate_start_and_stop_behave() {
        let fx = fixture("sleep 30");
        write_config(&fx.tunnel_dir, "site");
        fx.manager.rescan().await.expect("rescan");

        fx.manager.start_managed("site").await.expect("start");
        let err = fx.manager.start_managed("site").await.expect_err("second start");
        assert!(matches!(err, Error::AlreadyRunning(_)));

        wait_for_status(&fx.manager, "site", TunnelStatus::Running).await;
        fx.manager.stop_managed("site").await.expect("stop");
        // Stopped record: a second stop reports not running
        let err = fx.manager.stop_managed("site").await.expect_err("second stop");
        assert!(matches!(err, Error::NotRunning(_)));
    }

    #[tokio::test]
    async fn vanished_config_stops_running_tunnel() {
        let fx = fixture("sleep 30");
        write_config(&fx.tunnel_dir, "site");
        fx.manager.rescan().await.expect("rescan");

        fx.manager.start_managed("site").await.expect("start");
        wait_for_status(&fx.manager, "site", TunnelStatus::Running).await;

        std::fs::remove_file(fx.tunnel_dir.join("site.yml")).expect("remove");
        fx.manager.rescan().await.expect("rescan");

        assert!(fx.manager.list_managed().await.is_empty());
        assert_eq!(fx.manager.live_process_count(), 0);
    }

    #[tokio::test]
    async fn error_status_survives_rescan() {
        let fx = fixture("exit 1");
        write_config(&fx.tunnel_dir, "site");
        fx.manager.rescan().await.expect("rescan");

        fx.manager.start_managed("site").await.expect("start");
        wait_for_status(&fx.manager, "site", TunnelStatus::Error).await;

        fx.manager.rescan().await.expect("rescan");
        let record = fx.manager.get_managed("site").await.expect("record");
        assert_eq!(record.status, TunnelStatus::Error);
    }

    #[tokio::test]
    async fn quick_tunnel_reports_public_url_once() {
        let fx = fixture(
            "echo 'https://witty-crab.trycloudflare.com' >&2; \
             echo 'https://other-name.trycloudflare.com' >&2; \
             sleep 30",
        );
        let mut events = fx.manager.subscribe();

        let record = fx.manager.start_quick("http://localhost:8080").await.expect("start");
        let id = record.instance_id;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let url = loop {
            let event = tokio::time::timeout_at(deadline, events.recv())
                .await
                .expect("timed out waiting for QuickReady")
                .expect("channel open");
            if let TunnelEvent::QuickReady { public_url, .. } = event {
                break public_url;
            }
        };
        assert_eq!(url, "https://witty-crab.trycloudflare.com");

        let quick = fx.manager.list_quick().await;
        assert_eq!(quick.len(), 1);
        assert_eq!(quick[0].status, TunnelStatus::Running);
        assert_eq!(quick[0].public_url.as_deref(), Some(url.as_str()));

        fx.manager.stop_quick(id).await.expect("stop");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !fx.manager.list_quick().await.is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "quick record not removed");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn quick_failure_keeps_provisional_error() {
        let fx = fixture("echo 'failed to request quick tunnel' >&2; sleep 30");
        let record = fx.manager.start_quick("http://localhost:8080").await.expect("start");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let quick = fx.manager.list_quick().await;
            if quick
                .first()
                .and_then(|t| t.last_error.as_deref())
                .map(|e| e.contains("failed to request"))
                .unwrap_or(false)
            {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "provisional error never set");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        fx.manager.stop_quick(record.instance_id).await.expect("stop");
    }

    #[tokio::test]
    async fn create_saga_happy_path_writes_config() {
        let fx = fixture(
            "case \"$2\" in \
             create) echo \"Created tunnel $3 with id d383d8a6-d0bc-4a9d-9c41-0dc78f0db81e\";; \
             route) exit 0;; \
             esac",
        );
        let created = fx
            .manager
            .create_managed("site", "foo.example.com", 8000, None)
            .await
            .expect("create");
        assert_eq!(created.tunnel_id, "d383d8a6-d0bc-4a9d-9c41-0dc78f0db81e");
        assert!(created.config_path.exists());

        let contents = std::fs::read_to_string(&created.config_path).expect("read");
        assert!(contents.contains("hostname: foo.example.com"));

        let record = fx.manager.get_managed("site").await.expect("record");
        assert_eq!(record.hostname, Some("foo.example.com".to_string()));
    }

    #[tokio::test]
    async fn create_saga_partial_failure_carries_tunnel_id() {
        let fx = fixture(
            "case \"$2\" in \
             create) echo \"Created tunnel $3 with id d383d8a6-d0bc-4a9d-9c41-0dc78f0db81e\";; \
             route) echo 'zone not found' >&2; exit 1;; \
             esac",
        );
        let err = fx
            .manager
            .create_managed("site", "foo.example.com", 8000, None)
            .await
            .expect_err("route failure");
        match err {
            Error::SagaLocalWrite { tunnel_id, .. } => {
                assert_eq!(tunnel_id, "d383d8a6-d0bc-4a9d-9c41-0dc78f0db81e");
            }
            other => panic!("expected SagaLocalWrite, got {other:?}"),
        }
        // No local config was written
        assert!(!fx.tunnel_dir.join("site.yml").exists());
    }

    #[tokio::test]
    async fn create_rejects_existing_name() {
        let fx = fixture("exit 0");
        write_config(&fx.tunnel_dir, "site");
        fx.manager.rescan().await.expect("rescan");

        let err = fx
            .manager
            .create_managed("site", "foo.example.com", 8000, None)
            .await
            .expect_err("duplicate name");
        assert!(matches!(err, Error::TunnelExists(_)));
    }

    #[tokio::test]
    async fn delete_stops_and_removes_everything() {
        let fx = fixture("if [ \"$2\" = run ]; then sleep 30; fi");
        write_config(&fx.tunnel_dir, "site");
        fx.manager.rescan().await.expect("rescan");

        fx.manager.start_managed("site").await.expect("start");
        wait_for_status(&fx.manager, "site", TunnelStatus::Running).await;

        fx.manager.delete_managed("site").await.expect("delete");
        assert!(fx.manager.list_managed().await.is_empty());
        assert!(!fx.tunnel_dir.join("site.yml").exists());
        assert_eq!(fx.manager.live_process_count(), 0);
    }

    #[tokio::test]
    async fn check_status_self_heals_records() {
        let fx = fixture("sleep 30");
        write_config(&fx.tunnel_dir, "site");
        fx.manager.rescan().await.expect("rescan");

        fx.manager.start_managed("site").await.expect("start");
        wait_for_status(&fx.manager, "site", TunnelStatus::Running).await;

        // Forge a stale status and let the periodic pass repair it
        {
            let mut state = fx.manager.inner.state.write().await;
            state.managed.get_mut("site").expect("record").status = TunnelStatus::Stopped;
        }
        fx.manager.check_status().await;
        let record = fx.manager.get_managed("site").await.expect("record");
        assert_eq!(record.status, TunnelStatus::Running);

        fx.manager.stop_managed("site").await.expect("stop");
    }

    #[tokio::test]
    async fn stop_all_covers_managed_and_quick() {
        let fx = fixture("sleep 30");
        write_config(&fx.tunnel_dir, "site");
        fx.manager.rescan().await.expect("rescan");

        fx.manager.start_managed("site").await.expect("start");
        wait_for_status(&fx.manager, "site", TunnelStatus::Running).await;
        fx.manager.start_quick("http://localhost:8080").await.expect("quick");

        let stopped = fx.manager.stop_all().await;
        assert_eq!(stopped, 2);
        let record = fx.manager.get_managed("site").await.expect("record");
        assert_eq!(record.status, TunnelStatus::Stopped);
    }

    #[tokio::test]
    async fn redundant_stop_emits_no_stopped_event() {
        let fx = fixture("sleep 30");
        write_config(&fx.tunnel_dir, "site");
        fx.manager.rescan().await.expect("rescan");

        fx.manager.start_managed("site").await.expect("start");
        wait_for_status(&fx.manager, "site", TunnelStatus::Running).await;
        fx.manager.stop_managed("site").await.expect("stop");

        // A stop on a stopped record must neither enter Stopping nor
        // re-fire the stopped signal
        let mut events = fx.manager.subscribe();
        let err = fx.manager.stop_managed("site").await.expect_err("already stopped");
        assert!(matches!(err, Error::NotRunning(_)));

        let record = fx.manager.get_managed("site").await.expect("record");
        assert_eq!(record.status, TunnelStatus::Stopped);
        assert_eq!(
            count_stopped_events(&mut events, Duration::from_millis(200)).await,
            0
        );
    }

    #[tokio::test]
    async fn stop_while_stopping_signals_once() {
        // The child ignores SIGTERM so the first stop holds the record in
        // Stopping for its whole bounded wait
        let fx = fixture_with_stop_timeout("trap '' TERM; sleep 30", Duration::from_millis(600));
        write_config(&fx.tunnel_dir, "site");
        fx.manager.rescan().await.expect("rescan");

        fx.manager.start_managed("site").await.expect("start");
        wait_for_status(&fx.manager, "site", TunnelStatus::Running).await;
        // Give the shell a moment to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut events = fx.manager.subscribe();
        let stopper = fx.manager.clone();
        let first = tokio::spawn(async move { stopper.stop_managed("site").await });
        wait_for_status(&fx.manager, "site", TunnelStatus::Stopping).await;

        // Second stop while one is in flight: quiet no-op, no second signal
        fx.manager.stop_managed("site").await.expect("no-op");
        let record = fx.manager.get_managed("site").await.expect("record");
        assert_eq!(record.status, TunnelStatus::Stopping);

        first.await.expect("join").expect("first stop");
        wait_for_status(&fx.manager, "site", TunnelStatus::Stopped).await;
        assert_eq!(
            count_stopped_events(&mut events, Duration::from_millis(300)).await,
            1
        );
    }

    #[tokio::test]
    async fn async_stop_is_finished_by_exit_report() {
        let fx = fixture("sleep 30");
        write_config(&fx.tunnel_dir, "site");
        fx.manager.rescan().await.expect("rescan");

        fx.manager.start_managed("site").await.expect("start");
        wait_for_status(&fx.manager, "site", TunnelStatus::Running).await;

        fx.manager.request_stop("site").await.expect("request stop");
        let record = fx.manager.get_managed("site").await.expect("record");
        assert_eq!(record.status, TunnelStatus::Stopping);

        // The exit report owns the final transition
        wait_for_status(&fx.manager, "site", TunnelStatus::Stopped).await;
        assert_eq!(fx.manager.live_process_count(), 0);
    }

    #[tokio::test]
    async fn create_with_companion_service_routes_ingress_to_it() {
        let fx = fixture(
            "case \"$2\" in \
             create) echo \"Created tunnel $3 with id d383d8a6-d0bc-4a9d-9c41-0dc78f0db81e\";; \
             route) exit 0;; \
             esac",
        );
        let created = fx
            .manager
            .create_managed(
                "site",
                "foo.example.com",
                8000,
                Some("http://localhost:9090/app"),
            )
            .await
            .expect("create");

        let contents = std::fs::read_to_string(&created.config_path).expect("read");
        assert!(contents.contains("service: http://localhost:9090/app"));
        assert!(!contents.contains("service: http://localhost:8000"));
    }

    #[tokio::test]
    async fn duplicate_names_resolve_deterministically() {
        let fx = fixture("sleep 30");
        std::fs::write(fx.tunnel_dir.join("site.yml"), CONFIG).expect("write yml");
        std::fs::write(fx.tunnel_dir.join("site.yaml"), CONFIG).expect("write yaml");

        fx.manager.rescan().await.expect("rescan");
        let tunnels = fx.manager.list_managed().await;
        assert_eq!(tunnels.len(), 1);
        // Lexicographically first path wins ("site.yaml" < "site.yml")
        assert!(tunnels[0].config_path.ends_with("site.yaml"));

        // Rescans stay stable
        fx.manager.rescan().await.expect("rescan");
        let again = fx.manager.list_managed().await;
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].config_path, tunnels[0].config_path);
    }

    #[tokio::test]
    async fn start_unknown_name_is_plain_not_found() {
        let fx = fixture("sleep 30");
        fx.manager.rescan().await.expect("rescan");

        let mut events = fx.manager.subscribe();
        let err = fx.manager.start_managed("ghost").await.expect_err("unknown name");
        assert!(matches!(err, Error::TunnelNotFound(_)));

        // No failure notification or record churn for a name that never existed
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            events.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn failure_message_prefers_leading_stderr_lines() {
        let exit = ProcessExit {
            key: ProcessKey::Quick(Uuid::new_v4()),
            token: 1,
            code: Some(1),
            signalled: false,
            stdout: String::new(),
            stderr: "failed to connect to edge\nretrying in 1s\nretrying in 2s\n".to_string(),
        };
        let message = failure_message(&exit);
        assert_eq!(message, "failed to connect to edge / retrying in 1s");

        let quiet = ProcessExit {
            key: ProcessKey::Quick(Uuid::new_v4()),
            token: 2,
            code: Some(3),
            signalled: false,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(failure_message(&quiet), "process exited with code 3");
    }
}
