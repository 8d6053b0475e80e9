// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Edge Tunnel Manager Contributors

// Edge Tunnel Manager - Directory Change Monitor
// Debounced filesystem watching of the tunnel config directory

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::manager::TunnelManager;

/// Quiet period after the last filesystem event before a rescan fires
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(1500);

/// Watch the tunnel config directory and trigger a manager rescan after
/// each debounced burst of changes. Runs until the notify backend drops
/// the channel.
///
/// The watcher handle must stay alive for events to keep flowing, so this
/// function owns it for its whole run.
pub async fn watch_config_dir(manager: TunnelManager, dir: PathBuf) {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut watcher = match build_watcher(tx) {
        Ok(watcher) => watcher,
        Err(e) => {
            warn!(error = %e, "filesystem watcher unavailable, relying on periodic rescans");
            return;
        }
    };

    if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
        // The directory may not exist yet; the first rescan creates it,
        // after which watching is retried once.
        warn!(path = %dir.display(), error = %e, "could not watch tunnel directory");
        if manager.rescan().await.is_err() {
            return;
        }
        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            warn!(path = %dir.display(), error = %e, "watch retry failed, giving up");
            return;
        }
    }

    info!(path = %dir.display(), "watching tunnel config directory");

    while rx.recv().await.is_some() {
        // Swallow the rest of the burst before rescanning
        loop {
            tokio::select! {
                _ = tokio::time::sleep(DEBOUNCE_WINDOW) => break,
                more = rx.recv() => {
                    if more.is_none() {
                        return;
                    }
                }
            }
        }

        debug!("config directory changed, rescanning");
        if let Err(e) = manager.rescan().await {
            warn!(error = %e, "rescan after directory change failed");
        }
    }
}

/// Build a notify watcher forwarding relevant events into a tokio channel.
/// The notify callback runs on its own thread, hence the unbounded sender.
fn build_watcher(tx: mpsc::UnboundedSender<()>) -> notify::Result<RecommendedWatcher> {
    notify::recommended_watcher(move |result: notify::Result<Event>| match result {
        Ok(event) => {
            if is_relevant(&event) {
                let _ = tx.send(());
            }
        }
        Err(e) => warn!(error = %e, "filesystem watch error"),
    })
}

/// Only mutations matter; access and metadata-only events are ignored
fn is_relevant(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event.paths.iter().any(|p| is_config_path(p))
}

fn is_config_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yml") | Some("yaml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind};

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn create_and_modify_of_configs_are_relevant() {
        assert!(is_relevant(&event(
            EventKind::Create(CreateKind::File),
            "/tmp/site.yml"
        )));
        assert!(is_relevant(&event(
            EventKind::Modify(ModifyKind::Any),
            "/tmp/site.yaml"
        )));
    }

    #[test]
    fn non_config_files_are_ignored() {
        assert!(!is_relevant(&event(
            EventKind::Create(CreateKind::File),
            "/tmp/notes.txt"
        )));
        assert!(!is_relevant(&event(
            EventKind::Modify(ModifyKind::Any),
            "/tmp/site.yml.swp"
        )));
    }

    #[test]
    fn access_events_are_ignored() {
        let ev = event(
            EventKind::Access(notify::event::AccessKind::Read),
            "/tmp/site.yml",
        );
        assert!(!is_relevant(&ev));
    }
}
