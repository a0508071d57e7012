//! Tamper watcher: filesystem events plus a periodic audit sweep.
//!
//! `notify` delivers near-realtime change events for the directories holding
//! protected files; the audit interval re-verifies everything as a catch-all
//! for missed events (overflow, network filesystems, service restarts).
//! Events for paths currently being restored are discarded so the restorer
//! never chases its own writes.

use anyhow::{Context, Result};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use super::{FileProtectionGuard, RestoreOutcome};

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);
const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct ProtectionWatcher {
    watcher: RecommendedWatcher,
    watched_dirs: HashSet<PathBuf>,
}

impl ProtectionWatcher {
    /// Watch the directory containing `path`. Watching the parent instead of
    /// the file itself keeps delete-then-recreate sequences visible.
    pub fn watch(&mut self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| path.to_path_buf());
        if self.watched_dirs.contains(&dir) {
            return Ok(());
        }
        self.watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch {}", dir.display()))?;
        self.watched_dirs.insert(dir.clone());
        info!(dir = %dir.display(), "watching for tampering");
        Ok(())
    }
}

/// Spawn the watcher pipeline. Returns the watcher handle (register paths
/// through it) and the background task driving verification and restore.
pub fn spawn(
    guard: Arc<FileProtectionGuard>,
    audit_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(ProtectionWatcher, tokio::task::JoinHandle<()>)> {
    let (event_tx, mut event_rx) = mpsc::channel::<PathBuf>(EVENT_CHANNEL_CAPACITY);

    // notify runs its callback on a dedicated thread; try_send keeps that
    // thread from ever blocking. Dropped events are covered by the audit.
    let watcher = RecommendedWatcher::new(
        move |result: std::result::Result<Event, notify::Error>| match result {
            Ok(event) => {
                for path in event.paths {
                    if event_tx.try_send(path).is_err() {
                        trace!("watcher event channel full, audit will catch up");
                    }
                }
            }
            Err(e) => warn!("file watcher error: {e}"),
        },
        Config::default().with_poll_interval(Duration::from_secs(2)),
    )?;

    let restoring = guard.restoring_handle();
    let handle = tokio::spawn(async move {
        info!(
            audit_interval_secs = audit_interval.as_secs(),
            "protection watcher started"
        );
        let mut audit = tokio::time::interval(audit_interval);
        let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

        loop {
            tokio::select! {
                maybe = event_rx.recv() => {
                    match maybe {
                        Some(path) => {
                            if guard.is_protected(&path) && !restoring.lock().contains(&path) {
                                pending.insert(path, Instant::now());
                            }
                        }
                        None => {
                            debug!("watcher channel closed, pipeline exiting");
                            return;
                        }
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(50)), if !pending.is_empty() => {}
                _ = audit.tick() => {
                    for path in guard.protected_paths() {
                        run_check(&guard, &path).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("protection watcher shutting down");
                        return;
                    }
                }
            }

            // Flush debounced events whose window has elapsed.
            let now = Instant::now();
            let ready: Vec<PathBuf> = pending
                .iter()
                .filter(|(_, ts)| now.duration_since(**ts) >= DEBOUNCE_WINDOW)
                .map(|(p, _)| p.clone())
                .collect();
            for path in ready {
                pending.remove(&path);
                if restoring.lock().contains(&path) {
                    trace!(path = %path.display(), "suppressed event - path being restored");
                    continue;
                }
                run_check(&guard, &path).await;
            }
        }
    });

    Ok((
        ProtectionWatcher {
            watcher,
            watched_dirs: HashSet::new(),
        },
        handle,
    ))
}

async fn run_check(guard: &FileProtectionGuard, path: &Path) {
    match guard.verify_and_restore(path).await {
        RestoreOutcome::Intact => {
            trace!(path = %path.display(), "verified intact");
        }
        RestoreOutcome::Restored => {
            info!(path = %path.display(), "tampering repaired from backup");
        }
        RestoreOutcome::AlreadyRestoring | RestoreOutcome::NotProtected => {}
        RestoreOutcome::BackupCorrupted(detail) => {
            warn!(path = %path.display(), detail = %detail, "backup corrupted - cannot self-heal");
        }
        RestoreOutcome::Failed(detail) => {
            warn!(path = %path.display(), detail = %detail, "restore failed");
        }
    }
}
