//! Monitor session bookkeeping: the clean-shutdown marker and a crash-start
//! journal.
//!
//! The marker records which paths were immutabilized by a running session.
//! If it survives into the next startup the previous session did not stop
//! cleanly and files may still be locked down with nobody watching them;
//! the startup self-check lifts that protection before anything else runs.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::elevation::{PrivilegedOps, Verb};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMarker {
    pub started_at: DateTime<Utc>,
    pub protected_paths: Vec<PathBuf>,
}

pub fn write_marker(path: &Path, protected_paths: &[PathBuf]) -> Result<()> {
    let marker = SessionMarker {
        started_at: Utc::now(),
        protected_paths: protected_paths.to_vec(),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&marker)?)?;
    Ok(())
}

pub fn clear_marker(path: &Path) {
    let _ = std::fs::remove_file(path);
}

pub fn read_marker(path: &Path) -> Option<SessionMarker> {
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

/// Startup self-check: a surviving marker means the previous session went
/// down without releasing its protections. Lift them (best effort) so the
/// user is not locked out of their own files, then clear the marker.
/// Returns whether recovery ran.
pub async fn recover_unclean_shutdown(
    marker_path: &Path,
    elevator: &Arc<dyn PrivilegedOps>,
) -> Result<bool> {
    let Some(marker) = read_marker(marker_path) else {
        return Ok(false);
    };
    warn!(
        started_at = %marker.started_at,
        paths = marker.protected_paths.len(),
        "previous session did not stop cleanly, releasing leftover protections"
    );
    if !marker.protected_paths.is_empty() {
        match elevator
            .invoke(Verb::Unprotect, &marker.protected_paths)
            .await
        {
            Ok(outcomes) => {
                for outcome in outcomes.iter().filter(|o| !o.ok) {
                    warn!(
                        path = %outcome.path.display(),
                        detail = ?outcome.detail,
                        "could not release leftover protection"
                    );
                }
            }
            Err(e) => {
                warn!(error = %e, "leftover protections could not be released");
            }
        }
    }
    clear_marker(marker_path);
    info!("startup recovery complete");
    Ok(true)
}

/// Sliding-window journal of service starts; a burst of starts means the
/// service is crash-looping and deserves a loud log line.
pub struct CrashJournal {
    path: PathBuf,
}

impl CrashJournal {
    const WINDOW_MINUTES: i64 = 5;

    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Record a start and return how many starts happened in the window.
    pub fn record_start(&self) -> Result<usize> {
        let mut entries: Vec<DateTime<Utc>> = if self.path.exists() {
            let data = std::fs::read_to_string(&self.path)?;
            serde_json::from_str(&data).unwrap_or_default()
        } else {
            vec![]
        };
        let now = Utc::now();
        let window = chrono::Duration::minutes(Self::WINDOW_MINUTES);
        entries.retain(|t| *t > now - window);
        entries.push(now);
        let count = entries.len();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string(&entries)?)?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn marker_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        assert!(read_marker(&path).is_none());
        write_marker(&path, &[PathBuf::from("/etc/critical.conf")]).unwrap();
        let marker = read_marker(&path).unwrap();
        assert_eq!(marker.protected_paths.len(), 1);
        clear_marker(&path);
        assert!(read_marker(&path).is_none());
    }

    #[test]
    fn crash_journal_counts_recent_starts() {
        let dir = tempdir().unwrap();
        let journal = CrashJournal::new(dir.path().join("crash-journal.json"));
        assert_eq!(journal.record_start().unwrap(), 1);
        assert_eq!(journal.record_start().unwrap(), 2);
        assert_eq!(journal.record_start().unwrap(), 3);
    }
}
