//! File-immutability protection with automatic backup and recovery.
//!
//! The contract is fail-closed: a path only ever becomes `Protected` after
//! its backup artifact is safely on disk. Losing the elevation channel does
//! not abort protection; it degrades to narrowed permissions and says so.

pub mod backup;
pub mod watcher;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use applock_core::error::LockError;

use crate::elevation::{PrivilegedOps, Verb};
use self::backup::{hash_file, BackupStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtectionState {
    Unprotected,
    Protected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedFile {
    pub original: PathBuf,
    pub backup_name: String,
    pub state: ProtectionState,
    pub degraded: bool,
    pub last_verified_at: Option<DateTime<Utc>>,
}

/// Per-path result of a protect/unprotect request. `degraded` means the
/// path is guarded by narrowed permissions instead of true immutability.
#[derive(Debug, Clone)]
pub struct ProtectOutcome {
    pub path: PathBuf,
    pub ok: bool,
    pub degraded: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RestoreOutcome {
    Intact,
    Restored,
    AlreadyRestoring,
    NotProtected,
    BackupCorrupted(String),
    Failed(String),
}

const RESTORE_RETRY_DELAYS_MS: [u64; 3] = [100, 500, 2000];

pub struct FileProtectionGuard {
    store: Mutex<BackupStore>,
    elevator: Arc<dyn PrivilegedOps>,
    files: Mutex<HashMap<PathBuf, ProtectedFile>>,
    /// Paths currently undergoing restore; the watcher skips their events.
    restoring: Arc<Mutex<HashSet<PathBuf>>>,
}

impl FileProtectionGuard {
    pub fn new(store: BackupStore, elevator: Arc<dyn PrivilegedOps>) -> Self {
        Self {
            store: Mutex::new(store),
            elevator,
            files: Mutex::new(HashMap::new()),
            restoring: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn restoring_handle(&self) -> Arc<Mutex<HashSet<PathBuf>>> {
        self.restoring.clone()
    }

    pub fn is_protected(&self, path: &Path) -> bool {
        self.files
            .lock()
            .get(path)
            .map(|f| f.state == ProtectionState::Protected)
            .unwrap_or(false)
    }

    pub fn protected_paths(&self) -> Vec<PathBuf> {
        self.files
            .lock()
            .values()
            .filter(|f| f.state == ProtectionState::Protected)
            .map(|f| f.original.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<ProtectedFile> {
        self.files.lock().values().cloned().collect()
    }

    /// Protect every path independently. Idempotent: an already-protected
    /// path is a successful no-op with no second backup.
    pub async fn protect(&self, paths: &[PathBuf]) -> Vec<ProtectOutcome> {
        let mut outcomes = Vec::with_capacity(paths.len());
        for path in paths {
            outcomes.push(self.protect_one(path).await);
        }
        outcomes
    }

    async fn protect_one(&self, path: &Path) -> ProtectOutcome {
        let canonical = match path.canonicalize() {
            Ok(c) => c,
            Err(e) => {
                return ProtectOutcome {
                    path: path.to_path_buf(),
                    ok: false,
                    degraded: false,
                    detail: Some(format!("cannot resolve path: {e}")),
                }
            }
        };

        if let Some(existing) = self.files.lock().get(&canonical) {
            if existing.state == ProtectionState::Protected {
                return ProtectOutcome {
                    path: canonical,
                    ok: true,
                    degraded: existing.degraded,
                    detail: None,
                };
            }
        }

        // Backup first; without a verified backup nothing gets locked down.
        let entry = match self.store.lock().ensure_from_disk(&canonical) {
            Ok(entry) => entry,
            Err(e) => {
                error!(path = %canonical.display(), error = %e, "backup failed, refusing to protect");
                return ProtectOutcome {
                    path: canonical,
                    ok: false,
                    degraded: false,
                    detail: Some(format!("backup failed: {e}")),
                };
            }
        };

        let (ok, degraded, detail) = self.apply_protection(&canonical).await;
        if ok {
            self.files.lock().insert(
                canonical.clone(),
                ProtectedFile {
                    original: canonical.clone(),
                    backup_name: entry.artifact,
                    state: ProtectionState::Protected,
                    degraded,
                    last_verified_at: Some(Utc::now()),
                },
            );
            info!(path = %canonical.display(), degraded, "file protected");
        }
        ProtectOutcome {
            path: canonical,
            ok,
            degraded,
            detail,
        }
    }

    /// Apply immutability through the elevator, degrading to permission
    /// narrowing when no elevation exists. Returns (ok, degraded, detail).
    async fn apply_protection(&self, path: &Path) -> (bool, bool, Option<String>) {
        match self
            .elevator
            .invoke(Verb::Protect, std::slice::from_ref(&path.to_path_buf()))
            .await
        {
            Ok(results) => match results.first() {
                Some(r) if r.ok => (true, false, None),
                Some(r) => (false, false, r.detail.clone()),
                None => (false, false, Some("elevator returned no result".to_string())),
            },
            Err(LockError::ElevationUnavailable) => match narrow_permissions(path) {
                Ok(()) => {
                    warn!(
                        path = %path.display(),
                        "no elevation available - degraded to permission narrowing"
                    );
                    (true, true, Some("degraded: permissions narrowed".to_string()))
                }
                Err(e) => (false, false, Some(format!("degraded fallback failed: {e}"))),
            },
            Err(e) => (false, false, Some(e.to_string())),
        }
    }

    /// Remove protection from the given paths; idempotent.
    pub async fn unprotect(&self, paths: &[PathBuf]) -> Vec<ProtectOutcome> {
        let mut outcomes = Vec::with_capacity(paths.len());
        for path in paths {
            outcomes.push(self.unprotect_one(path).await);
        }
        outcomes
    }

    async fn unprotect_one(&self, path: &Path) -> ProtectOutcome {
        let entry = self.files.lock().get(path).cloned();
        let Some(entry) = entry else {
            // Never protected by this session; still try to clear any flag a
            // crashed session may have left behind.
            let _ = self
                .elevator
                .invoke(Verb::Unprotect, std::slice::from_ref(&path.to_path_buf()))
                .await;
            return ProtectOutcome {
                path: path.to_path_buf(),
                ok: true,
                degraded: false,
                detail: None,
            };
        };
        if entry.state == ProtectionState::Unprotected {
            return ProtectOutcome {
                path: path.to_path_buf(),
                ok: true,
                degraded: entry.degraded,
                detail: None,
            };
        }

        let (ok, detail) = if entry.degraded {
            match restore_mode(path, self.stored_mode(path)) {
                Ok(()) => (true, None),
                Err(e) => (false, Some(e.to_string())),
            }
        } else {
            match self
                .elevator
                .invoke(Verb::Unprotect, std::slice::from_ref(&path.to_path_buf()))
                .await
            {
                Ok(results) => match results.first() {
                    Some(r) if r.ok => (true, None),
                    Some(r) => (false, r.detail.clone()),
                    None => (false, Some("elevator returned no result".to_string())),
                },
                Err(e) => (false, Some(e.to_string())),
            }
        };

        if ok {
            if let Some(file) = self.files.lock().get_mut(path) {
                file.state = ProtectionState::Unprotected;
            }
            info!(path = %path.display(), "file unprotected");
        }
        ProtectOutcome {
            path: path.to_path_buf(),
            ok,
            degraded: entry.degraded,
            detail,
        }
    }

    pub async fn unprotect_all(&self) -> Vec<ProtectOutcome> {
        let paths = self.protected_paths();
        self.unprotect(&paths).await
    }

    fn stored_mode(&self, path: &Path) -> u32 {
        self.store
            .lock()
            .entry_for(path)
            .map(|e| e.mode)
            .unwrap_or(0)
    }

    /// Check one protected path against its backup and restore it when the
    /// content is missing or no longer matches. Driven by the watcher and
    /// the periodic audit; safe to race with manual re-protects.
    pub async fn verify_and_restore(&self, path: &Path) -> RestoreOutcome {
        let entry = self.files.lock().get(path).cloned();
        let Some(entry) = entry else {
            return RestoreOutcome::NotProtected;
        };
        if entry.state != ProtectionState::Protected {
            return RestoreOutcome::NotProtected;
        }

        {
            let mut restoring = self.restoring.lock();
            if restoring.contains(path) {
                return RestoreOutcome::AlreadyRestoring;
            }
            restoring.insert(path.to_path_buf());
        }

        let outcome = self.verify_and_restore_inner(path, &entry).await;
        self.restoring.lock().remove(path);

        if matches!(outcome, RestoreOutcome::Intact | RestoreOutcome::Restored) {
            if let Some(file) = self.files.lock().get_mut(path) {
                file.last_verified_at = Some(Utc::now());
            }
        }
        outcome
    }

    async fn verify_and_restore_inner(&self, path: &Path, entry: &ProtectedFile) -> RestoreOutcome {
        let expected = match self.store.lock().entry_for(path).cloned() {
            Some(e) => e,
            None => return RestoreOutcome::Failed("no backup entry for path".to_string()),
        };

        if path.exists() {
            match hash_file(path) {
                Ok(actual) if actual == expected.hash => return RestoreOutcome::Intact,
                Ok(actual) => {
                    warn!(
                        path = %path.display(),
                        expected = %expected.hash,
                        actual = %actual,
                        "tampering detected"
                    );
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot hash protected file");
                }
            }
        } else {
            warn!(path = %path.display(), "protected file missing");
        }

        // Pull the verified backup bytes before touching anything.
        let data = match self.store.lock().read_verified(path) {
            Ok(data) => data,
            Err(e) => {
                error!(path = %path.display(), error = %e, "backup unusable, cannot restore");
                return RestoreOutcome::BackupCorrupted(e.to_string());
            }
        };

        for (attempt, delay_ms) in RESTORE_RETRY_DELAYS_MS.iter().enumerate() {
            match self.try_restore_once(path, entry, &expected.hash, expected.mode, &data).await {
                Ok(()) => {
                    info!(path = %path.display(), "file restored from backup");
                    return RestoreOutcome::Restored;
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        attempt = attempt + 1,
                        error = %e,
                        "restore attempt failed"
                    );
                    tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
                }
            }
        }
        error!(path = %path.display(), "all restore attempts failed");
        RestoreOutcome::Failed("restore retries exhausted".to_string())
    }

    async fn try_restore_once(
        &self,
        path: &Path,
        entry: &ProtectedFile,
        expected_hash: &str,
        mode: u32,
        data: &[u8],
    ) -> Result<()> {
        // A tampered-but-present immutable file cannot be replaced until the
        // flag is cleared; a deleted one has nothing to clear.
        if path.exists() {
            if entry.degraded {
                let _ = restore_mode(path, 0o600);
            } else {
                let _ = self
                    .elevator
                    .invoke(Verb::Unprotect, std::slice::from_ref(&path.to_path_buf()))
                    .await;
            }
        }

        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("no parent dir for {}", path.display()))?;
        fs::create_dir_all(parent)?;

        // Staging file in the same directory so the rename is atomic.
        let mut staging = tempfile::NamedTempFile::new_in(parent)?;
        staging.write_all(data)?;
        staging.as_file().sync_all()?;
        staging
            .persist(path)
            .map_err(|e| anyhow!("replace {}: {}", path.display(), e.error))?;
        restore_mode(path, mode)?;

        let actual = hash_file(path)?;
        if actual != expected_hash {
            return Err(anyhow!(
                "post-restore verification failed: expected {expected_hash}, got {actual}"
            ));
        }

        // Re-apply protection; degradation state may change if the elevation
        // channel came or went since the original protect.
        let (ok, degraded, detail) = self.apply_protection(path).await;
        if !ok {
            return Err(anyhow!(
                "re-protect after restore failed: {}",
                detail.unwrap_or_else(|| "unknown".to_string())
            ));
        }
        if let Some(file) = self.files.lock().get_mut(path) {
            file.degraded = degraded;
        }
        Ok(())
    }
}

fn narrow_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o400))?;
    }
    #[cfg(not(unix))]
    {
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_readonly(true);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

fn restore_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if mode != 0 {
            fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        } else {
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_readonly(false);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}
