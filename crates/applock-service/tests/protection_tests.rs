//! Integration tests for the file-protection guard and its self-healing
//! watcher, driven through a scripted elevator.

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use applock_core::error::LockError;
use applock_service::elevation::{PathOutcome, PrivilegedOps, Verb};
use applock_service::protection::backup::BackupStore;
use applock_service::protection::{watcher, FileProtectionGuard, RestoreOutcome};

/// Scripted elevator: records every invocation, answers according to its
/// mode, never touches the filesystem.
struct FakeElevator {
    mode: Mode,
    calls: Mutex<Vec<(Verb, Vec<PathBuf>)>>,
}

enum Mode {
    Grant,
    Unavailable,
    Denied,
}

impl FakeElevator {
    fn granting() -> Arc<Self> {
        Arc::new(Self {
            mode: Mode::Grant,
            calls: Mutex::new(vec![]),
        })
    }

    fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            mode: Mode::Unavailable,
            calls: Mutex::new(vec![]),
        })
    }

    fn denying() -> Arc<Self> {
        Arc::new(Self {
            mode: Mode::Denied,
            calls: Mutex::new(vec![]),
        })
    }

    fn count(&self, verb: Verb) -> usize {
        self.calls.lock().iter().filter(|(v, _)| *v == verb).count()
    }
}

#[async_trait]
impl PrivilegedOps for FakeElevator {
    async fn invoke(&self, verb: Verb, paths: &[PathBuf]) -> Result<Vec<PathOutcome>, LockError> {
        self.calls.lock().push((verb, paths.to_vec()));
        match self.mode {
            Mode::Grant => Ok(paths.iter().map(PathOutcome::ok).collect()),
            Mode::Unavailable => Err(LockError::ElevationUnavailable),
            Mode::Denied => Err(LockError::ElevationDenied("prompt dismissed".into())),
        }
    }
}

fn make_guard(dir: &tempfile::TempDir, elevator: Arc<FakeElevator>) -> Arc<FileProtectionGuard> {
    let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
    let store = BackupStore::load_or_create(dir.path().join("backups"), signing_key).unwrap();
    Arc::new(FileProtectionGuard::new(store, elevator))
}

#[tokio::test]
async fn protect_is_idempotent() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("critical.conf");
    fs::write(&file, b"precious").unwrap();

    let elevator = FakeElevator::granting();
    let guard = make_guard(&dir, elevator.clone());

    let first = guard.protect(&[file.clone()]).await;
    assert!(first[0].ok);
    assert!(!first[0].degraded);
    let second = guard.protect(&[file.clone()]).await;
    assert!(second[0].ok);

    // One backup artifact plus the manifest; one elevator call.
    let stored = fs::read_dir(dir.path().join("backups")).unwrap().count();
    assert_eq!(stored, 2);
    assert_eq!(elevator.count(Verb::Protect), 1);
    assert!(guard.is_protected(&file.canonicalize().unwrap()));
}

#[tokio::test]
async fn missing_file_cannot_be_protected() {
    let dir = tempdir().unwrap();
    let guard = make_guard(&dir, FakeElevator::granting());
    let outcomes = guard.protect(&[dir.path().join("ghost.conf")]).await;
    assert!(!outcomes[0].ok);
}

#[tokio::test]
async fn elevation_denied_fails_the_path_visibly() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("critical.conf");
    fs::write(&file, b"precious").unwrap();

    let guard = make_guard(&dir, FakeElevator::denying());
    let outcomes = guard.protect(&[file.clone()]).await;
    assert!(!outcomes[0].ok);
    assert!(outcomes[0].detail.is_some());
    assert!(!guard.is_protected(&file.canonicalize().unwrap()));
}

#[tokio::test]
async fn unavailable_elevation_degrades_and_says_so() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("critical.conf");
    fs::write(&file, b"precious").unwrap();

    let guard = make_guard(&dir, FakeElevator::unavailable());
    let outcomes = guard.protect(&[file.clone()]).await;
    assert!(outcomes[0].ok);
    assert!(outcomes[0].degraded);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o400);
    }
}

#[tokio::test]
async fn deleted_file_is_restored_byte_for_byte() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("critical.conf");
    fs::write(&file, b"original contents").unwrap();

    let guard = make_guard(&dir, FakeElevator::granting());
    let canonical = file.canonicalize().unwrap();
    guard.protect(&[file.clone()]).await;

    fs::remove_file(&file).unwrap();
    assert!(!file.exists());

    let outcome = guard.verify_and_restore(&canonical).await;
    assert!(matches!(outcome, RestoreOutcome::Restored));
    assert_eq!(fs::read(&file).unwrap(), b"original contents");
    assert!(guard.is_protected(&canonical));
}

#[tokio::test]
async fn modified_file_is_restored() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("critical.conf");
    fs::write(&file, b"original contents").unwrap();

    let guard = make_guard(&dir, FakeElevator::granting());
    let canonical = file.canonicalize().unwrap();
    guard.protect(&[file.clone()]).await;

    fs::write(&file, b"RANSOMWARE PAYLOAD").unwrap();
    let outcome = guard.verify_and_restore(&canonical).await;
    assert!(matches!(outcome, RestoreOutcome::Restored));
    assert_eq!(fs::read(&file).unwrap(), b"original contents");
}

#[tokio::test]
async fn intact_file_is_left_alone() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("critical.conf");
    fs::write(&file, b"unchanged").unwrap();

    let guard = make_guard(&dir, FakeElevator::granting());
    let canonical = file.canonicalize().unwrap();
    guard.protect(&[file.clone()]).await;

    let outcome = guard.verify_and_restore(&canonical).await;
    assert!(matches!(outcome, RestoreOutcome::Intact));
}

#[tokio::test]
async fn unprotect_is_idempotent_and_releases() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("critical.conf");
    fs::write(&file, b"precious").unwrap();

    let elevator = FakeElevator::granting();
    let guard = make_guard(&dir, elevator.clone());
    let canonical = file.canonicalize().unwrap();
    guard.protect(&[file.clone()]).await;

    let first = guard.unprotect(&[canonical.clone()]).await;
    assert!(first[0].ok);
    assert!(!guard.is_protected(&canonical));
    let second = guard.unprotect(&[canonical.clone()]).await;
    assert!(second[0].ok);
    assert_eq!(elevator.count(Verb::Unprotect), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn watcher_heals_deletion_within_a_cycle() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("critical.conf");
    fs::write(&file, b"watched contents").unwrap();

    let guard = make_guard(&dir, FakeElevator::granting());
    let canonical = file.canonicalize().unwrap();
    guard.protect(&[file.clone()]).await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let (mut protection_watcher, task) =
        watcher::spawn(guard.clone(), Duration::from_millis(200), shutdown_rx).unwrap();
    protection_watcher.watch(&canonical).unwrap();

    fs::remove_file(&file).unwrap();

    let mut healed = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if file.exists() && fs::read(&file).unwrap() == b"watched contents" {
            healed = true;
            break;
        }
    }
    assert!(healed, "watcher did not restore the deleted file");
    assert!(guard.is_protected(&canonical));

    let _ = shutdown_tx.send(true);
    let _ = task.await;
}
