//! Path-addressed backup store for protected files.
//!
//! One artifact per protected path, deterministically named from the
//! canonical path, plus an Ed25519-signed JSON manifest mapping paths to
//! artifact metadata. The signature is re-verified before every restore so
//! a tampered manifest cannot redirect a restore.

use anyhow::{anyhow, Context, Result};
use blake3::Hasher;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum BackupStoreError {
    #[error("manifest signature invalid")]
    InvalidManifestSignature,
    #[error("backup artifact missing for {0}")]
    ArtifactMissing(String),
    #[error("backup corrupted for {path} - expected {expected}, got {actual}")]
    ArtifactCorrupted {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("path not found in manifest: {0}")]
    PathNotFound(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEntry {
    pub path: String,
    pub artifact: String,
    pub hash: String,
    pub size: u64,
    pub mode: u32,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub entries: HashMap<String, BackupEntry>,
    pub signature: String,
}

pub struct BackupStore {
    root: PathBuf,
    manifest_path: PathBuf,
    manifest: BackupManifest,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl BackupStore {
    /// Load an existing store or create an empty one.
    pub fn load_or_create(root: impl AsRef<Path>, signing_key: SigningKey) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Self::restrict_dir_permissions(&root);
        let manifest_path = root.join("backups.manifest");
        let verifying_key = signing_key.verifying_key();

        let manifest = if manifest_path.exists() {
            let json = fs::read_to_string(&manifest_path)?;
            let manifest: BackupManifest = serde_json::from_str(&json)?;
            Self::verify_manifest_sig(&manifest, &verifying_key)?;
            manifest
        } else {
            let mut manifest = BackupManifest {
                version: MANIFEST_VERSION,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                entries: HashMap::new(),
                signature: String::new(),
            };
            Self::sign_manifest(&mut manifest, &signing_key);
            fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;
            manifest
        };

        Ok(Self {
            root,
            manifest_path,
            manifest,
            signing_key,
            verifying_key,
        })
    }

    pub fn has_entry(&self, path: &Path) -> bool {
        self.manifest.entries.contains_key(&key_for(path))
    }

    pub fn entry_for(&self, path: &Path) -> Option<&BackupEntry> {
        self.manifest.entries.get(&key_for(path))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic artifact name for a canonical path: a digest prefix
    /// plus the original file name, so a human can still tell what is what.
    pub fn artifact_name(path: &Path) -> String {
        let digest = Sha256::digest(key_for(path).as_bytes());
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        format!("{}_{}.bak", hex::encode(&digest[..8]), filename)
    }

    /// Read `path` from disk and store it. Re-storing identical content is a
    /// no-op; changed content replaces the artifact.
    pub fn ensure_from_disk(&mut self, path: &Path) -> Result<BackupEntry> {
        let mut file =
            File::open(path).with_context(|| format!("open {}", path.display()))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        let mode = file_mode(path);
        let hash = blake3_hex(&data);

        let key = key_for(path);
        if let Some(existing) = self.manifest.entries.get(&key) {
            if existing.hash == hash {
                return Ok(existing.clone());
            }
        }

        let artifact = Self::artifact_name(path);
        let artifact_path = self.root.join(&artifact);
        self.write_artifact_atomic(&artifact_path, &data)?;

        let entry = BackupEntry {
            path: key.clone(),
            artifact,
            hash,
            size: data.len() as u64,
            mode,
            stored_at: Utc::now(),
        };
        self.manifest.entries.insert(key, entry.clone());
        self.manifest.updated_at = Utc::now();
        Self::sign_manifest(&mut self.manifest, &self.signing_key);
        self.persist_manifest()?;
        Ok(entry)
    }

    /// Read the artifact for `path`, verifying the manifest signature and
    /// the artifact content hash. Use before every restore.
    pub fn read_verified(&self, path: &Path) -> Result<Vec<u8>> {
        Self::verify_manifest_sig(&self.manifest, &self.verifying_key)
            .context("manifest check failed before restore")?;
        let key = key_for(path);
        let entry = self
            .manifest
            .entries
            .get(&key)
            .ok_or_else(|| BackupStoreError::PathNotFound(key.clone()))?;
        let artifact_path = self.root.join(&entry.artifact);
        if !artifact_path.exists() {
            return Err(anyhow!(BackupStoreError::ArtifactMissing(key)));
        }
        let data = fs::read(&artifact_path)?;
        let actual = blake3_hex(&data);
        if actual != entry.hash {
            return Err(anyhow!(BackupStoreError::ArtifactCorrupted {
                path: key,
                expected: entry.hash.clone(),
                actual,
            }));
        }
        Ok(data)
    }

    pub fn remove_entry(&mut self, path: &Path) {
        let key = key_for(path);
        if let Some(entry) = self.manifest.entries.remove(&key) {
            let _ = fs::remove_file(self.root.join(&entry.artifact));
            self.manifest.updated_at = Utc::now();
            Self::sign_manifest(&mut self.manifest, &self.signing_key);
            if let Err(e) = self.persist_manifest() {
                warn!(error = %e, "manifest persist failed after removal");
            }
        }
    }

    // ── internals ───────────────────────────────────────────────────────────

    fn write_artifact_atomic(&self, dest: &Path, bytes: &[u8]) -> Result<()> {
        let mut staging = tempfile::NamedTempFile::new_in(&self.root)?;
        staging.write_all(bytes)?;
        staging.as_file().sync_all()?;
        staging
            .persist(dest)
            .map_err(|e| anyhow!("replace {}: {}", dest.display(), e.error))?;
        Self::fsync_dir(&self.root);
        Ok(())
    }

    fn sign_manifest(manifest: &mut BackupManifest, signing_key: &SigningKey) {
        let canonical = Self::canonical_manifest_bytes(&manifest.entries);
        let signature = signing_key.sign(&canonical);
        manifest.signature = hex::encode(signature.to_bytes());
    }

    fn verify_manifest_sig(manifest: &BackupManifest, verifying_key: &VerifyingKey) -> Result<()> {
        let canonical = Self::canonical_manifest_bytes(&manifest.entries);
        let sig_bytes = hex::decode(&manifest.signature).context("decode manifest signature")?;
        let signature = Signature::from_bytes(
            sig_bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow!("invalid signature length"))?,
        );
        verifying_key
            .verify(&canonical, &signature)
            .map_err(|_| anyhow!(BackupStoreError::InvalidManifestSignature))
    }

    fn canonical_manifest_bytes(entries: &HashMap<String, BackupEntry>) -> Vec<u8> {
        let mut keys: Vec<&String> = entries.keys().collect();
        keys.sort();
        let mut hasher = Sha256::new();
        for key in keys {
            let entry = &entries[key];
            hasher.update(entry.path.as_bytes());
            hasher.update(b"|");
            hasher.update(entry.artifact.as_bytes());
            hasher.update(b"|");
            hasher.update(entry.hash.as_bytes());
            hasher.update(b"|");
            hasher.update(entry.size.to_le_bytes());
            hasher.update(entry.mode.to_le_bytes());
            hasher.update(b"\n");
        }
        hasher.finalize().to_vec()
    }

    fn persist_manifest(&self) -> Result<()> {
        fs::write(&self.manifest_path, serde_json::to_string_pretty(&self.manifest)?)?;
        Ok(())
    }

    fn restrict_dir_permissions(path: &Path) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
                warn!("cannot restrict permissions on {}: {}", path.display(), e);
            }
        }
    }

    fn fsync_dir(path: &Path) {
        #[cfg(unix)]
        {
            if let Ok(dir) = fs::OpenOptions::new().read(true).open(path) {
                let _ = dir.sync_all();
            }
        }
        #[cfg(not(unix))]
        let _ = path;
    }
}

fn key_for(path: &Path) -> String {
    path.display().to_string()
}

fn file_mode(path: &Path) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path).map(|m| m.permissions().mode()).unwrap_or(0)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        0
    }
}

/// Compute the BLAKE3 hex digest of `data`.
pub fn blake3_hex(data: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize().to_hex().to_string()
}

/// Streaming BLAKE3 of a file on disk.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut f = File::open(path)?;
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn signing_key() -> SigningKey {
        SigningKey::generate(&mut rand::rngs::OsRng)
    }

    #[test]
    fn store_and_read_back() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("critical.conf");
        fs::write(&source, b"important bytes").unwrap();

        let mut store = BackupStore::load_or_create(dir.path().join("backups"), signing_key()).unwrap();
        let entry = store.ensure_from_disk(&source).unwrap();
        assert_eq!(entry.size, 15);
        assert_eq!(store.read_verified(&source).unwrap(), b"important bytes");
    }

    #[test]
    fn restore_is_deterministic_and_idempotent() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("critical.conf");
        fs::write(&source, b"same").unwrap();

        let mut store = BackupStore::load_or_create(dir.path().join("backups"), signing_key()).unwrap();
        let first = store.ensure_from_disk(&source).unwrap();
        let second = store.ensure_from_disk(&source).unwrap();
        assert_eq!(first.artifact, second.artifact);
        assert_eq!(first.hash, second.hash);
        // Exactly one artifact plus the manifest in the store directory.
        let files = fs::read_dir(dir.path().join("backups")).unwrap().count();
        assert_eq!(files, 2);
    }

    #[test]
    fn tampered_artifact_detected() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("critical.conf");
        fs::write(&source, b"original").unwrap();

        let mut store = BackupStore::load_or_create(dir.path().join("backups"), signing_key()).unwrap();
        let entry = store.ensure_from_disk(&source).unwrap();
        fs::write(dir.path().join("backups").join(&entry.artifact), b"evil").unwrap();
        assert!(store.read_verified(&source).is_err());
    }

    #[test]
    fn tampered_manifest_rejected_on_load() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("critical.conf");
        fs::write(&source, b"original").unwrap();
        let key = signing_key();

        let backups = dir.path().join("backups");
        {
            let mut store = BackupStore::load_or_create(&backups, key.clone()).unwrap();
            store.ensure_from_disk(&source).unwrap();
        }
        let manifest_path = backups.join("backups.manifest");
        let mut manifest: BackupManifest =
            serde_json::from_str(&fs::read_to_string(&manifest_path).unwrap()).unwrap();
        for entry in manifest.entries.values_mut() {
            entry.hash = blake3_hex(b"forged");
        }
        fs::write(&manifest_path, serde_json::to_string_pretty(&manifest).unwrap()).unwrap();

        assert!(BackupStore::load_or_create(&backups, key).is_err());
    }
}
