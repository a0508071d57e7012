use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;
use zeroize::Zeroizing;

use crate::crypto::{
    check_verifier, compute_verifier, decrypt, derive_key_with, encrypt, generate_nonce,
    generate_salt, KDF_MEMORY_COST, KDF_PARALLELISM, KDF_TIME_COST,
};
use crate::error::LockError;
use crate::recovery::{self, RecoveryCodeRecord, CODES_PER_VAULT};
use crate::registry::AppRegistry;

pub const RECORD_MAGIC: &[u8] = b"ALCK01\0\0";
pub const RECORD_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 96;

/// Fixed binary prefix of the credential record. Everything needed to derive
/// the key and frame the rest of the file, nothing secret.
#[derive(Debug, Clone)]
pub struct RecordHeader {
    pub format_version: u32,
    pub kdf_time_cost: u32,
    pub kdf_memory_cost: u32,
    pub kdf_parallelism: u32,
    pub salt: [u8; 32],
    pub nonce: [u8; 24],
    pub meta_len: u32,
}

impl RecordHeader {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; HEADER_SIZE];
        buf[..RECORD_MAGIC.len()].copy_from_slice(RECORD_MAGIC);
        buf[8..12].copy_from_slice(&self.format_version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.kdf_time_cost.to_le_bytes());
        buf[16..20].copy_from_slice(&self.kdf_memory_cost.to_le_bytes());
        buf[20..24].copy_from_slice(&self.kdf_parallelism.to_le_bytes());
        buf[24..56].copy_from_slice(&self.salt);
        buf[56..80].copy_from_slice(&self.nonce);
        buf[80..84].copy_from_slice(&self.meta_len.to_le_bytes());
        // remaining bytes stay zero
        Ok(buf)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != HEADER_SIZE {
            return Err(anyhow!("invalid header size"));
        }
        if &buf[..RECORD_MAGIC.len()] != RECORD_MAGIC {
            return Err(anyhow!("invalid magic"));
        }
        let format_version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if format_version != RECORD_VERSION {
            return Err(anyhow!("record version mismatch"));
        }
        Ok(Self {
            format_version,
            kdf_time_cost: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            kdf_memory_cost: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            kdf_parallelism: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            salt: buf[24..56].try_into().unwrap(),
            nonce: buf[56..80].try_into().unwrap(),
            meta_len: u32::from_le_bytes(buf[80..84].try_into().unwrap()),
        })
    }
}

/// Plaintext metadata between header and ciphertext: the password verifier
/// and the hashed recovery codes. Readable without the password so recovery
/// works when the password is lost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMeta {
    pub verifier: String,
    #[serde(default)]
    pub recovery: Vec<RecoveryCodeRecord>,
}

/// Proof that a recovery code was just redeemed; required by
/// [`CredentialVault::reset_with_grant`]. Cannot be constructed elsewhere.
pub struct RecoveryGrant(());

/// The master credential record plus the encrypted application registry.
///
/// Exactly one record exists per installation. It is never silently
/// regenerated: resetting requires either explicit deletion plus a fresh
/// `create`, or redemption of a recovery code.
#[derive(Debug)]
pub struct CredentialVault {
    path: PathBuf,
    backup_path: PathBuf,
    header: RecordHeader,
    meta: RecordMeta,
    password: Option<Zeroizing<String>>,
    key: Option<Zeroizing<Vec<u8>>>,
}

impl CredentialVault {
    pub fn is_initialized(path: &Path) -> bool {
        path.exists()
    }

    /// Create a fresh vault: new salt and KDF parameters, verifier, an empty
    /// registry (with a fresh manifest signing key) and a batch of recovery
    /// codes. The plaintext codes are returned exactly once.
    pub fn create(
        path: &Path,
        backup_path: &Path,
        password: &str,
    ) -> Result<(Self, Vec<String>)> {
        if path.exists() {
            return Err(LockError::AlreadyInitialized(path.to_path_buf()).into());
        }
        let salt = generate_salt();
        let nonce = generate_nonce();
        let key = derive_key_with(password, &salt, KDF_TIME_COST, KDF_MEMORY_COST, KDF_PARALLELISM)?;
        let verifier = compute_verifier(&key)?;

        let signing_key = SigningKey::generate(&mut chacha20poly1305::aead::OsRng);
        let registry = AppRegistry::new(general_purpose::STANDARD.encode(signing_key.to_bytes()));

        let codes = recovery::generate_codes(CODES_PER_VAULT);
        let meta = RecordMeta {
            verifier: hex::encode(verifier),
            recovery: recovery::records_for(&codes)?,
        };

        let plaintext = serde_json::to_vec(&registry)?;
        let ciphertext = encrypt(&key, &nonce, &plaintext)?;
        let meta_bytes = serde_json::to_vec(&meta)?;
        let header = RecordHeader {
            format_version: RECORD_VERSION,
            kdf_time_cost: KDF_TIME_COST,
            kdf_memory_cost: KDF_MEMORY_COST,
            kdf_parallelism: KDF_PARALLELISM,
            salt,
            nonce,
            meta_len: meta_bytes.len() as u32,
        };

        let vault = Self {
            path: path.to_path_buf(),
            backup_path: backup_path.to_path_buf(),
            header,
            meta,
            password: Some(Zeroizing::new(password.to_string())),
            key: Some(key),
        };
        vault.persist(&ciphertext)?;
        Ok((vault, codes))
    }

    /// Open an existing record. Only the header and plaintext metadata are
    /// read; `verify` must succeed before the registry can be unlocked.
    pub fn open(path: &Path, backup_path: &Path) -> Result<Self> {
        let (header, meta, _ciphertext) = parse_record(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            backup_path: backup_path.to_path_buf(),
            header,
            meta,
            password: None,
            key: None,
        })
    }

    fn check(&self, candidate: &str) -> Result<Zeroizing<Vec<u8>>, LockError> {
        let key = derive_key_with(
            candidate,
            &self.header.salt,
            self.header.kdf_time_cost,
            self.header.kdf_memory_cost,
            self.header.kdf_parallelism,
        )
        .map_err(|_| LockError::AuthFailed)?;
        let stored = hex::decode(&self.meta.verifier).map_err(|_| LockError::AuthFailed)?;
        if check_verifier(&key, &stored) {
            Ok(key)
        } else {
            Err(LockError::AuthFailed)
        }
    }

    /// Constant-time password verification. Succeeding caches the session
    /// key; failing reveals nothing and mutates nothing.
    pub fn verify(&mut self, candidate: &str) -> Result<(), LockError> {
        let key = self.check(candidate)?;
        self.key = Some(key);
        self.password = Some(Zeroizing::new(candidate.to_string()));
        Ok(())
    }

    /// Decrypt the registry. Requires a prior successful `verify`. If the
    /// primary record fails its authentication tag, the backup copy is
    /// consulted before the failure surfaces.
    pub fn unlock(&self) -> Result<AppRegistry, LockError> {
        let password = self.password.as_ref().ok_or(LockError::AuthFailed)?;
        match unlock_from(&self.path, password) {
            Ok(registry) => Ok(registry),
            Err(primary_err) => {
                warn!(
                    path = %self.path.display(),
                    error = %primary_err,
                    "primary vault record failed integrity check, trying backup copy"
                );
                unlock_from(&self.backup_path, password).map_err(|_| {
                    LockError::IntegrityCheckFailed(primary_err.to_string())
                })
            }
        }
    }

    /// Re-encrypt and persist the registry under the session key with a
    /// fresh nonce. Also refreshes the backup copy.
    pub fn save_registry(&mut self, registry: &mut AppRegistry) -> Result<(), LockError> {
        let key = self.key.as_ref().ok_or(LockError::AuthFailed)?;
        registry.last_modified = chrono::Utc::now();
        let plaintext =
            serde_json::to_vec(registry).map_err(|e| LockError::file_op(&self.path, e))?;
        // Fresh nonce on every save to prevent XChaCha20-Poly1305 nonce reuse.
        self.header.nonce = generate_nonce();
        let ciphertext =
            encrypt(key, &self.header.nonce, &plaintext).map_err(|e| LockError::file_op(&self.path, e))?;
        self.persist(&ciphertext)
            .map_err(|e| LockError::file_op(&self.path, e))
    }

    /// Change the master password. The record is rewritten atomically; a
    /// wrong `old` leaves it untouched.
    pub fn change_password(&mut self, old: &str, new: &str) -> Result<(), LockError> {
        let old_key = self.check(old).map_err(|_| LockError::InvalidCredential)?;
        let (on_disk, _, ciphertext) =
            parse_record(&self.path).map_err(|e| LockError::IntegrityCheckFailed(e.to_string()))?;
        let plaintext = decrypt(&old_key, &on_disk.nonce, &ciphertext)
            .map_err(|e| LockError::IntegrityCheckFailed(e.to_string()))?;

        let salt = generate_salt();
        let nonce = generate_nonce();
        let new_key = derive_key_with(new, &salt, KDF_TIME_COST, KDF_MEMORY_COST, KDF_PARALLELISM)
            .map_err(|e| LockError::file_op(&self.path, e))?;
        let verifier = compute_verifier(&new_key).map_err(|e| LockError::file_op(&self.path, e))?;
        let new_ciphertext =
            encrypt(&new_key, &nonce, &plaintext).map_err(|e| LockError::file_op(&self.path, e))?;

        self.header.salt = salt;
        self.header.nonce = nonce;
        self.header.kdf_time_cost = KDF_TIME_COST;
        self.header.kdf_memory_cost = KDF_MEMORY_COST;
        self.header.kdf_parallelism = KDF_PARALLELISM;
        self.meta.verifier = hex::encode(verifier);
        self.key = Some(new_key);
        self.password = Some(Zeroizing::new(new.to_string()));

        self.persist(&new_ciphertext)
            .map_err(|e| LockError::file_op(&self.path, e))
    }

    /// Validate a recovery code, burn it, and return a grant for
    /// `reset_with_grant`. The used flag is persisted immediately so the
    /// code cannot redeem twice even across restarts.
    pub fn redeem_recovery_code(&mut self, code: &str) -> Result<RecoveryGrant, LockError> {
        recovery::redeem(&mut self.meta.recovery, code)?;
        let (_, _, ciphertext) =
            parse_record(&self.path).map_err(|e| LockError::IntegrityCheckFailed(e.to_string()))?;
        self.persist(&ciphertext)
            .map_err(|e| LockError::file_op(&self.path, e))?;
        Ok(RecoveryGrant(()))
    }

    /// Replace the record with a fresh vault under a new password. The old
    /// registry is unrecoverable without the old key; a new one is created.
    pub fn reset_with_grant(
        self,
        _grant: RecoveryGrant,
        new_password: &str,
    ) -> Result<(Self, Vec<String>)> {
        fs::remove_file(&self.path)
            .with_context(|| format!("remove old record {}", self.path.display()))?;
        if self.backup_path.exists() {
            let _ = fs::remove_file(&self.backup_path);
        }
        Self::create(&self.path, &self.backup_path, new_password)
    }

    fn persist(&self, ciphertext: &[u8]) -> Result<()> {
        let meta_bytes = serde_json::to_vec(&self.meta)?;
        let mut header = self.header.clone();
        header.meta_len = meta_bytes.len() as u32;
        let mut record = header.to_bytes()?;
        record.extend_from_slice(&meta_bytes);
        record.extend_from_slice(ciphertext);
        write_atomic(&self.path, &record)?;
        if let Some(parent) = self.backup_path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&self.backup_path, &record)?;
        Ok(())
    }
}

fn parse_record(path: &Path) -> Result<(RecordHeader, RecordMeta, Vec<u8>)> {
    let mut file = File::open(path).with_context(|| format!("open record {}", path.display()))?;
    let mut header_buf = [0u8; HEADER_SIZE];
    file.read_exact(&mut header_buf)?;
    let header = RecordHeader::from_bytes(&header_buf)?;
    let mut meta_buf = vec![0u8; header.meta_len as usize];
    file.read_exact(&mut meta_buf)?;
    let meta: RecordMeta =
        serde_json::from_slice(&meta_buf).map_err(|e| anyhow!("parse record metadata: {e}"))?;
    let mut ciphertext = Vec::new();
    file.read_to_end(&mut ciphertext)?;
    Ok((header, meta, ciphertext))
}

fn unlock_from(path: &Path, password: &str) -> Result<AppRegistry, LockError> {
    let (header, meta, ciphertext) =
        parse_record(path).map_err(|e| LockError::IntegrityCheckFailed(e.to_string()))?;
    let key = derive_key_with(
        password,
        &header.salt,
        header.kdf_time_cost,
        header.kdf_memory_cost,
        header.kdf_parallelism,
    )
    .map_err(|_| LockError::AuthFailed)?;
    let stored = hex::decode(&meta.verifier).map_err(|_| LockError::AuthFailed)?;
    if !check_verifier(&key, &stored) {
        return Err(LockError::AuthFailed);
    }
    let plaintext = decrypt(&key, &header.nonce, &ciphertext)
        .map_err(|e| LockError::IntegrityCheckFailed(e.to_string()))?;
    serde_json::from_slice(&plaintext).map_err(|e| LockError::IntegrityCheckFailed(e.to_string()))
}

/// Crash-safe write: stage in the target directory, fsync, rename over the
/// destination, fsync the directory entry.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("no parent directory for {}", path.display()))?;
    fs::create_dir_all(parent)?;
    let mut staging = tempfile::NamedTempFile::new_in(parent)?;
    staging.write_all(bytes)?;
    staging.as_file().sync_all()?;
    staging
        .persist(path)
        .map_err(|e| anyhow!("replace {}: {}", path.display(), e.error))?;
    #[cfg(unix)]
    {
        if let Ok(dir) = fs::OpenOptions::new().read(true).open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LockedApplication;
    use tempfile::tempdir;

    fn vault_paths(dir: &tempfile::TempDir) -> (PathBuf, PathBuf) {
        (
            dir.path().join("vault.dat"),
            dir.path().join("backups").join("vault.dat.bak"),
        )
    }

    #[test]
    fn create_verify_unlock_roundtrip() {
        let dir = tempdir().unwrap();
        let (path, backup) = vault_paths(&dir);
        let (vault, codes) = CredentialVault::create(&path, &backup, "correct horse").unwrap();
        assert_eq!(codes.len(), CODES_PER_VAULT);
        let registry = vault.unlock().unwrap();
        assert!(registry.apps.is_empty());
        assert!(!registry.signing_key.is_empty());

        let mut reopened = CredentialVault::open(&path, &backup).unwrap();
        reopened.verify("correct horse").unwrap();
        reopened.unlock().unwrap();
    }

    #[test]
    fn create_twice_fails() {
        let dir = tempdir().unwrap();
        let (path, backup) = vault_paths(&dir);
        CredentialVault::create(&path, &backup, "pw-one-long-enough").unwrap();
        let err = CredentialVault::create(&path, &backup, "pw-two-long-enough").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LockError>(),
            Some(LockError::AlreadyInitialized(_))
        ));
    }

    #[test]
    fn wrong_password_fails_and_mutates_nothing() {
        let dir = tempdir().unwrap();
        let (path, backup) = vault_paths(&dir);
        CredentialVault::create(&path, &backup, "right password").unwrap();
        let before = fs::read(&path).unwrap();

        let mut vault = CredentialVault::open(&path, &backup).unwrap();
        for _ in 0..3 {
            assert!(matches!(
                vault.verify("wrong password"),
                Err(LockError::AuthFailed)
            ));
        }
        assert_eq!(fs::read(&path).unwrap(), before);
        vault.verify("right password").unwrap();
    }

    #[test]
    fn change_password_roundtrips_registry() {
        let dir = tempdir().unwrap();
        let (path, backup) = vault_paths(&dir);
        let (mut vault, _) = CredentialVault::create(&path, &backup, "old password").unwrap();

        let mut registry = vault.unlock().unwrap();
        registry.add_app(LockedApplication::new("calc", None));
        vault.save_registry(&mut registry).unwrap();

        vault.change_password("old password", "new password").unwrap();

        let mut reopened = CredentialVault::open(&path, &backup).unwrap();
        assert!(matches!(
            reopened.verify("old password"),
            Err(LockError::AuthFailed)
        ));
        reopened.verify("new password").unwrap();
        let after = reopened.unlock().unwrap();
        assert_eq!(after.apps.len(), 1);
        assert_eq!(after.apps[0].name, "calc");
        assert_eq!(after.apps[0].id, registry.apps[0].id);
    }

    #[test]
    fn change_password_with_wrong_old_leaves_record_untouched() {
        let dir = tempdir().unwrap();
        let (path, backup) = vault_paths(&dir);
        let (mut vault, _) = CredentialVault::create(&path, &backup, "the password").unwrap();
        let before = fs::read(&path).unwrap();
        assert!(matches!(
            vault.change_password("not it", "whatever"),
            Err(LockError::InvalidCredential)
        ));
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn corrupted_primary_falls_back_to_backup() {
        let dir = tempdir().unwrap();
        let (path, backup) = vault_paths(&dir);
        let (mut vault, _) = CredentialVault::create(&path, &backup, "the password").unwrap();
        let mut registry = vault.unlock().unwrap();
        registry.add_app(LockedApplication::new("editor", None));
        vault.save_registry(&mut registry).unwrap();

        // Flip a ciphertext byte in the primary record only.
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let recovered = vault.unlock().unwrap();
        assert_eq!(recovered.apps.len(), 1);
        assert_eq!(recovered.apps[0].name, "editor");
    }

    #[test]
    fn recovery_code_resets_vault_once() {
        let dir = tempdir().unwrap();
        let (path, backup) = vault_paths(&dir);
        let (_, codes) = CredentialVault::create(&path, &backup, "forgotten").unwrap();

        let mut vault = CredentialVault::open(&path, &backup).unwrap();
        let grant = vault.redeem_recovery_code(&codes[0]).unwrap();

        // The used flag is already durable: a second redemption fails even
        // on a freshly opened record.
        let mut again = CredentialVault::open(&path, &backup).unwrap();
        assert!(matches!(
            again.redeem_recovery_code(&codes[0]),
            Err(LockError::InvalidCode)
        ));

        let (mut fresh, new_codes) = vault.reset_with_grant(grant, "brand new pw").unwrap();
        assert_eq!(new_codes.len(), CODES_PER_VAULT);
        fresh.verify("brand new pw").unwrap();
        assert!(fresh.unlock().unwrap().apps.is_empty());
    }

    #[test]
    fn bogus_recovery_code_rejected() {
        let dir = tempdir().unwrap();
        let (path, backup) = vault_paths(&dir);
        CredentialVault::create(&path, &backup, "some password").unwrap();
        let mut vault = CredentialVault::open(&path, &backup).unwrap();
        assert!(matches!(
            vault.redeem_recovery_code("0000-0000-0000-0000"),
            Err(LockError::InvalidCode)
        ));
    }
}
