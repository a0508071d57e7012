use anyhow::{anyhow, Result};
use argon2::{Argon2, Params};
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

pub const KDF_TIME_COST: u32 = 3;
pub const KDF_MEMORY_COST: u32 = 65536; // 64MB
pub const KDF_PARALLELISM: u32 = 4;
pub const DERIVED_KEY_LEN: usize = 32;

/// Domain separator mixed into the password verifier so the stored value can
/// never double as the payload key.
const VERIFIER_CONTEXT: &[u8] = b"applock.password.verifier.v1";

pub fn derive_key(password: &str, salt: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    derive_key_with(
        password,
        salt,
        KDF_TIME_COST,
        KDF_MEMORY_COST,
        KDF_PARALLELISM,
    )
}

/// Derivation with explicit cost parameters, used when reopening a record
/// whose header may carry older costs than the current defaults.
pub fn derive_key_with(
    password: &str,
    salt: &[u8],
    time_cost: u32,
    memory_cost: u32,
    parallelism: u32,
) -> Result<Zeroizing<Vec<u8>>> {
    let params = Params::new(memory_cost, time_cost, parallelism, Some(DERIVED_KEY_LEN))
        .map_err(|e| anyhow!("argon2 params: {e}"))?;
    let argon = Argon2::from(params);
    let mut key = Zeroizing::new(vec![0u8; DERIVED_KEY_LEN]);
    argon
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| anyhow!("argon2 derive: {e}"))?;
    Ok(key)
}

/// Compute the stored password verifier for a derived key.
pub fn compute_verifier(key: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        <Hmac::<Sha256> as Mac>::new_from_slice(key).map_err(|e| anyhow!("verifier mac init: {e}"))?;
    mac.update(VERIFIER_CONTEXT);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Constant-time check of a candidate key against the stored verifier.
pub fn check_verifier(key: &[u8], stored: &[u8]) -> bool {
    let mut mac = match <Hmac::<Sha256> as Mac>::new_from_slice(key) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(VERIFIER_CONTEXT);
    mac.verify_slice(stored).is_ok()
}

pub fn encrypt(key: &[u8], nonce: &[u8; 24], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = XNonce::from_slice(nonce);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| anyhow!("encrypt: {e}"))?;
    Ok(ciphertext)
}

pub fn decrypt(key: &[u8], nonce: &[u8; 24], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = XNonce::from_slice(nonce);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| anyhow!("decrypt: {e}"))?;
    Ok(plaintext)
}

pub fn generate_nonce() -> [u8; 24] {
    let mut nonce = [0u8; 24];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn generate_salt() -> [u8; 32] {
    let mut salt = [0u8; 32];
    OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let salt = generate_salt();
        let nonce = generate_nonce();
        let key = derive_key("hunter2hunter2", &salt).unwrap();
        let ct = encrypt(&key, &nonce, b"payload").unwrap();
        assert_eq!(decrypt(&key, &nonce, &ct).unwrap(), b"payload");
    }

    #[test]
    fn verifier_matches_only_same_key() {
        let salt = generate_salt();
        let key = derive_key("correct horse", &salt).unwrap();
        let other = derive_key("wrong pony", &salt).unwrap();
        let verifier = compute_verifier(&key).unwrap();
        assert!(check_verifier(&key, &verifier));
        assert!(!check_verifier(&other, &verifier));
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let salt = generate_salt();
        let nonce = generate_nonce();
        let key = derive_key("hunter2hunter2", &salt).unwrap();
        let mut ct = encrypt(&key, &nonce, b"payload").unwrap();
        ct[0] ^= 0xff;
        assert!(decrypt(&key, &nonce, &ct).is_err());
    }
}
