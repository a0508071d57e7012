use anyhow::{anyhow, Result};
use argon2::{Argon2, Params};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::LockError;

/// Recovery code format: 4 groups of 4 uppercase alphanumerics,
/// e.g. `7KQ2-MMXA-09RF-ZZC4`. Codes are shown once at vault creation and
/// stored only as salted hashes; each redeems exactly once.
const CODE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const GROUPS_PER_CODE: usize = 4;
const CHARS_PER_GROUP: usize = 4;
pub const CODES_PER_VAULT: usize = 10;

const HASH_SALT_LEN: usize = 16;
const HASH_OUTPUT_LEN: usize = 32;
// Lighter than the master-password KDF: the codes themselves carry ~82 bits
// of entropy.
const HASH_TIME_COST: u32 = 2;
const HASH_MEMORY_COST: u32 = 19_456;
const HASH_PARALLELISM: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryCodeRecord {
    pub salt: String,
    pub hash: String,
    pub used: bool,
    #[serde(default)]
    pub used_at: Option<DateTime<Utc>>,
}

pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    let mut groups = Vec::with_capacity(GROUPS_PER_CODE);
    for _ in 0..GROUPS_PER_CODE {
        let group: String = (0..CHARS_PER_GROUP)
            .map(|_| CODE_CHARS[rng.gen_range(0..CODE_CHARS.len())] as char)
            .collect();
        groups.push(group);
    }
    groups.join("-")
}

pub fn generate_codes(count: usize) -> Vec<String> {
    let mut codes = Vec::with_capacity(count);
    while codes.len() < count {
        let code = generate_code();
        if !codes.contains(&code) {
            codes.push(code);
        }
    }
    codes
}

fn normalize(code: &str) -> String {
    code.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

fn hash_code(code: &str, salt: &[u8]) -> Result<Vec<u8>> {
    let params = Params::new(
        HASH_MEMORY_COST,
        HASH_TIME_COST,
        HASH_PARALLELISM,
        Some(HASH_OUTPUT_LEN),
    )
    .map_err(|e| anyhow!("argon2 params: {e}"))?;
    let argon = Argon2::from(params);
    let mut out = vec![0u8; HASH_OUTPUT_LEN];
    argon
        .hash_password_into(normalize(code).as_bytes(), salt, &mut out)
        .map_err(|e| anyhow!("argon2 hash: {e}"))?;
    Ok(out)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Hash a fresh batch of codes into storable records.
pub fn records_for(codes: &[String]) -> Result<Vec<RecoveryCodeRecord>> {
    let mut records = Vec::with_capacity(codes.len());
    for code in codes {
        let mut salt = [0u8; HASH_SALT_LEN];
        rand::thread_rng().fill(&mut salt);
        let hash = hash_code(code, &salt)?;
        records.push(RecoveryCodeRecord {
            salt: hex::encode(salt),
            hash: hex::encode(hash),
            used: false,
            used_at: None,
        });
    }
    Ok(records)
}

/// Check `candidate` against every unused record; on a match, mark it used
/// and return its index. Used codes never match again.
pub fn redeem(records: &mut [RecoveryCodeRecord], candidate: &str) -> Result<usize, LockError> {
    for (idx, record) in records.iter_mut().enumerate() {
        if record.used {
            continue;
        }
        let salt = match hex::decode(&record.salt) {
            Ok(s) => s,
            Err(_) => continue,
        };
        let stored = match hex::decode(&record.hash) {
            Ok(h) => h,
            Err(_) => continue,
        };
        let computed = hash_code(candidate, &salt).map_err(|_| LockError::InvalidCode)?;
        if constant_time_eq(&computed, &stored) {
            record.used = true;
            record.used_at = Some(Utc::now());
            return Ok(idx);
        }
    }
    Err(LockError::InvalidCode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_format() {
        let code = generate_code();
        assert_eq!(code.len(), 19);
        assert_eq!(code.matches('-').count(), 3);
        assert!(code
            .chars()
            .all(|c| c == '-' || c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn redeem_is_single_use() {
        let codes = generate_codes(3);
        let mut records = records_for(&codes).unwrap();
        let idx = redeem(&mut records, &codes[1]).unwrap();
        assert_eq!(idx, 1);
        assert!(records[1].used);
        // Second redemption of the same code fails.
        assert!(matches!(
            redeem(&mut records, &codes[1]),
            Err(LockError::InvalidCode)
        ));
        // Other codes still work.
        redeem(&mut records, &codes[0]).unwrap();
    }

    #[test]
    fn redeem_normalizes_input() {
        let codes = generate_codes(1);
        let mut records = records_for(&codes).unwrap();
        let sloppy = codes[0].replace('-', " ").to_lowercase();
        redeem(&mut records, &sloppy).unwrap();
    }

    #[test]
    fn unknown_code_rejected() {
        let codes = generate_codes(2);
        let mut records = records_for(&codes).unwrap();
        assert!(matches!(
            redeem(&mut records, "AAAA-BBBB-CCCC-DDDD"),
            Err(LockError::InvalidCode)
        ));
    }
}
