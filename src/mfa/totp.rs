//! TOTP and backup-code primitives

use crate::error::AppError;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use totp_rs::{Algorithm, Secret, TOTP};

pub const TOTP_DIGITS: usize = 6;
pub const TOTP_STEP: u64 = 30;
/// Accepted clock drift, in steps
pub const TOTP_SKEW: u8 = 1;
pub const SECRET_LEN: usize = 20;

pub const BACKUP_CODE_COUNT: usize = 10;
pub const BACKUP_CODE_LEN: usize = 8;
const BACKUP_CODE_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Fresh random shared secret, base32 encoded
pub fn generate_secret() -> String {
    let mut bytes = vec![0u8; SECRET_LEN];
    rand::thread_rng().fill(&mut bytes[..]);
    Secret::Raw(bytes).to_encoded().to_string()
}

pub fn build_totp(secret_base32: &str, issuer: &str, account: &str) -> Result<TOTP, AppError> {
    let secret = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .map_err(|e| AppError::Internal(format!("Invalid TOTP secret encoding: {:?}", e)))?;

    TOTP::new(
        Algorithm::SHA1,
        TOTP_DIGITS,
        TOTP_SKEW,
        TOTP_STEP,
        secret,
        Some(issuer.to_string()),
        account.to_string(),
    )
    .map_err(|e| AppError::Internal(format!("TOTP init error: {}", e)))
}

/// `otpauth://` URI for authenticator apps
pub fn enrollment_uri(secret_base32: &str, issuer: &str, account: &str) -> Result<String, AppError> {
    Ok(build_totp(secret_base32, issuer, account)?.get_url())
}

/// Check a 6-digit code at `unix_time`, tolerating one step of drift either way
pub fn check_code(totp: &TOTP, code: &str, unix_time: u64) -> bool {
    code.len() == TOTP_DIGITS && code.bytes().all(|b| b.is_ascii_digit()) && totp.check(code, unix_time)
}

/// Exactly `BACKUP_CODE_COUNT` distinct codes
pub fn generate_backup_codes() -> Vec<String> {
    let mut rng = rand::thread_rng();
    let mut seen = HashSet::with_capacity(BACKUP_CODE_COUNT);
    let mut codes = Vec::with_capacity(BACKUP_CODE_COUNT);

    while codes.len() < BACKUP_CODE_COUNT {
        let code: String = (0..BACKUP_CODE_LEN)
            .map(|_| BACKUP_CODE_CHARSET[rng.gen_range(0..BACKUP_CODE_CHARSET.len())] as char)
            .collect();
        if seen.insert(code.clone()) {
            codes.push(code);
        }
    }

    codes
}

/// Backup codes match exactly as issued
pub fn hash_backup_code(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}
