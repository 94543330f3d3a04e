//! MFA manager: enrollment, verification, enable/disable

use super::totp;
use crate::{
    auth::password::PasswordHasher,
    error::AppError,
    repository::AccountRepository,
    store::{Store, StoreError},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MFA_PREFIX: &str = "mfa:";
/// Bound on retries when a concurrent backup-code removal changes the list
const MAX_CONSUME_ATTEMPTS: usize = 8;

/// Stored per-user second factor. Backup codes are kept as SHA-256 hashes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MfaCredential {
    pub user_id: Uuid,
    pub secret: String,
    pub backup_codes: Vec<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub enabled_at: Option<DateTime<Utc>>,
}

/// Returned once at enrollment; the plaintext codes are never stored
#[derive(Debug, Clone, Serialize)]
pub struct MfaEnrollment {
    pub secret: String,
    pub enrollment_uri: String,
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MfaVerification {
    pub is_valid: bool,
    pub is_backup_code: bool,
}

impl MfaVerification {
    pub const INVALID: Self = Self {
        is_valid: false,
        is_backup_code: false,
    };

    const TOTP: Self = Self {
        is_valid: true,
        is_backup_code: false,
    };

    const BACKUP: Self = Self {
        is_valid: true,
        is_backup_code: true,
    };
}

pub struct MfaService {
    store: Store,
    accounts: AccountRepository,
    hasher: PasswordHasher,
    issuer: String,
}

impl MfaService {
    pub fn new(
        store: Store,
        accounts: AccountRepository,
        hasher: PasswordHasher,
        issuer: impl Into<String>,
    ) -> Self {
        Self {
            store,
            accounts,
            hasher,
            issuer: issuer.into(),
        }
    }

    fn key(user_id: &Uuid) -> String {
        format!("{MFA_PREFIX}{user_id}")
    }

    async fn credential(&self, user_id: &Uuid) -> Result<Option<MfaCredential>, StoreError> {
        self.store.get(&Self::key(user_id)).await
    }

    /// Start (or restart) enrollment. An existing enrollment that was never
    /// enabled is replaced; an enabled one must be disabled first.
    pub async fn enroll(&self, user_id: &Uuid, account_label: &str) -> Result<MfaEnrollment, AppError> {
        let secret = totp::generate_secret();
        let enrollment_uri = totp::enrollment_uri(&secret, &self.issuer, account_label)?;
        let backup_codes = totp::generate_backup_codes();

        let credential = MfaCredential {
            user_id: *user_id,
            secret: secret.clone(),
            backup_codes: backup_codes.iter().map(|c| totp::hash_backup_code(c)).collect(),
            enabled: false,
            created_at: Utc::now(),
            enabled_at: None,
        };

        let key = Self::key(user_id);
        match self.credential(user_id).await? {
            Some(existing) if existing.enabled => {
                return Err(AppError::validation("MFA is already enabled"));
            }
            Some(_) => {
                let replaced = self
                    .store
                    .update_if(&key, |current: &MfaCredential| !current.enabled, &credential)
                    .await?;
                if !replaced {
                    return Err(AppError::validation("MFA is already enabled"));
                }
            }
            None => self.store.put(&key, &credential, None).await?,
        }

        tracing::info!(user_id = %user_id, "MFA enrollment started");
        Ok(MfaEnrollment {
            secret,
            enrollment_uri,
            backup_codes,
        })
    }

    /// Verify a code. Backup codes are tried first and consumed on success;
    /// otherwise the code is checked as TOTP.
    pub async fn verify(&self, user_id: &Uuid, code: &str) -> Result<MfaVerification, AppError> {
        self.verify_at(user_id, code, Utc::now().timestamp() as u64)
            .await
    }

    pub(crate) async fn verify_at(
        &self,
        user_id: &Uuid,
        code: &str,
        unix_time: u64,
    ) -> Result<MfaVerification, AppError> {
        let Some(credential) = self.credential(user_id).await? else {
            return Ok(MfaVerification::INVALID);
        };
        if credential.secret.is_empty() {
            return Ok(MfaVerification::INVALID);
        }

        let code_hash = totp::hash_backup_code(code);
        if credential.backup_codes.contains(&code_hash)
            && self.consume_backup_code(user_id, &code_hash).await?
        {
            tracing::info!(user_id = %user_id, "Backup code consumed");
            return Ok(MfaVerification::BACKUP);
        }

        let totp = totp::build_totp(&credential.secret, &self.issuer, &user_id.to_string())?;
        if totp::check_code(&totp, code.trim(), unix_time) {
            return Ok(MfaVerification::TOTP);
        }

        tracing::debug!(user_id = %user_id, "MFA code rejected");
        Ok(MfaVerification::INVALID)
    }

    /// Remove one backup code. The write only lands if the stored list is still
    /// exactly what was read, so two racing submissions of the same code cannot
    /// both succeed and a concurrent removal of a different code is never undone.
    async fn consume_backup_code(&self, user_id: &Uuid, code_hash: &str) -> Result<bool, StoreError> {
        let key = Self::key(user_id);

        for _ in 0..MAX_CONSUME_ATTEMPTS {
            let Some(current) = self.credential(user_id).await? else {
                return Ok(false);
            };
            if !current.backup_codes.iter().any(|c| c == code_hash) {
                return Ok(false);
            }

            let updated = MfaCredential {
                backup_codes: current
                    .backup_codes
                    .iter()
                    .filter(|c| c.as_str() != code_hash)
                    .cloned()
                    .collect(),
                ..current.clone()
            };

            let expected = current.backup_codes;
            let secret = current.secret;
            if self
                .store
                .update_if(
                    &key,
                    |stored: &MfaCredential| stored.backup_codes == expected && stored.secret == secret,
                    &updated,
                )
                .await?
            {
                return Ok(true);
            }
        }

        tracing::warn!(user_id = %user_id, "Backup code consumption kept losing races");
        Ok(false)
    }

    /// Turn MFA on after proving possession of the secret
    pub async fn enable(&self, user_id: &Uuid, code: &str) -> Result<bool, AppError> {
        let Some(credential) = self.credential(user_id).await? else {
            return Err(AppError::validation("MFA enrollment not started"));
        };
        if credential.enabled {
            return Ok(true);
        }

        if !self.verify(user_id, code).await?.is_valid {
            return Ok(false);
        }

        Ok(self.commit_enable(user_id, &credential.secret).await?)
    }

    /// Flip the flag only while the stored secret is still the one the code was
    /// checked against. A re-enrollment in between leaves MFA disabled.
    pub(crate) async fn commit_enable(
        &self,
        user_id: &Uuid,
        verified_secret: &str,
    ) -> Result<bool, StoreError> {
        // Re-read: verification may have consumed a backup code
        let Some(current) = self.credential(user_id).await? else {
            return Ok(false);
        };
        if current.secret != verified_secret || current.enabled {
            return Ok(false);
        }

        let enabled = MfaCredential {
            enabled: true,
            enabled_at: Some(Utc::now()),
            ..current.clone()
        };
        let won = self
            .store
            .update_if(
                &Self::key(user_id),
                |stored: &MfaCredential| {
                    !stored.enabled
                        && stored.secret == verified_secret
                        && stored.backup_codes == current.backup_codes
                },
                &enabled,
            )
            .await?;

        if won {
            tracing::info!(user_id = %user_id, "MFA enabled");
        } else {
            tracing::warn!(user_id = %user_id, "MFA enable lost a race with re-enrollment");
        }
        Ok(won)
    }

    /// Re-check the password, then drop secret, codes and flag in one delete
    pub async fn disable(&self, user_id: &Uuid, password: &str) -> Result<bool, AppError> {
        if !self
            .accounts
            .verify_password(&self.hasher, user_id, password)
            .await?
        {
            return Err(AppError::authentication("Invalid password"));
        }

        let removed = self.store.delete(&Self::key(user_id)).await?;
        if removed {
            tracing::info!(user_id = %user_id, "MFA disabled");
        }
        Ok(removed)
    }

    pub async fn is_enabled(&self, user_id: &Uuid) -> Result<bool, StoreError> {
        Ok(self
            .credential(user_id)
            .await?
            .map(|c| c.enabled)
            .unwrap_or(false))
    }

    pub async fn backup_codes_remaining(&self, user_id: &Uuid) -> Result<usize, StoreError> {
        Ok(self
            .credential(user_id)
            .await?
            .map(|c| c.backup_codes.len())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use std::collections::HashSet;
    use std::sync::Arc;

    async fn setup() -> (Arc<MfaService>, Uuid) {
        let store = Store::in_memory();
        let config = AppConfig::for_testing();
        let hasher = PasswordHasher::from_config(&config.security).unwrap();
        let accounts = AccountRepository::new(store.clone());
        let hash = hasher.hash("Password123").unwrap();
        let account = accounts.create("a@b.com", &hash, "CLIENT").await.unwrap();

        let service = MfaService::new(store, accounts, hasher, "SecurityCore");
        (Arc::new(service), account.id)
    }

    fn current_code(enrollment: &MfaEnrollment, user_id: &Uuid) -> String {
        totp::build_totp(&enrollment.secret, "SecurityCore", &user_id.to_string())
            .unwrap()
            .generate(Utc::now().timestamp() as u64)
    }

    #[tokio::test]
    async fn test_enroll_returns_ten_unique_codes() {
        let (mfa, user_id) = setup().await;
        let enrollment = mfa.enroll(&user_id, "a@b.com").await.unwrap();

        let unique: HashSet<_> = enrollment.backup_codes.iter().collect();
        assert_eq!(unique.len(), totp::BACKUP_CODE_COUNT);
        assert!(enrollment.enrollment_uri.starts_with("otpauth://totp/"));
        assert!(!mfa.is_enabled(&user_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_backup_code_verifies_once() {
        let (mfa, user_id) = setup().await;
        let enrollment = mfa.enroll(&user_id, "a@b.com").await.unwrap();
        let code = &enrollment.backup_codes[0];

        let first = mfa.verify(&user_id, code).await.unwrap();
        assert_eq!(first, MfaVerification { is_valid: true, is_backup_code: true });

        let second = mfa.verify(&user_id, code).await.unwrap();
        assert!(!second.is_valid);
    }

    #[tokio::test]
    async fn test_backup_code_requires_exact_match() {
        let (mfa, user_id) = setup().await;
        let enrollment = mfa.enroll(&user_id, "a@b.com").await.unwrap();
        let code = &enrollment.backup_codes[0];

        let lowered = code.to_ascii_lowercase();
        if lowered != *code {
            assert!(!mfa.verify(&user_id, &lowered).await.unwrap().is_valid);
        }
        assert!(!mfa.verify(&user_id, &format!(" {code}")).await.unwrap().is_valid);
        assert_eq!(mfa.backup_codes_remaining(&user_id).await.unwrap(), 10);

        assert!(mfa.verify(&user_id, code).await.unwrap().is_backup_code);
    }

    #[tokio::test]
    async fn test_consuming_one_code_keeps_the_others() {
        let (mfa, user_id) = setup().await;
        let enrollment = mfa.enroll(&user_id, "a@b.com").await.unwrap();

        assert!(mfa.verify(&user_id, &enrollment.backup_codes[3]).await.unwrap().is_valid);
        assert_eq!(mfa.backup_codes_remaining(&user_id).await.unwrap(), 9);

        for (i, code) in enrollment.backup_codes.iter().enumerate() {
            if i == 3 {
                continue;
            }
            assert!(mfa.verify(&user_id, code).await.unwrap().is_backup_code);
        }
        assert_eq!(mfa.backup_codes_remaining(&user_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_same_backup_code_single_success() {
        let (mfa, user_id) = setup().await;
        let enrollment = mfa.enroll(&user_id, "a@b.com").await.unwrap();
        let code = enrollment.backup_codes[0].clone();

        let tasks = (0..16).map(|_| {
            let mfa = mfa.clone();
            let code = code.clone();
            tokio::spawn(async move { mfa.verify(&user_id, &code).await.unwrap() })
        });
        let successes = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| r.as_ref().unwrap().is_valid)
            .count();

        assert_eq!(successes, 1);
        assert_eq!(mfa.backup_codes_remaining(&user_id).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_enable_requires_valid_code() {
        let (mfa, user_id) = setup().await;
        let enrollment = mfa.enroll(&user_id, "a@b.com").await.unwrap();

        assert!(!mfa.enable(&user_id, "000000x").await.unwrap());
        assert!(!mfa.is_enabled(&user_id).await.unwrap());

        let code = current_code(&enrollment, &user_id);
        assert!(mfa.enable(&user_id, &code).await.unwrap());
        assert!(mfa.is_enabled(&user_id).await.unwrap());

        // Enabled enrollment cannot be overwritten
        assert!(mfa.enroll(&user_id, "a@b.com").await.is_err());
    }

    #[tokio::test]
    async fn test_enable_rejected_when_secret_replaced_after_verify() {
        let (mfa, user_id) = setup().await;
        let first = mfa.enroll(&user_id, "a@b.com").await.unwrap();
        assert!(mfa.verify(&user_id, &current_code(&first, &user_id)).await.unwrap().is_valid);

        // Re-enrollment lands between the check and the commit
        let second = mfa.enroll(&user_id, "a@b.com").await.unwrap();
        assert!(!mfa.commit_enable(&user_id, &first.secret).await.unwrap());
        assert!(!mfa.is_enabled(&user_id).await.unwrap());

        assert!(mfa.commit_enable(&user_id, &second.secret).await.unwrap());
        assert!(mfa.is_enabled(&user_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_reenroll_replaces_pending_enrollment() {
        let (mfa, user_id) = setup().await;
        let first = mfa.enroll(&user_id, "a@b.com").await.unwrap();
        let second = mfa.enroll(&user_id, "a@b.com").await.unwrap();

        assert_ne!(first.secret, second.secret);
        assert!(!mfa.verify(&user_id, &first.backup_codes[0]).await.unwrap().is_valid);
        assert!(mfa.verify(&user_id, &second.backup_codes[0]).await.unwrap().is_valid);
    }

    #[tokio::test]
    async fn test_disable_requires_password_and_clears_everything() {
        let (mfa, user_id) = setup().await;
        let enrollment = mfa.enroll(&user_id, "a@b.com").await.unwrap();
        assert!(mfa.enable(&user_id, &current_code(&enrollment, &user_id)).await.unwrap());

        assert!(mfa.disable(&user_id, "WrongPassword1").await.is_err());
        assert!(mfa.is_enabled(&user_id).await.unwrap());

        assert!(mfa.disable(&user_id, "Password123").await.unwrap());
        assert!(!mfa.is_enabled(&user_id).await.unwrap());
        assert_eq!(mfa.backup_codes_remaining(&user_id).await.unwrap(), 0);
        assert!(!mfa.verify(&user_id, &enrollment.backup_codes[1]).await.unwrap().is_valid);
    }

    #[tokio::test]
    async fn test_unknown_user_is_invalid() {
        let (mfa, _) = setup().await;
        let result = mfa.verify(&Uuid::new_v4(), "123456").await.unwrap();
        assert_eq!(result, MfaVerification::INVALID);
    }
}
