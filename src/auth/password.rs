//! Password hashing and verification using Argon2id

use crate::{config::SecurityConfig, error::AppError};
use argon2::{
    password_hash::{
        rand_core::OsRng, PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString,
    },
    Algorithm, Argon2, Params, Version,
};

const LANES: u32 = 4;

/// Password hasher with configurable cost
#[derive(Clone)]
pub struct PasswordHasher {
    argon2: Argon2<'static>,
}

impl PasswordHasher {
    /// Build from the configured memory/iteration cost
    pub fn from_config(config: &SecurityConfig) -> Result<Self, AppError> {
        let params = Params::new(
            config.password_hash_memory_kib,
            config.password_hash_iterations,
            LANES,
            None,
        )
        .map_err(|e| AppError::Config(format!("Invalid Argon2 params: {}", e)))?;

        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    /// Hash a password
    pub fn hash(&self, password: &str) -> Result<String, AppError> {
        let salt = SaltString::generate(&mut OsRng);

        let password_hash = self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| {
                tracing::error!("Failed to hash password: {:?}", e);
                AppError::Internal(format!("Failed to hash password: {}", e))
            })?
            .to_string();

        Ok(password_hash)
    }

    /// Verify a password against a stored hash. A malformed hash is a server
    /// fault, a mismatch is `Ok(false)`.
    pub fn verify(&self, password: &str, hash: &str) -> Result<bool, AppError> {
        let parsed_hash = PasswordHash::new(hash).map_err(|e| {
            tracing::error!("Failed to parse stored password hash: {:?}", e);
            AppError::Internal(format!("Failed to parse password hash: {}", e))
        })?;

        Ok(self
            .argon2
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok())
    }

    /// Hash on the blocking pool; Argon2 is deliberately slow
    pub async fn hash_blocking(&self, password: String) -> Result<String, AppError> {
        let hasher = self.clone();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| AppError::Internal(format!("Hashing task failed: {}", e)))?
    }

    pub async fn verify_blocking(&self, password: String, hash: String) -> Result<bool, AppError> {
        let hasher = self.clone();
        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(|e| AppError::Internal(format!("Verification task failed: {}", e)))?
    }
}

/// Validate password against policy
pub fn validate_password_policy(password: &str, policy: &SecurityConfig) -> Result<(), AppError> {
    if password.chars().count() < policy.password_min_length {
        return Err(AppError::Validation(format!(
            "Password must be at least {} characters",
            policy.password_min_length
        )));
    }

    if policy.password_require_uppercase && !password.chars().any(|c| c.is_uppercase()) {
        return Err(AppError::validation(
            "Password must contain at least one uppercase letter",
        ));
    }

    if policy.password_require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(AppError::validation("Password must contain at least one digit"));
    }

    if policy.password_require_special && password.chars().all(|c| c.is_alphanumeric()) {
        return Err(AppError::validation(
            "Password must contain at least one special character",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn hasher() -> PasswordHasher {
        PasswordHasher::from_config(&AppConfig::for_testing().security).unwrap()
    }

    #[test]
    fn test_hash_and_verify() {
        let hasher = hasher();
        let hash = hasher.hash("TestPassword123!").unwrap();

        assert!(hasher.verify("TestPassword123!", &hash).unwrap());
        assert!(!hasher.verify("WrongPassword", &hash).unwrap());
    }

    #[test]
    fn test_hash_is_salted() {
        let hasher = hasher();
        let hash1 = hasher.hash("TestPassword123!").unwrap();
        let hash2 = hasher.hash("TestPassword123!").unwrap();

        assert_ne!(hash1, hash2);
        assert!(hash1.starts_with("$argon2id$"));
    }

    #[test]
    fn test_malformed_hash_is_error() {
        assert!(hasher().verify("whatever", "not-a-phc-string").is_err());
    }

    #[tokio::test]
    async fn test_blocking_variants() {
        let hasher = hasher();
        let hash = hasher.hash_blocking("Secret123".to_string()).await.unwrap();
        assert!(hasher
            .verify_blocking("Secret123".to_string(), hash)
            .await
            .unwrap());
    }

    #[test]
    fn test_password_policy_validation() {
        let policy = AppConfig::for_testing().security;

        assert!(validate_password_policy("Short1", &policy).is_err());
        assert!(validate_password_policy("alllowercase1", &policy).is_err());
        assert!(validate_password_policy("NoDigitsHere", &policy).is_err());
        assert!(validate_password_policy("ValidPass123", &policy).is_ok());

        let mut strict = policy.clone();
        strict.password_require_special = true;
        assert!(validate_password_policy("ValidPass123", &strict).is_err());
        assert!(validate_password_policy("ValidPass123!", &strict).is_ok());
    }
}
