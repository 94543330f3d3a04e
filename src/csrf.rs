//! CSRF guard
//!
//! Two tiers: a stateless format check for 32-char alphanumeric tokens and a
//! stateful, single-use token bound to a client key (usually the client IP)
//! and stored under `csrf:{token}`.

use crate::{
    config::CsrfConfig,
    scheduler::SingleFlight,
    store::{Store, StoreError},
};
use axum::http::Method;
use chrono::{DateTime, Duration, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

pub const CSRF_TOKEN_LEN: usize = 32;
const CSRF_PREFIX: &str = "csrf:";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrfRecord {
    pub client_key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

pub struct CsrfGuard {
    store: Store,
    ttl: Duration,
    public_endpoints: Vec<String>,
    sweep_guard: SingleFlight,
}

impl CsrfGuard {
    pub fn new(store: Store, config: &CsrfConfig) -> Self {
        Self {
            store,
            ttl: Duration::seconds(config.token_ttl_secs as i64),
            public_endpoints: config
                .public_endpoints
                .iter()
                .map(|p| normalize_path(p).to_string())
                .collect(),
            sweep_guard: SingleFlight::new(),
        }
    }

    fn key(token: &str) -> String {
        format!("{CSRF_PREFIX}{token}")
    }

    /// Random 32-character alphanumeric token
    pub fn issue() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CSRF_TOKEN_LEN)
            .map(char::from)
            .collect()
    }

    /// Accepts iff length is 32 and every char is in `[A-Za-z0-9]`
    pub fn check_format(token: &str) -> bool {
        token.len() == CSRF_TOKEN_LEN && token.bytes().all(|b| b.is_ascii_alphanumeric())
    }

    /// Issue a token bound to `client_key` and persist it
    pub async fn issue_tracked(&self, client_key: &str) -> Result<String, StoreError> {
        let token = Self::issue();
        let now = Utc::now();
        let record = CsrfRecord {
            client_key: client_key.to_string(),
            created_at: now,
            expires_at: now + self.ttl,
            used: false,
        };

        self.store
            .put(&Self::key(&token), &record, self.ttl.to_std().ok())
            .await?;
        Ok(token)
    }

    /// Validate and consume a tracked token. Missing, used, expired or
    /// foreign-client tokens are rejected; a successful check marks it used.
    pub async fn validate_tracked(&self, token: &str, client_key: &str) -> Result<bool, StoreError> {
        if !Self::check_format(token) {
            return Ok(false);
        }

        let key = Self::key(token);
        let Some(record) = self.store.get::<CsrfRecord>(&key).await? else {
            return Ok(false);
        };

        if record.used || record.expires_at <= Utc::now() || record.client_key != client_key {
            tracing::debug!(client_key, used = record.used, "CSRF token rejected");
            return Ok(false);
        }

        let consumed = CsrfRecord {
            used: true,
            ..record
        };
        self.store
            .update_if(
                &key,
                |current: &CsrfRecord| !current.used && current.client_key == client_key,
                &consumed,
            )
            .await
    }

    /// Safe methods and public endpoints skip CSRF
    pub fn bypass(&self, method: &Method, path: &str) -> bool {
        if matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS) {
            return true;
        }

        let path = normalize_path(path);
        self.public_endpoints.iter().any(|p| p == path)
    }

    /// Drop used and expired token records
    pub async fn sweep_expired(&self) -> Result<u64, StoreError> {
        let Some(_flight) = self.sweep_guard.try_begin() else {
            return Ok(0);
        };

        let now = Utc::now();
        let mut removed = 0;
        for key in self.store.keys(CSRF_PREFIX).await? {
            let stale = match self.store.get::<CsrfRecord>(&key).await? {
                Some(record) => record.used || record.expires_at <= now,
                None => false,
            };
            if stale && self.store.delete(&key).await? {
                removed += 1;
            }
        }

        Ok(removed)
    }
}

fn normalize_path(path: &str) -> &str {
    let path = path.split('?').next().unwrap_or(path);
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn guard() -> CsrfGuard {
        CsrfGuard::new(Store::in_memory(), &AppConfig::for_testing().csrf)
    }

    #[test]
    fn test_issue_matches_format() {
        for _ in 0..50 {
            let token = CsrfGuard::issue();
            assert!(CsrfGuard::check_format(&token), "bad token {token}");
        }
        assert_ne!(CsrfGuard::issue(), CsrfGuard::issue());
    }

    #[test]
    fn test_check_format() {
        assert!(CsrfGuard::check_format("abcdefghijklmnopqrstuvwxyzABCDEF"));
        assert!(CsrfGuard::check_format("0123456789abcdefghij0123456789AB"));
        // 31 and 33 chars
        assert!(!CsrfGuard::check_format("abcdefghijklmnopqrstuvwxyzABCDE"));
        assert!(!CsrfGuard::check_format("abcdefghijklmnopqrstuvwxyzABCDEFG"));
        assert!(!CsrfGuard::check_format("abcdefghijklmnopqrstuvwxyzABCD-F"));
        assert!(!CsrfGuard::check_format("abcdefghijklmnopqrstuvwxyzABCDé"));
        assert!(!CsrfGuard::check_format(""));
    }

    #[tokio::test]
    async fn test_tracked_token_is_single_use() {
        let guard = guard();
        let token = guard.issue_tracked("10.0.0.1").await.unwrap();

        assert!(guard.validate_tracked(&token, "10.0.0.1").await.unwrap());
        assert!(!guard.validate_tracked(&token, "10.0.0.1").await.unwrap());
    }

    #[tokio::test]
    async fn test_tracked_token_bound_to_client() {
        let guard = guard();
        let token = guard.issue_tracked("10.0.0.1").await.unwrap();

        assert!(!guard.validate_tracked(&token, "10.0.0.2").await.unwrap());
        // Rejected attempt from another client does not burn the token
        assert!(guard.validate_tracked(&token, "10.0.0.1").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_tokens_rejected() {
        let guard = guard();
        assert!(!guard
            .validate_tracked(&CsrfGuard::issue(), "10.0.0.1")
            .await
            .unwrap());
        assert!(!guard.validate_tracked("short", "10.0.0.1").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_consumption_single_winner() {
        let guard = std::sync::Arc::new(guard());
        let token = guard.issue_tracked("10.0.0.1").await.unwrap();

        let tasks = (0..16).map(|_| {
            let guard = guard.clone();
            let token = token.clone();
            tokio::spawn(async move { guard.validate_tracked(&token, "10.0.0.1").await.unwrap() })
        });
        let wins = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn test_bypass() {
        let guard = guard();
        assert!(guard.bypass(&Method::GET, "/api/user"));
        assert!(guard.bypass(&Method::OPTIONS, "/api/user"));
        assert!(guard.bypass(&Method::POST, "/api/health"));
        assert!(guard.bypass(&Method::POST, "/api/health/"));
        assert!(guard.bypass(&Method::POST, "/api/auth/login?next=/"));
        assert!(!guard.bypass(&Method::POST, "/api/user"));
        assert!(!guard.bypass(&Method::DELETE, "/api/sessions/1"));
    }

    #[tokio::test]
    async fn test_sweep_removes_used_tokens() {
        let guard = guard();
        let used = guard.issue_tracked("c").await.unwrap();
        let _fresh = guard.issue_tracked("c").await.unwrap();
        assert!(guard.validate_tracked(&used, "c").await.unwrap());

        assert_eq!(guard.sweep_expired().await.unwrap(), 1);
    }
}
