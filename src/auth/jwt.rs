//! JWT token lifecycle
//! Implements access token + server-tracked, single-use refresh token rotation

use crate::{
    config::AppConfig,
    error::AppError,
    scheduler::SingleFlight,
    store::{Store, StoreError},
    telemetry::AUDIT_TARGET,
};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

const ACCESS: &str = "access";
const REFRESH: &str = "refresh";
const REFRESH_PREFIX: &str = "refresh:";

/// JWT claims, shared by access and refresh tokens
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,

    pub email: String,

    pub role: String,

    /// Token type (access or refresh)
    pub token_type: String,

    /// Issued at
    pub iat: i64,

    /// Expiration
    pub exp: i64,

    /// JWT ID. For refresh tokens this is the id of the server-side record.
    pub jti: String,
}

/// Token pair response
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64, // seconds until access token expires
    #[serde(skip)]
    pub refresh_token_id: Uuid,
}

/// Where a refresh token was minted
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenOrigin {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Server-side refresh token record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub email: String,
    pub role: String,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub replaced_by: Option<Uuid>,
    pub origin: TokenOrigin,
    pub created_at: DateTime<Utc>,
}

impl RefreshTokenRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    fn revoked_at(&self, now: DateTime<Utc>, replaced_by: Option<Uuid>) -> Self {
        Self {
            revoked: true,
            revoked_at: Some(now),
            replaced_by,
            ..self.clone()
        }
    }
}

/// Outcome of access token verification
#[derive(Debug, Clone)]
pub enum AccessVerification {
    Valid(Claims),
    Invalid,
}

impl AccessVerification {
    pub fn into_claims(self) -> Option<Claims> {
        match self {
            AccessVerification::Valid(claims) => Some(claims),
            AccessVerification::Invalid => None,
        }
    }
}

/// Outcome of refresh token rotation
#[derive(Debug, Clone)]
pub enum RotateOutcome {
    Rotated(TokenPair),
    /// Bad signature, expired, unknown, already used or lost a concurrent rotation.
    /// Callers must force re-authentication.
    Invalid,
}

/// Token lifecycle service
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_token_exp_secs: u64,
    refresh_token_exp_secs: u64,
    store: Store,
    sweep_guard: SingleFlight,
}

impl TokenService {
    /// Create token service from config
    pub fn from_config(config: &AppConfig, store: Store) -> Result<Self, AppError> {
        let secret = config.security.jwt_secret.expose_secret();

        // Ensure secret is at least 32 bytes for HS256
        if secret.len() < 32 {
            return Err(AppError::Config("JWT secret too short (min 32 chars)".to_string()));
        }

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            access_token_exp_secs: config.security.access_token_exp_secs,
            refresh_token_exp_secs: config.security.refresh_token_exp_secs,
            store,
            sweep_guard: SingleFlight::new(),
        })
    }

    fn record_key(user_id: &Uuid, token_id: &Uuid) -> String {
        format!("{REFRESH_PREFIX}{user_id}:{token_id}")
    }

    fn user_prefix(user_id: &Uuid) -> String {
        format!("{REFRESH_PREFIX}{user_id}:")
    }

    pub fn hash_token(token: &str) -> String {
        hex::encode(Sha256::digest(token.as_bytes()))
    }

    fn sign(&self, claims: &Claims) -> Result<String, AppError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key).map_err(|e| {
            tracing::error!("Failed to encode {} token: {:?}", claims.token_type, e);
            AppError::Internal(format!("Failed to encode token: {}", e))
        })
    }

    fn decode_claims(&self, token: &str, expected_type: &str) -> Option<Claims> {
        let claims = decode::<Claims>(token, &self.decoding_key, &Validation::new(Algorithm::HS256))
            .map_err(|e| {
                tracing::debug!("Token validation failed: {:?}", e);
            })
            .ok()?
            .claims;

        if claims.token_type != expected_type {
            tracing::debug!(
                "Token type mismatch: expected '{}', got '{}'",
                expected_type,
                claims.token_type
            );
            return None;
        }

        Some(claims)
    }

    /// Generate access token. Stateless: never written to the store.
    pub fn generate_access_token(
        &self,
        user_id: &Uuid,
        email: &str,
        role: &str,
    ) -> Result<String, AppError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            email: email.to_string(),
            role: role.to_string(),
            token_type: ACCESS.to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(self.access_token_exp_secs as i64)).timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        self.sign(&claims)
    }

    /// Issue a new access/refresh pair and persist the refresh record
    pub async fn issue_pair(
        &self,
        user_id: &Uuid,
        email: &str,
        role: &str,
    ) -> Result<TokenPair, AppError> {
        self.issue_pair_with_origin(user_id, email, role, TokenOrigin::default())
            .await
    }

    pub async fn issue_pair_with_origin(
        &self,
        user_id: &Uuid,
        email: &str,
        role: &str,
        origin: TokenOrigin,
    ) -> Result<TokenPair, AppError> {
        self.mint_pair(Uuid::new_v4(), user_id, email, role, origin)
            .await
    }

    async fn mint_pair(
        &self,
        token_id: Uuid,
        user_id: &Uuid,
        email: &str,
        role: &str,
        origin: TokenOrigin,
    ) -> Result<TokenPair, AppError> {
        let now = Utc::now();
        let expires_at = now + Duration::seconds(self.refresh_token_exp_secs as i64);

        let refresh_token = self.sign(&Claims {
            sub: user_id.to_string(),
            email: email.to_string(),
            role: role.to_string(),
            token_type: REFRESH.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: token_id.to_string(),
        })?;
        let access_token = self.generate_access_token(user_id, email, role)?;

        let record = RefreshTokenRecord {
            id: token_id,
            user_id: *user_id,
            email: email.to_string(),
            role: role.to_string(),
            token_hash: Self::hash_token(&refresh_token),
            expires_at,
            revoked: false,
            revoked_at: None,
            replaced_by: None,
            origin,
            created_at: now,
        };
        self.store
            .put(&Self::record_key(user_id, &token_id), &record, None)
            .await?;

        tracing::debug!(user_id = %user_id, token_id = %token_id, "Issued token pair");

        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in: self.access_token_exp_secs,
            refresh_token_id: token_id,
        })
    }

    /// Verify an access token: signature and expiry only, never touches the store
    pub fn verify_access(&self, token: &str) -> AccessVerification {
        match self.decode_claims(token, ACCESS) {
            Some(claims) => AccessVerification::Valid(claims),
            None => AccessVerification::Invalid,
        }
    }

    /// Owner and record id of a well-formed refresh token. Does not consult
    /// the store, so the token may already be revoked.
    pub fn peek_refresh(&self, refresh_token: &str) -> Option<(Uuid, Uuid)> {
        let claims = self.decode_claims(refresh_token, REFRESH)?;
        let user_id = Uuid::parse_str(&claims.sub).ok()?;
        let token_id = Uuid::parse_str(&claims.jti).ok()?;
        Some((user_id, token_id))
    }

    /// Exchange a refresh token for a new pair, revoking the presented one.
    ///
    /// The revoke is a conditional update (`revoked == false`), so of two
    /// concurrent rotations of the same token only one can win. Presenting a
    /// token that was already rotated is treated as theft and revokes every
    /// refresh token the user holds; tokens revoked by logout simply fail.
    pub async fn rotate(
        &self,
        refresh_token: &str,
        origin: TokenOrigin,
    ) -> Result<RotateOutcome, AppError> {
        let Some(claims) = self.decode_claims(refresh_token, REFRESH) else {
            return Ok(RotateOutcome::Invalid);
        };
        let (Ok(user_id), Ok(token_id)) =
            (Uuid::parse_str(&claims.sub), Uuid::parse_str(&claims.jti))
        else {
            return Ok(RotateOutcome::Invalid);
        };

        let key = Self::record_key(&user_id, &token_id);
        let Some(record) = self.store.get::<RefreshTokenRecord>(&key).await? else {
            tracing::debug!(token_id = %token_id, "Refresh token record not found");
            return Ok(RotateOutcome::Invalid);
        };

        if record.token_hash != Self::hash_token(refresh_token) {
            return Ok(RotateOutcome::Invalid);
        }

        let now = Utc::now();
        if record.revoked {
            // A rotated token coming back means it was copied
            if record.replaced_by.is_some() {
                metrics::counter!("auth_refresh_replay_total").increment(1);
                tracing::warn!(
                    target: AUDIT_TARGET,
                    user_id = %user_id,
                    token_id = %token_id,
                    "Rotated refresh token presented again, revoking all tokens for user"
                );
                self.revoke_all(&user_id).await?;
            }
            return Ok(RotateOutcome::Invalid);
        }

        if record.is_expired(now) {
            return Ok(RotateOutcome::Invalid);
        }

        let successor = Uuid::new_v4();
        let revoked = record.revoked_at(now, Some(successor));
        let won = self
            .store
            .update_if(&key, |current: &RefreshTokenRecord| !current.revoked, &revoked)
            .await?;

        if !won {
            tracing::warn!(
                user_id = %user_id,
                token_id = %token_id,
                "Concurrent rotation of the same refresh token rejected"
            );
            return Ok(RotateOutcome::Invalid);
        }

        let pair = self
            .mint_pair(successor, &record.user_id, &record.email, &record.role, origin)
            .await?;

        tracing::info!(user_id = %user_id, "Refresh token rotated");
        Ok(RotateOutcome::Rotated(pair))
    }

    /// Revoke one refresh token owned by `user_id`. Idempotent; returns whether
    /// this call changed anything.
    pub async fn revoke(&self, user_id: &Uuid, refresh_token: &str) -> Result<bool, StoreError> {
        let Some(claims) = self.decode_claims(refresh_token, REFRESH) else {
            return Ok(false);
        };
        if claims.sub != user_id.to_string() {
            return Ok(false);
        }
        let Ok(token_id) = Uuid::parse_str(&claims.jti) else {
            return Ok(false);
        };

        self.revoke_by_id(user_id, &token_id).await
    }

    /// Revoke a refresh token record by id
    pub async fn revoke_by_id(&self, user_id: &Uuid, token_id: &Uuid) -> Result<bool, StoreError> {
        let key = Self::record_key(user_id, token_id);
        let Some(record) = self.store.get::<RefreshTokenRecord>(&key).await? else {
            return Ok(false);
        };
        if record.revoked {
            return Ok(false);
        }

        let revoked = record.revoked_at(Utc::now(), None);
        self.store
            .update_if(&key, |current: &RefreshTokenRecord| !current.revoked, &revoked)
            .await
    }

    /// Revoke every refresh token the user holds; returns the number revoked
    pub async fn revoke_all(&self, user_id: &Uuid) -> Result<u64, StoreError> {
        let mut revoked = 0;
        for key in self.store.keys(&Self::user_prefix(user_id)).await? {
            let Some(record) = self.store.get::<RefreshTokenRecord>(&key).await? else {
                continue;
            };
            if record.revoked {
                continue;
            }
            let updated = record.revoked_at(Utc::now(), None);
            if self
                .store
                .update_if(&key, |current: &RefreshTokenRecord| !current.revoked, &updated)
                .await?
            {
                revoked += 1;
            }
        }

        tracing::info!(user_id = %user_id, revoked, "Revoked all refresh tokens");
        Ok(revoked)
    }

    /// Load a refresh token record (used by session bookkeeping and admin views)
    pub async fn find_record(
        &self,
        user_id: &Uuid,
        token_id: &Uuid,
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        self.store.get(&Self::record_key(user_id, token_id)).await
    }

    /// Remove expired and revoked refresh records. Skips (returning 0) when a
    /// previous sweep is still running.
    pub async fn sweep_expired(&self) -> Result<u64, StoreError> {
        let Some(_flight) = self.sweep_guard.try_begin() else {
            tracing::debug!("Refresh token sweep already running, skipping");
            return Ok(0);
        };

        let now = Utc::now();
        let mut removed = 0;
        for key in self.store.keys(REFRESH_PREFIX).await? {
            let remove = match self.store.get::<RefreshTokenRecord>(&key).await? {
                Some(record) => record.revoked || record.is_expired(now),
                None => false,
            };
            if remove && self.store.delete(&key).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "Swept refresh tokens");
        }
        Ok(removed)
    }
}
