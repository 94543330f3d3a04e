//! 会话与账户策略
//! 并发会话上限（超出时淘汰最久未活动的会话）、会话校验、账户锁定/解锁

use crate::{
    auth::jwt::TokenService,
    config::SessionConfig,
    error::AppError,
    repository::AccountRepository,
    scheduler::SingleFlight,
    store::{Store, StoreError},
};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

const SESSION_PREFIX: &str = "session:";
const SESSION_OWNER_PREFIX: &str = "session-owner:";

/// 会话记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    /// 登录时签发的刷新令牌，轮换后更新
    pub refresh_token_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl Session {
    fn is_active(&self, now: DateTime<Utc>, idle_timeout: Duration) -> bool {
        !self.revoked && self.expires_at > now && self.last_active_at + idle_timeout > now
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionValidation {
    pub is_valid: bool,
    pub user_id: Option<Uuid>,
}

impl SessionValidation {
    const INVALID: Self = Self {
        is_valid: false,
        user_id: None,
    };
}

pub struct SessionPolicy {
    store: Store,
    tokens: Arc<TokenService>,
    accounts: AccountRepository,
    max_concurrent: usize,
    session_ttl: Duration,
    idle_timeout: Duration,
    /// 同一用户的会话创建串行执行，保证上限不被并发突破
    creation_locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
    sweep_guard: SingleFlight,
}

impl SessionPolicy {
    pub fn new(
        store: Store,
        tokens: Arc<TokenService>,
        accounts: AccountRepository,
        config: &SessionConfig,
    ) -> Self {
        Self {
            store,
            tokens,
            accounts,
            max_concurrent: config.max_concurrent_sessions,
            session_ttl: Duration::seconds(config.session_ttl_secs as i64),
            idle_timeout: Duration::seconds(config.idle_timeout_secs as i64),
            creation_locks: DashMap::new(),
            sweep_guard: SingleFlight::new(),
        }
    }

    pub fn max_concurrent_sessions(&self) -> usize {
        self.max_concurrent
    }

    fn session_key(user_id: &Uuid, session_id: &Uuid) -> String {
        format!("{SESSION_PREFIX}{user_id}:{session_id}")
    }

    fn owner_key(session_id: &Uuid) -> String {
        format!("{SESSION_OWNER_PREFIX}{session_id}")
    }

    async fn load(&self, session_id: &Uuid) -> Result<Option<Session>, StoreError> {
        let Some(user_id) = self.store.get::<Uuid>(&Self::owner_key(session_id)).await? else {
            return Ok(None);
        };
        self.store.get(&Self::session_key(&user_id, session_id)).await
    }

    async fn all_sessions(&self, user_id: &Uuid) -> Result<Vec<Session>, StoreError> {
        let prefix = format!("{SESSION_PREFIX}{user_id}:");
        let mut sessions = Vec::new();
        for key in self.store.keys(&prefix).await? {
            if let Some(session) = self.store.get::<Session>(&key).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    /// 创建会话；达到上限时先淘汰最久未活动的会话
    pub async fn create_session(
        &self,
        user_id: &Uuid,
        user_agent: Option<&str>,
        ip_address: Option<&str>,
        refresh_token_id: Option<Uuid>,
    ) -> Result<SessionInfo, AppError> {
        let account = self
            .accounts
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::not_found("account"))?;
        if account.locked {
            return Err(AppError::authorization("Account is locked"));
        }

        let lock = self
            .creation_locks
            .entry(*user_id)
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut active: Vec<Session> = self
            .all_sessions(user_id)
            .await?
            .into_iter()
            .filter(|s| s.is_active(now, self.idle_timeout))
            .collect();
        active.sort_by_key(|s| (s.last_active_at, s.created_at));

        let excess = (active.len() + 1).saturating_sub(self.max_concurrent);
        for evicted in active.iter().take(excess) {
            self.revoke(evicted).await?;
            tracing::info!(
                user_id = %user_id,
                session_id = %evicted.id,
                "Session evicted: concurrent session limit reached"
            );
        }

        let session = Session {
            id: Uuid::new_v4(),
            user_id: *user_id,
            user_agent: user_agent.map(str::to_string),
            ip_address: ip_address.map(str::to_string),
            refresh_token_id,
            created_at: now,
            last_active_at: now,
            expires_at: now + self.session_ttl,
            revoked: false,
        };

        let ttl = self.session_ttl.to_std().ok();
        self.store
            .put(&Self::session_key(user_id, &session.id), &session, ttl)
            .await?;
        self.store
            .put(&Self::owner_key(&session.id), user_id, ttl)
            .await?;

        tracing::debug!(user_id = %user_id, session_id = %session.id, "Session created");
        Ok(SessionInfo {
            session_id: session.id,
            expires_at: session.expires_at,
        })
    }

    /// 校验会话，成功时刷新活动时间
    pub async fn validate_session(&self, session_id: &Uuid) -> Result<SessionValidation, StoreError> {
        let Some(session) = self.load(session_id).await? else {
            return Ok(SessionValidation::INVALID);
        };
        if !session.is_active(Utc::now(), self.idle_timeout) {
            return Ok(SessionValidation::INVALID);
        }
        if !self.touch(session_id).await? {
            return Ok(SessionValidation::INVALID);
        }

        Ok(SessionValidation {
            is_valid: true,
            user_id: Some(session.user_id),
        })
    }

    /// 更新最后活动时间
    pub async fn touch(&self, session_id: &Uuid) -> Result<bool, StoreError> {
        let Some(session) = self.load(session_id).await? else {
            return Ok(false);
        };
        let touched = Session {
            last_active_at: Utc::now(),
            ..session.clone()
        };
        self.store
            .update_if(
                &Self::session_key(&session.user_id, session_id),
                |current: &Session| !current.revoked,
                &touched,
            )
            .await
    }

    /// 刷新令牌轮换后，把会话指向新令牌
    pub async fn relink_refresh_token(
        &self,
        user_id: &Uuid,
        old_token_id: &Uuid,
        new_token_id: Uuid,
    ) -> Result<bool, StoreError> {
        let Some(session) = self
            .all_sessions(user_id)
            .await?
            .into_iter()
            .find(|s| s.refresh_token_id.as_ref() == Some(old_token_id))
        else {
            return Ok(false);
        };

        let relinked = Session {
            refresh_token_id: Some(new_token_id),
            last_active_at: Utc::now(),
            ..session.clone()
        };
        let old = *old_token_id;
        self.store
            .update_if(
                &Self::session_key(user_id, &session.id),
                |current: &Session| !current.revoked && current.refresh_token_id == Some(old),
                &relinked,
            )
            .await
    }

    /// 找到持有指定刷新令牌的会话
    pub async fn find_by_refresh_token(
        &self,
        user_id: &Uuid,
        token_id: &Uuid,
    ) -> Result<Option<Session>, StoreError> {
        Ok(self
            .all_sessions(user_id)
            .await?
            .into_iter()
            .find(|s| !s.revoked && s.refresh_token_id.as_ref() == Some(token_id)))
    }

    /// 撤销会话及其刷新令牌；返回本次是否有变更
    async fn revoke(&self, session: &Session) -> Result<bool, StoreError> {
        let revoked = Session {
            revoked: true,
            ..session.clone()
        };
        let changed = self
            .store
            .update_if(
                &Self::session_key(&session.user_id, &session.id),
                |current: &Session| !current.revoked,
                &revoked,
            )
            .await?;

        if let Some(token_id) = session.refresh_token_id {
            self.tokens.revoke_by_id(&session.user_id, &token_id).await?;
        }
        Ok(changed)
    }

    /// 撤销用户自己的某个会话
    pub async fn revoke_session(&self, user_id: &Uuid, session_id: &Uuid) -> Result<bool, StoreError> {
        let Some(session) = self
            .store
            .get::<Session>(&Self::session_key(user_id, session_id))
            .await?
        else {
            return Ok(false);
        };
        self.revoke(&session).await
    }

    /// 撤销用户的全部会话
    pub async fn revoke_all_sessions(&self, user_id: &Uuid) -> Result<u64, StoreError> {
        let mut revoked = 0;
        for session in self.all_sessions(user_id).await? {
            if !session.revoked && self.revoke(&session).await? {
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    /// 活动会话列表，最近活动的在前
    pub async fn list_sessions(&self, user_id: &Uuid) -> Result<Vec<Session>, StoreError> {
        let now = Utc::now();
        let mut sessions: Vec<Session> = self
            .all_sessions(user_id)
            .await?
            .into_iter()
            .filter(|s| s.is_active(now, self.idle_timeout))
            .collect();
        sessions.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        Ok(sessions)
    }

    /// 锁定账户：撤销全部刷新令牌与会话
    pub async fn lock_account(&self, user_id: &Uuid, reason: &str) -> Result<bool, AppError> {
        if self.accounts.find_by_id(user_id).await?.is_none() {
            return Err(AppError::not_found("account"));
        }

        let changed = self.accounts.set_locked(user_id, true, Some(reason)).await?;
        let tokens = self.tokens.revoke_all(user_id).await?;
        let sessions = self.revoke_all_sessions(user_id).await?;

        tracing::warn!(
            user_id = %user_id,
            reason,
            tokens_revoked = tokens,
            sessions_revoked = sessions,
            "Account locked"
        );
        Ok(changed)
    }

    pub async fn unlock_account(&self, user_id: &Uuid) -> Result<bool, AppError> {
        if self.accounts.find_by_id(user_id).await?.is_none() {
            return Err(AppError::not_found("account"));
        }

        let changed = self.accounts.set_locked(user_id, false, None).await?;
        if changed {
            tracing::info!(user_id = %user_id, "Account unlocked");
        }
        Ok(changed)
    }

    /// 清理已撤销、过期或空闲超时的会话
    pub async fn sweep(&self) -> Result<u64, StoreError> {
        let Some(_flight) = self.sweep_guard.try_begin() else {
            return Ok(0);
        };

        let now = Utc::now();
        let mut removed = 0;
        for key in self.store.keys(SESSION_PREFIX).await? {
            let Some(session) = self.store.get::<Session>(&key).await? else {
                continue;
            };
            if session.is_active(now, self.idle_timeout) {
                continue;
            }
            if self.store.delete(&key).await? {
                self.store.delete(&Self::owner_key(&session.id)).await?;
                removed += 1;
            }
        }

        // 没有会话的用户不再需要创建锁
        self.creation_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::jwt::{RotateOutcome, TokenOrigin},
        config::AppConfig,
    };

    struct Fixture {
        policy: SessionPolicy,
        tokens: Arc<TokenService>,
        user_id: Uuid,
    }

    async fn fixture(max_sessions: usize) -> Fixture {
        let mut config = AppConfig::for_testing();
        config.session.max_concurrent_sessions = max_sessions;
        let store = Store::in_memory();
        let tokens = Arc::new(TokenService::from_config(&config, store.clone()).unwrap());
        let accounts = AccountRepository::new(store.clone());
        let account = accounts.create("a@b.com", "hash", "CLIENT").await.unwrap();

        Fixture {
            policy: SessionPolicy::new(store, tokens.clone(), accounts, &config.session),
            tokens,
            user_id: account.id,
        }
    }

    async fn pause() {
        tokio::time::sleep(std::time::Duration::from_millis(3)).await;
    }

    #[tokio::test]
    async fn test_create_and_validate() {
        let f = fixture(5).await;
        let info = f
            .policy
            .create_session(&f.user_id, Some("agent"), Some("10.0.0.1"), None)
            .await
            .unwrap();

        let validation = f.policy.validate_session(&info.session_id).await.unwrap();
        assert!(validation.is_valid);
        assert_eq!(validation.user_id, Some(f.user_id));

        let unknown = f.policy.validate_session(&Uuid::new_v4()).await.unwrap();
        assert!(!unknown.is_valid);
        assert!(unknown.user_id.is_none());
    }

    #[tokio::test]
    async fn test_cap_evicts_least_recently_active() {
        let f = fixture(3).await;
        let mut ids = Vec::new();
        for _ in 0..3 {
            let info = f.policy.create_session(&f.user_id, None, None, None).await.unwrap();
            ids.push(info.session_id);
            pause().await;
        }

        // 第一个会话重新活动，第二个成为最久未活动
        assert!(f.policy.touch(&ids[0]).await.unwrap());
        pause().await;

        let newest = f.policy.create_session(&f.user_id, None, None, None).await.unwrap();
        let active: Vec<Uuid> = f
            .policy
            .list_sessions(&f.user_id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();

        assert_eq!(active.len(), 3);
        assert!(!active.contains(&ids[1]));
        assert!(active.contains(&ids[0]));
        assert!(active.contains(&ids[2]));
        assert!(active.contains(&newest.session_id));
        assert!(!f.policy.validate_session(&ids[1]).await.unwrap().is_valid);
    }

    #[tokio::test]
    async fn test_eviction_revokes_refresh_token() {
        let f = fixture(1).await;
        let pair = f.tokens.issue_pair(&f.user_id, "a@b.com", "CLIENT").await.unwrap();
        f.policy
            .create_session(&f.user_id, None, None, Some(pair.refresh_token_id))
            .await
            .unwrap();
        f.policy.create_session(&f.user_id, None, None, None).await.unwrap();

        assert!(matches!(
            f.tokens.rotate(&pair.refresh_token, TokenOrigin::default()).await.unwrap(),
            RotateOutcome::Invalid
        ));
    }

    #[tokio::test]
    async fn test_concurrent_creation_respects_cap() {
        let f = Arc::new(fixture(2).await);
        let tasks = (0..8).map(|_| {
            let f = f.clone();
            tokio::spawn(async move {
                f.policy.create_session(&f.user_id, None, None, None).await.unwrap()
            })
        });
        futures::future::join_all(tasks).await;

        assert_eq!(f.policy.list_sessions(&f.user_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_revoke_session_and_all() {
        let f = fixture(5).await;
        let a = f.policy.create_session(&f.user_id, None, None, None).await.unwrap();
        let _b = f.policy.create_session(&f.user_id, None, None, None).await.unwrap();

        assert!(f.policy.revoke_session(&f.user_id, &a.session_id).await.unwrap());
        assert!(!f.policy.revoke_session(&f.user_id, &a.session_id).await.unwrap());
        // 他人无法撤销
        assert!(!f.policy.revoke_session(&Uuid::new_v4(), &a.session_id).await.unwrap());

        assert_eq!(f.policy.revoke_all_sessions(&f.user_id).await.unwrap(), 1);
        assert!(f.policy.list_sessions(&f.user_id).await.unwrap().is_empty());
        assert_eq!(f.policy.sweep().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_lock_blocks_sessions_and_revokes_tokens() {
        let f = fixture(5).await;
        let pair = f.tokens.issue_pair(&f.user_id, "a@b.com", "CLIENT").await.unwrap();
        let session = f
            .policy
            .create_session(&f.user_id, None, None, Some(pair.refresh_token_id))
            .await
            .unwrap();

        assert!(f.policy.lock_account(&f.user_id, "chargeback").await.unwrap());
        assert!(!f.policy.validate_session(&session.session_id).await.unwrap().is_valid);
        assert!(matches!(
            f.tokens.rotate(&pair.refresh_token, TokenOrigin::default()).await.unwrap(),
            RotateOutcome::Invalid
        ));
        let err = f.policy.create_session(&f.user_id, None, None, None).await.unwrap_err();
        assert_eq!(err.code(), 403);

        assert!(f.policy.unlock_account(&f.user_id).await.unwrap());
        assert!(f.policy.create_session(&f.user_id, None, None, None).await.is_ok());
        assert!(f.policy.lock_account(&Uuid::new_v4(), "x").await.is_err());
    }

    #[tokio::test]
    async fn test_relink_after_rotation() {
        let f = fixture(5).await;
        let pair = f.tokens.issue_pair(&f.user_id, "a@b.com", "CLIENT").await.unwrap();
        let session = f
            .policy
            .create_session(&f.user_id, None, None, Some(pair.refresh_token_id))
            .await
            .unwrap();

        let new_id = Uuid::new_v4();
        assert!(f
            .policy
            .relink_refresh_token(&f.user_id, &pair.refresh_token_id, new_id)
            .await
            .unwrap());
        let found = f.policy.find_by_refresh_token(&f.user_id, &new_id).await.unwrap().unwrap();
        assert_eq!(found.id, session.session_id);
    }
}
