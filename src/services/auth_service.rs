//! 认证服务：注册、登录、令牌刷新、登出

use crate::{
    auth::{
        jwt::{RotateOutcome, TokenOrigin, TokenPair, TokenService},
        password::{validate_password_policy, PasswordHasher},
    },
    config::AppConfig,
    error::AppError,
    mfa::MfaService,
    models::{
        account::{Account, AccountResponse, ROLE_CLIENT},
        auth::{LoginRequest, LoginResponse, RegisterRequest},
    },
    repository::AccountRepository,
    services::session_policy::SessionPolicy,
    telemetry::AUDIT_TARGET,
};
use std::sync::Arc;
use uuid::Uuid;

/// 请求来源（IP 与 User-Agent）
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl From<&ClientInfo> for TokenOrigin {
    fn from(client: &ClientInfo) -> Self {
        TokenOrigin {
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
        }
    }
}

pub struct AuthService {
    config: Arc<AppConfig>,
    accounts: AccountRepository,
    hasher: PasswordHasher,
    tokens: Arc<TokenService>,
    mfa: Arc<MfaService>,
    sessions: Arc<SessionPolicy>,
}

impl AuthService {
    pub fn new(
        config: Arc<AppConfig>,
        accounts: AccountRepository,
        hasher: PasswordHasher,
        tokens: Arc<TokenService>,
        mfa: Arc<MfaService>,
        sessions: Arc<SessionPolicy>,
    ) -> Self {
        Self {
            config,
            accounts,
            hasher,
            tokens,
            mfa,
            sessions,
        }
    }

    /// 注册新账户（角色固定为 CLIENT）
    pub async fn register(&self, req: RegisterRequest) -> Result<AccountResponse, AppError> {
        validate_password_policy(&req.password, &self.config.security)?;

        let hash = self.hasher.hash_blocking(req.password).await?;
        let account = self.accounts.create(&req.email, &hash, ROLE_CLIENT).await?;

        Ok(AccountResponse::from(account))
    }

    /// 用户登录：密码 → 账户状态 → MFA（已启用时）→ 签发令牌 → 创建会话
    pub async fn login(
        &self,
        req: LoginRequest,
        client: &ClientInfo,
    ) -> Result<LoginResponse, AppError> {
        let client_ip = client.ip_address.as_deref().unwrap_or("unknown");

        let Some(account) = self.accounts.find_by_email(&req.email).await? else {
            // 用户不存在时同样执行一次哈希，避免通过响应时间枚举邮箱
            let _ = self.hasher.hash_blocking(req.password).await;
            tracing::warn!(target: AUDIT_TARGET, client_ip, "Login failed: unknown account");
            return Err(AppError::Unauthorized);
        };

        if !self
            .hasher
            .verify_blocking(req.password, account.password_hash.clone())
            .await?
        {
            tracing::warn!(target: AUDIT_TARGET, user_id = %account.id, client_ip, "Login failed: invalid password");
            return Err(AppError::Unauthorized);
        }

        self.check_account_status(&account)?;

        if self.mfa.is_enabled(&account.id).await? {
            let Some(code) = req.mfa_code.as_deref().filter(|c| !c.trim().is_empty()) else {
                return Err(AppError::authentication("MFA code required"));
            };
            let verification = self.mfa.verify(&account.id, code).await?;
            if !verification.is_valid {
                tracing::warn!(target: AUDIT_TARGET, user_id = %account.id, client_ip, "Login failed: invalid MFA code");
                return Err(AppError::authentication("Invalid MFA code"));
            }
            if verification.is_backup_code {
                tracing::info!(user_id = %account.id, "Backup code used for login");
            }
        }

        let pair = self
            .tokens
            .issue_pair_with_origin(&account.id, &account.email, &account.role, client.into())
            .await?;

        let session = match self
            .sessions
            .create_session(
                &account.id,
                client.user_agent.as_deref(),
                client.ip_address.as_deref(),
                Some(pair.refresh_token_id),
            )
            .await
        {
            Ok(session) => session,
            Err(e) => {
                // 会话创建失败时不留下孤立的刷新令牌
                self.tokens
                    .revoke_by_id(&account.id, &pair.refresh_token_id)
                    .await?;
                return Err(e);
            }
        };

        tracing::info!(
            user_id = %account.id,
            session_id = %session.session_id,
            client_ip,
            "Login succeeded"
        );

        Ok(LoginResponse {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            expires_in: pair.expires_in,
            session_id: session.session_id,
            user: AccountResponse::from(account),
        })
    }

    /// 刷新令牌：旧令牌作废，会话改为指向新令牌
    pub async fn refresh(
        &self,
        refresh_token: &str,
        client: &ClientInfo,
    ) -> Result<TokenPair, AppError> {
        let previous = self.tokens.peek_refresh(refresh_token);

        let pair = match self.tokens.rotate(refresh_token, client.into()).await? {
            RotateOutcome::Rotated(pair) => pair,
            RotateOutcome::Invalid => return Err(AppError::Unauthorized),
        };

        if let Some((user_id, old_id)) = previous {
            let account = self.accounts.find_by_id(&user_id).await?;
            if account.as_ref().map_or(true, |a| a.locked) {
                self.tokens.revoke_by_id(&user_id, &pair.refresh_token_id).await?;
                return Err(AppError::authorization("Account is locked"));
            }

            self.sessions
                .relink_refresh_token(&user_id, &old_id, pair.refresh_token_id)
                .await?;
        }

        Ok(pair)
    }

    /// 登出：撤销刷新令牌及其所属会话
    pub async fn logout(&self, user_id: &Uuid, refresh_token: &str) -> Result<bool, AppError> {
        let Some((owner, token_id)) = self.tokens.peek_refresh(refresh_token) else {
            return Ok(false);
        };
        if owner != *user_id {
            return Ok(false);
        }

        let session = self.sessions.find_by_refresh_token(user_id, &token_id).await?;
        let revoked = self.tokens.revoke(user_id, refresh_token).await?;
        if let Some(session) = session {
            self.sessions.revoke_session(user_id, &session.id).await?;
        }

        tracing::info!(user_id = %user_id, "Logged out");
        Ok(revoked)
    }

    /// 从所有设备登出
    pub async fn logout_all(&self, user_id: &Uuid) -> Result<u64, AppError> {
        let tokens = self.tokens.revoke_all(user_id).await?;
        let sessions = self.sessions.revoke_all_sessions(user_id).await?;

        tracing::info!(user_id = %user_id, tokens, sessions, "Logged out from all devices");
        Ok(tokens)
    }

    /// 当前账户信息
    pub async fn current_account(&self, user_id: &Uuid) -> Result<AccountResponse, AppError> {
        self.accounts
            .find_by_id(user_id)
            .await?
            .map(AccountResponse::from)
            .ok_or_else(|| AppError::not_found("account"))
    }

    /// 检查账户状态
    fn check_account_status(&self, account: &Account) -> Result<(), AppError> {
        if account.locked {
            tracing::warn!(target: AUDIT_TARGET, user_id = %account.id, "Login rejected: account locked");
            return Err(AppError::authorization("Account is locked"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::auth::LoginRequest, store::Store};

    struct Fixture {
        auth: AuthService,
        sessions: Arc<SessionPolicy>,
        mfa: Arc<MfaService>,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(AppConfig::for_testing());
        let store = Store::in_memory();
        let hasher = PasswordHasher::from_config(&config.security).unwrap();
        let accounts = AccountRepository::new(store.clone());
        let tokens = Arc::new(TokenService::from_config(&config, store.clone()).unwrap());
        let mfa = Arc::new(MfaService::new(
            store.clone(),
            accounts.clone(),
            hasher.clone(),
            config.mfa.issuer.clone(),
        ));
        let sessions = Arc::new(SessionPolicy::new(
            store,
            tokens.clone(),
            accounts.clone(),
            &config.session,
        ));

        Fixture {
            auth: AuthService::new(config, accounts, hasher, tokens, mfa.clone(), sessions.clone()),
            sessions,
            mfa,
        }
    }

    fn register_req() -> RegisterRequest {
        RegisterRequest {
            email: "user@example.com".to_string(),
            password: "Password123".to_string(),
        }
    }

    fn login_req(password: &str, mfa_code: Option<&str>) -> LoginRequest {
        LoginRequest {
            email: "user@example.com".to_string(),
            password: password.to_string(),
            mfa_code: mfa_code.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_register_enforces_policy() {
        let f = fixture();
        let weak = RegisterRequest {
            password: "short".to_string(),
            ..register_req()
        };
        assert_eq!(f.auth.register(weak).await.unwrap_err().code(), 400);

        let account = f.auth.register(register_req()).await.unwrap();
        assert_eq!(account.role, ROLE_CLIENT);
        assert!(f.auth.register(register_req()).await.is_err());
    }

    #[tokio::test]
    async fn test_login_creates_session() {
        let f = fixture();
        let account = f.auth.register(register_req()).await.unwrap();

        let login = f
            .auth
            .login(login_req("Password123", None), &ClientInfo::default())
            .await
            .unwrap();
        assert_eq!(login.expires_in, 900);
        assert_eq!(login.user.id, account.id);

        let validation = f.sessions.validate_session(&login.session_id).await.unwrap();
        assert!(validation.is_valid);
        assert_eq!(validation.user_id, Some(account.id));
    }

    #[tokio::test]
    async fn test_login_rejects_bad_credentials() {
        let f = fixture();
        f.auth.register(register_req()).await.unwrap();

        let wrong = f
            .auth
            .login(login_req("WrongPassword1", None), &ClientInfo::default())
            .await
            .unwrap_err();
        assert_eq!(wrong.code(), 401);

        let unknown = LoginRequest {
            email: "nobody@example.com".to_string(),
            ..login_req("Password123", None)
        };
        let err = f.auth.login(unknown, &ClientInfo::default()).await.unwrap_err();
        assert_eq!(err.code(), 401);
    }

    #[tokio::test]
    async fn test_login_requires_mfa_when_enabled() {
        let f = fixture();
        let account = f.auth.register(register_req()).await.unwrap();
        let enrollment = f.mfa.enroll(&account.id, &account.email).await.unwrap();
        let code = crate::mfa::totp::build_totp(&enrollment.secret, "SecurityCore", &account.email)
            .unwrap()
            .generate(chrono::Utc::now().timestamp() as u64);
        assert!(f.mfa.enable(&account.id, &code).await.unwrap());

        let missing = f
            .auth
            .login(login_req("Password123", None), &ClientInfo::default())
            .await
            .unwrap_err();
        assert_eq!(missing.code(), 401);

        let backup = enrollment.backup_codes[0].clone();
        assert!(f
            .auth
            .login(login_req("Password123", Some(&backup)), &ClientInfo::default())
            .await
            .is_ok());
        // 备用码只能使用一次
        assert!(f
            .auth
            .login(login_req("Password123", Some(&backup)), &ClientInfo::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_refresh_relinks_session_and_logout_revokes_it() {
        let f = fixture();
        let account = f.auth.register(register_req()).await.unwrap();
        let login = f
            .auth
            .login(login_req("Password123", None), &ClientInfo::default())
            .await
            .unwrap();

        let pair = f
            .auth
            .refresh(&login.refresh_token, &ClientInfo::default())
            .await
            .unwrap();
        assert_ne!(pair.refresh_token, login.refresh_token);
        assert!(f
            .auth
            .refresh(&login.refresh_token, &ClientInfo::default())
            .await
            .is_err());

        let session = f
            .sessions
            .find_by_refresh_token(&account.id, &pair.refresh_token_id)
            .await
            .unwrap();
        assert_eq!(session.map(|s| s.id), Some(login.session_id));
    }

    #[tokio::test]
    async fn test_logout_revokes_session() {
        let f = fixture();
        let account = f.auth.register(register_req()).await.unwrap();
        let login = f
            .auth
            .login(login_req("Password123", None), &ClientInfo::default())
            .await
            .unwrap();

        assert!(f.auth.logout(&account.id, &login.refresh_token).await.unwrap());
        assert!(!f.sessions.validate_session(&login.session_id).await.unwrap().is_valid);
        assert!(f
            .auth
            .refresh(&login.refresh_token, &ClientInfo::default())
            .await
            .is_err());
        // 他人的令牌无法登出
        assert!(!f.auth.logout(&Uuid::new_v4(), &login.refresh_token).await.unwrap());
    }

    #[tokio::test]
    async fn test_locked_account_cannot_login_or_refresh() {
        let f = fixture();
        let account = f.auth.register(register_req()).await.unwrap();
        let login = f
            .auth
            .login(login_req("Password123", None), &ClientInfo::default())
            .await
            .unwrap();

        f.sessions.lock_account(&account.id, "fraud").await.unwrap();

        let err = f
            .auth
            .login(login_req("Password123", None), &ClientInfo::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), 403);
        assert!(f
            .auth
            .refresh(&login.refresh_token, &ClientInfo::default())
            .await
            .is_err());
    }
}
