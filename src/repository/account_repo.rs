//! Account repository (键值存储访问层)

use crate::{
    auth::password::PasswordHasher,
    error::AppError,
    models::account::Account,
    store::{Store, StoreError},
};
use chrono::Utc;
use uuid::Uuid;

const ACCOUNT_PREFIX: &str = "account:";
const EMAIL_INDEX_PREFIX: &str = "account-email:";

#[derive(Clone)]
pub struct AccountRepository {
    store: Store,
}

impl AccountRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn account_key(id: &Uuid) -> String {
        format!("{ACCOUNT_PREFIX}{id}")
    }

    fn email_key(email: &str) -> String {
        format!("{EMAIL_INDEX_PREFIX}{}", normalize_email(email))
    }

    /// 创建账户
    pub async fn create(
        &self,
        email: &str,
        password_hash: &str,
        role: &str,
    ) -> Result<Account, AppError> {
        let email = normalize_email(email);
        if self.store.get::<Uuid>(&Self::email_key(&email)).await?.is_some() {
            return Err(AppError::validation("Email already registered"));
        }

        let now = Utc::now();
        let account = Account {
            id: Uuid::new_v4(),
            email: email.clone(),
            password_hash: password_hash.to_string(),
            role: role.to_string(),
            locked: false,
            locked_reason: None,
            locked_at: None,
            created_at: now,
            updated_at: now,
        };

        self.store
            .put(&Self::account_key(&account.id), &account, None)
            .await?;
        self.store
            .put(&Self::email_key(&email), &account.id, None)
            .await?;

        tracing::info!(user_id = %account.id, role = %account.role, "Account created");
        Ok(account)
    }

    /// 根据 ID 查找账户
    pub async fn find_by_id(&self, id: &Uuid) -> Result<Option<Account>, StoreError> {
        self.store.get(&Self::account_key(id)).await
    }

    /// 根据邮箱查找账户
    pub async fn find_by_email(&self, email: &str) -> Result<Option<Account>, StoreError> {
        match self.store.get::<Uuid>(&Self::email_key(email)).await? {
            Some(id) => self.find_by_id(&id).await,
            None => Ok(None),
        }
    }

    /// 校验账户密码；账户不存在时返回 false
    pub async fn verify_password(
        &self,
        hasher: &PasswordHasher,
        id: &Uuid,
        password: &str,
    ) -> Result<bool, AppError> {
        let Some(account) = self.find_by_id(id).await? else {
            return Ok(false);
        };
        hasher
            .verify_blocking(password.to_string(), account.password_hash)
            .await
    }

    /// 设置锁定状态；状态未变化时返回 false
    pub async fn set_locked(
        &self,
        id: &Uuid,
        locked: bool,
        reason: Option<&str>,
    ) -> Result<bool, StoreError> {
        let Some(account) = self.find_by_id(id).await? else {
            return Ok(false);
        };

        let now = Utc::now();
        let updated = Account {
            locked,
            locked_reason: reason.map(str::to_string).filter(|_| locked),
            locked_at: locked.then_some(now),
            updated_at: now,
            ..account
        };

        self.store
            .update_if(
                &Self::account_key(id),
                |current: &Account| current.locked != locked,
                &updated,
            )
            .await
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
