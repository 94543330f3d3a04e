//! JWT 认证中间件

use crate::{
    auth::jwt::TokenService, error::AppError, mfa::MfaService, models::account::ROLE_ADMIN,
    telemetry::AUDIT_TARGET,
};
use axum::{
    extract::{FromRequestParts, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use uuid::Uuid;

/// 提升操作所需的 MFA 验证码请求头
pub const MFA_CODE_HEADER: &str = "x-mfa-code";

/// 认证上下文（附加到请求扩展）
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub email: String,
    pub role: String,
}

impl AuthContext {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }
}

// 实现 FromRequestParts 以便在 handler 中直接提取 AuthContext
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or(AppError::Unauthorized)
    }
}

/// 从 Authorization 头提取令牌
pub fn extract_token(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(AppError::Unauthorized)
}

/// JWT 认证中间件 - 必须认证
/// 只校验签名与过期时间，不访问存储
pub async fn jwt_auth_middleware(
    State(tokens): State<Arc<TokenService>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_token(req.headers())?;

    let claims = tokens
        .verify_access(&token)
        .into_claims()
        .ok_or(AppError::Unauthorized)?;

    let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AppError::Unauthorized)?;
    req.extensions_mut().insert(AuthContext {
        user_id,
        email: claims.email,
        role: claims.role,
    });

    Ok(next.run(req).await)
}

/// 管理员权限中间件（需在 jwt_auth_middleware 之后）
pub async fn admin_only_middleware(req: Request, next: Next) -> Result<Response, AppError> {
    let ctx = req
        .extensions()
        .get::<AuthContext>()
        .ok_or(AppError::Unauthorized)?;

    if !ctx.is_admin() {
        tracing::warn!(target: AUDIT_TARGET, user_id = %ctx.user_id, role = %ctx.role, "Admin route denied");
        return Err(AppError::authorization("Admin role required"));
    }

    Ok(next.run(req).await)
}

/// MFA 门禁：已启用 MFA 的账户执行提升操作时需携带验证码
pub async fn mfa_gate_middleware(
    State(mfa): State<Arc<MfaService>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let user_id = req
        .extensions()
        .get::<AuthContext>()
        .map(|ctx| ctx.user_id)
        .ok_or(AppError::Unauthorized)?;

    if mfa.is_enabled(&user_id).await? {
        let code = req
            .headers()
            .get(MFA_CODE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::authentication("MFA code required"))?;

        if !mfa.verify(&user_id, code).await?.is_valid {
            tracing::warn!(target: AUDIT_TARGET, user_id = %user_id, "Elevated action rejected: bad MFA code");
            return Err(AppError::authentication("Invalid MFA code"));
        }
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_token_valid() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer test_token_123".parse().unwrap());

        let token = extract_token(&headers).unwrap();
        assert_eq!(token, "test_token_123");
    }

    #[test]
    fn test_extract_token_missing() {
        let headers = HeaderMap::new();
        assert!(extract_token(&headers).is_err());
    }

    #[test]
    fn test_extract_token_invalid_format() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic dXNlcjpwYXNz".parse().unwrap());
        assert!(extract_token(&headers).is_err());

        headers.insert("authorization", "Bearer ".parse().unwrap());
        assert!(extract_token(&headers).is_err());
    }

    #[test]
    fn test_admin_role() {
        let ctx = AuthContext {
            user_id: Uuid::new_v4(),
            email: "a@b.com".to_string(),
            role: ROLE_ADMIN.to_string(),
        };
        assert!(ctx.is_admin());
        assert!(!AuthContext { role: "CLIENT".to_string(), ..ctx }.is_admin());
    }
}
