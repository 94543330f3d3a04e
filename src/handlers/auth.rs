//! 认证相关的 HTTP 处理器

use crate::{
    auth::{jwt::TokenPair, middleware::AuthContext},
    error::AppError,
    middleware::AppState,
    models::{account::AccountResponse, auth::*},
    response::ApiResponse,
    services::ClientInfo,
};
use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use validator::Validate;

/// 注册
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<ApiResponse<AccountResponse>, AppError> {
    req.validate()?;

    let account = state.auth_service.register(req).await?;
    Ok(ApiResponse::created("Account registered", account))
}

/// 登录
pub async fn login(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    Json(req): Json<LoginRequest>,
) -> Result<ApiResponse<LoginResponse>, AppError> {
    req.validate()?;

    let response = state.auth_service.login(req, &client).await?;
    Ok(ApiResponse::success("Login successful", response))
}

/// 刷新令牌
pub async fn refresh_token(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    Json(req): Json<RefreshTokenRequest>,
) -> Result<ApiResponse<TokenPair>, AppError> {
    req.validate()?;

    let pair = state
        .auth_service
        .refresh(&req.refresh_token, &client)
        .await?;
    Ok(ApiResponse::success("Token refreshed", pair))
}

/// 登出
pub async fn logout(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Json(req): Json<LogoutRequest>,
) -> Result<ApiResponse<()>, AppError> {
    req.validate()?;

    state
        .auth_service
        .logout(&auth_context.user_id, &req.refresh_token)
        .await?;
    Ok(ApiResponse::message("Logged out"))
}

/// 从所有设备登出
pub async fn logout_all(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
) -> Result<ApiResponse<Value>, AppError> {
    let revoked = state.auth_service.logout_all(&auth_context.user_id).await?;

    Ok(ApiResponse::success(
        format!("Logged out from {} devices", revoked),
        json!({ "revoked_tokens": revoked }),
    ))
}
