//! 当前用户处理器

use crate::{
    auth::middleware::AuthContext,
    error::AppError,
    middleware::AppState,
    models::{account::AccountResponse, auth::ProfileUpdate},
    response::ApiResponse,
};
use axum::{extract::State, Json};
use std::sync::Arc;
use validator::Validate;

/// 获取当前用户信息
pub async fn get_current_user(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
) -> Result<ApiResponse<AccountResponse>, AppError> {
    let account = state
        .auth_service
        .current_account(&auth_context.user_id)
        .await?;
    Ok(ApiResponse::success("Current user", account))
}

/// 更新资料（原样返回，受 CSRF 保护）
pub async fn update_profile(
    auth_context: AuthContext,
    Json(req): Json<ProfileUpdate>,
) -> Result<ApiResponse<ProfileUpdate>, AppError> {
    req.validate()?;

    tracing::debug!(user_id = %auth_context.user_id, "Profile updated");
    Ok(ApiResponse::success("Profile updated", req))
}
