//! MFA 处理器

use crate::{
    auth::middleware::AuthContext,
    error::AppError,
    mfa::{MfaEnrollment, MfaVerification},
    middleware::AppState,
    models::mfa::*,
    response::ApiResponse,
};
use axum::{extract::State, Json};
use std::sync::Arc;
use validator::Validate;

/// 开始注册：返回密钥、otpauth URI 和备用码（仅此一次）
pub async fn enroll(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
) -> Result<ApiResponse<MfaEnrollment>, AppError> {
    let enrollment = state
        .mfa
        .enroll(&auth_context.user_id, &auth_context.email)
        .await?;
    Ok(ApiResponse::created("MFA enrollment started", enrollment))
}

/// 用一个有效验证码启用 MFA
pub async fn enable(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Json(req): Json<MfaCodeRequest>,
) -> Result<ApiResponse<()>, AppError> {
    req.validate()?;

    if !state.mfa.enable(&auth_context.user_id, &req.code).await? {
        return Err(AppError::validation("Invalid MFA code"));
    }
    Ok(ApiResponse::message("MFA enabled"))
}

/// 校验验证码（TOTP 或备用码）
pub async fn verify(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Json(req): Json<MfaCodeRequest>,
) -> Result<ApiResponse<MfaVerification>, AppError> {
    req.validate()?;

    let verification = state.mfa.verify(&auth_context.user_id, &req.code).await?;
    if !verification.is_valid {
        return Err(AppError::authentication("Invalid MFA code"));
    }
    Ok(ApiResponse::success("MFA code accepted", verification))
}

/// 停用 MFA（需要重新输入密码）
pub async fn disable(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Json(req): Json<MfaDisableRequest>,
) -> Result<ApiResponse<()>, AppError> {
    req.validate()?;

    state
        .mfa
        .disable(&auth_context.user_id, &req.password)
        .await?;
    Ok(ApiResponse::message("MFA disabled"))
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
) -> Result<ApiResponse<MfaStatusResponse>, AppError> {
    let enabled = state.mfa.is_enabled(&auth_context.user_id).await?;
    let backup_codes_remaining = state
        .mfa
        .backup_codes_remaining(&auth_context.user_id)
        .await?;

    Ok(ApiResponse::success(
        "MFA status",
        MfaStatusResponse {
            enabled,
            backup_codes_remaining,
        },
    ))
}
