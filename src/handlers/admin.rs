//! 管理员处理器：IP 黑名单、威胁日志、账户锁定、令牌撤销

use crate::{
    auth::middleware::AuthContext,
    error::AppError,
    middleware::AppState,
    models::session::*,
    response::ApiResponse,
    screen::{BlockedIp, ScreenStats, ThreatRecord},
    telemetry::AUDIT_TARGET,
};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

const DEFAULT_THREAT_LIMIT: usize = 100;
const MAX_THREAT_LIMIT: usize = 1000;

#[derive(Serialize)]
pub struct ThreatsResponse {
    pub threats: Vec<ThreatRecord>,
    pub stats: ScreenStats,
}

/// 加入 IP 黑名单
pub async fn block_ip(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Json(req): Json<BlockIpRequest>,
) -> Result<ApiResponse<Value>, AppError> {
    req.validate()?;
    let ip: IpAddr = req
        .ip
        .trim()
        .parse()
        .map_err(|_| AppError::validation("Invalid IP address"))?;

    let reason = req.reason.as_deref().unwrap_or("manual");
    let added = state.screen.block_ip(&ip.to_string(), reason);

    tracing::warn!(target: AUDIT_TARGET, admin_id = %auth_context.user_id, ip = %ip, "Admin blocked IP");
    Ok(ApiResponse::created(
        "IP blocked",
        json!({ "ip": ip.to_string(), "newly_blocked": added }),
    ))
}

/// 移出 IP 黑名单
pub async fn unblock_ip(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
) -> Result<ApiResponse<()>, AppError> {
    if !state.screen.unblock_ip(ip.trim()) {
        return Err(AppError::not_found("blocked IP"));
    }
    Ok(ApiResponse::message("IP unblocked"))
}

pub async fn list_blocked_ips(State(state): State<Arc<AppState>>) -> ApiResponse<Vec<BlockedIp>> {
    ApiResponse::success("Blocked IPs", state.screen.blocked_ips())
}

/// 最近的威胁记录（新的在前）
pub async fn list_threats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ThreatQuery>,
) -> ApiResponse<ThreatsResponse> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_THREAT_LIMIT)
        .clamp(1, MAX_THREAT_LIMIT);

    ApiResponse::success(
        "Recent threats",
        ThreatsResponse {
            threats: state.screen.recent_threats(limit),
            stats: state.screen.stats(),
        },
    )
}

/// 锁定账户
pub async fn lock_account(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Path(user_id): Path<Uuid>,
    Json(req): Json<LockAccountRequest>,
) -> Result<ApiResponse<Value>, AppError> {
    req.validate()?;
    if user_id == auth_context.user_id {
        return Err(AppError::validation("Cannot lock your own account"));
    }

    let changed = state.sessions.lock_account(&user_id, &req.reason).await?;
    Ok(ApiResponse::success(
        "Account locked",
        json!({ "user_id": user_id, "changed": changed }),
    ))
}

/// 解锁账户
pub async fn unlock_account(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> Result<ApiResponse<Value>, AppError> {
    let changed = state.sessions.unlock_account(&user_id).await?;
    Ok(ApiResponse::success(
        "Account unlocked",
        json!({ "user_id": user_id, "changed": changed }),
    ))
}

/// 撤销用户的全部刷新令牌与会话
pub async fn revoke_user_tokens(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Path(user_id): Path<Uuid>,
) -> Result<ApiResponse<Value>, AppError> {
    if state.accounts.find_by_id(&user_id).await?.is_none() {
        return Err(AppError::not_found("account"));
    }

    let tokens = state.tokens.revoke_all(&user_id).await?;
    let sessions = state.sessions.revoke_all_sessions(&user_id).await?;

    tracing::warn!(
        target: AUDIT_TARGET,
        admin_id = %auth_context.user_id,
        user_id = %user_id,
        tokens,
        sessions,
        "Admin revoked user tokens"
    );
    Ok(ApiResponse::success(
        "Tokens revoked",
        json!({ "revoked_tokens": tokens, "revoked_sessions": sessions }),
    ))
}
