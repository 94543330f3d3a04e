//! 会话管理处理器

use crate::{
    auth::middleware::AuthContext, error::AppError, middleware::AppState,
    response::ApiResponse, services::Session,
};
use axum::extract::{Path, State};
use std::sync::Arc;
use uuid::Uuid;

/// 当前用户的活动会话
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
) -> Result<ApiResponse<Vec<Session>>, AppError> {
    let sessions = state.sessions.list_sessions(&auth_context.user_id).await?;
    Ok(ApiResponse::success("Active sessions", sessions))
}

/// 撤销自己的某个会话
pub async fn revoke_session(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Path(session_id): Path<Uuid>,
) -> Result<ApiResponse<()>, AppError> {
    if !state
        .sessions
        .revoke_session(&auth_context.user_id, &session_id)
        .await?
    {
        return Err(AppError::not_found("session"));
    }
    Ok(ApiResponse::message("Session revoked"))
}
