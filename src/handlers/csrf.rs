//! CSRF 令牌签发

use axum::extract::State;
use serde::Serialize;
use std::sync::Arc;

use crate::{
    error::AppError, middleware::AppState, response::ApiResponse, services::ClientInfo,
};

#[derive(Serialize)]
pub struct CsrfTokenResponse {
    pub csrf_token: String,
    pub expires_in: u64,
}

/// 为当前客户端签发有状态 CSRF 令牌
pub async fn issue_csrf_token(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
) -> Result<ApiResponse<CsrfTokenResponse>, AppError> {
    let client_key = client.ip_address.as_deref().unwrap_or("unknown");
    let csrf_token = state.csrf.issue_tracked(client_key).await?;

    Ok(ApiResponse::success(
        "CSRF token issued",
        CsrfTokenResponse {
            csrf_token,
            expires_in: state.config.csrf.token_ttl_secs,
        },
    ))
}
