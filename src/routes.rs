//! 路由注册
//! 创建所有 API 路由并应用中间件

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use crate::{
    auth::middleware::{admin_only_middleware, jwt_auth_middleware, mfa_gate_middleware},
    handlers,
    middleware::{request_tracking_middleware, security_screen_middleware, AppState},
};

/// 创建应用路由
pub fn create_router(state: Arc<AppState>) -> Router {
    // 公开端点（健康检查、CSRF 令牌）
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route(
            "/api/health",
            get(handlers::health::health_check).post(handlers::health::health_check),
        )
        .route("/ready", get(handlers::health::readiness_check))
        .route("/api/csrf-token", get(handlers::csrf::issue_csrf_token));

    // 认证路由（无需认证）
    let auth_routes = Router::new()
        .route("/api/auth/register", post(handlers::auth::register))
        .route("/api/auth/login", post(handlers::auth::login))
        .route("/api/auth/refresh", post(handlers::auth::refresh_token));

    // 需要认证的路由
    let authenticated_routes = Router::new()
        .route("/api/auth/logout", post(handlers::auth::logout))
        .route(
            "/api/user",
            get(handlers::user::get_current_user).post(handlers::user::update_profile),
        )
        // MFA
        .route("/api/mfa/enroll", post(handlers::mfa::enroll))
        .route("/api/mfa/enable", post(handlers::mfa::enable))
        .route("/api/mfa/verify", post(handlers::mfa::verify))
        .route("/api/mfa/disable", post(handlers::mfa::disable))
        .route("/api/mfa/status", get(handlers::mfa::status))
        // 会话
        .route("/api/sessions", get(handlers::session::list_sessions))
        .route("/api/sessions/{id}", delete(handlers::session::revoke_session))
        .route_layer(from_fn_with_state(state.tokens.clone(), jwt_auth_middleware));

    // 提升操作：启用 MFA 的账户需携带验证码
    let elevated_routes = Router::new()
        .route("/api/auth/logout-all", post(handlers::auth::logout_all))
        .route_layer(from_fn_with_state(state.mfa.clone(), mfa_gate_middleware))
        .route_layer(from_fn_with_state(state.tokens.clone(), jwt_auth_middleware));

    // 管理员路由
    let admin_routes = Router::new()
        .route(
            "/api/admin/ip-blocks",
            get(handlers::admin::list_blocked_ips).post(handlers::admin::block_ip),
        )
        .route("/api/admin/ip-blocks/{ip}", delete(handlers::admin::unblock_ip))
        .route("/api/admin/threats", get(handlers::admin::list_threats))
        .route("/api/admin/accounts/{id}/lock", post(handlers::admin::lock_account))
        .route("/api/admin/accounts/{id}/unlock", post(handlers::admin::unlock_account))
        .route(
            "/api/admin/users/{id}/revoke-tokens",
            post(handlers::admin::revoke_user_tokens),
        )
        .route_layer(from_fn_with_state(state.mfa.clone(), mfa_gate_middleware))
        .route_layer(from_fn(admin_only_middleware))
        .route_layer(from_fn_with_state(state.tokens.clone(), jwt_auth_middleware));

    // 组合所有路由；安全筛查与请求追踪在最外层
    Router::new()
        .merge(public_routes)
        .merge(auth_routes)
        .merge(authenticated_routes)
        .merge(elevated_routes)
        .merge(admin_routes)
        .layer(from_fn_with_state(state.clone(), security_screen_middleware))
        .layer(from_fn(request_tracking_middleware))
        .with_state(state)
}
