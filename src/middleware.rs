//! HTTP 中间件
//! 应用状态、请求追踪、请求安全筛查

use crate::{
    alerting::AlertNotifier,
    auth::{jwt::TokenService, password::PasswordHasher},
    config::{AppConfig, SecurityConfig},
    csrf::CsrfGuard,
    error::AppError,
    mfa::MfaService,
    repository::AccountRepository,
    screen::{headers, patterns, BlockReason, ScreenDecision, ScreenRequest, SecurityScreen},
    services::{AuthService, ClientInfo, SessionPolicy},
    store::Store,
};
use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sqlx::PgPool;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

/// 携带 CSRF 令牌的请求头
pub const CSRF_HEADERS: &[&str] = &["x-csrf-token", "csrf-token"];
/// 表单提交时的 CSRF 字段
pub const CSRF_FORM_FIELD: &str = "csrf_token";

/// 应用状态
///
/// 所有服务显式构造后注入，通过 Arc 在请求间共享
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Store,
    /// 仅在配置了数据库时存在（用于就绪检查）
    pub db: Option<PgPool>,
    pub tokens: Arc<TokenService>,
    pub accounts: AccountRepository,
    pub hasher: PasswordHasher,
    pub mfa: Arc<MfaService>,
    pub csrf: Arc<CsrfGuard>,
    pub screen: Arc<SecurityScreen>,
    pub sessions: Arc<SessionPolicy>,
    pub auth_service: Arc<AuthService>,
    pub alerts: AlertNotifier,
}

impl AppState {
    /// 按依赖顺序构造全部服务
    pub fn build(config: AppConfig, store: Store, db: Option<PgPool>) -> Result<Arc<Self>, AppError> {
        let config = Arc::new(config);

        let hasher = PasswordHasher::from_config(&config.security)?;
        let accounts = AccountRepository::new(store.clone());
        let tokens = Arc::new(TokenService::from_config(&config, store.clone())?);
        let alerts = AlertNotifier::from_config(&config.alerting);
        let csrf = Arc::new(CsrfGuard::new(store.clone(), &config.csrf));
        let screen = Arc::new(SecurityScreen::new(&config.screen, csrf.clone(), alerts.clone()));
        let mfa = Arc::new(MfaService::new(
            store.clone(),
            accounts.clone(),
            hasher.clone(),
            config.mfa.issuer.clone(),
        ));
        let sessions = Arc::new(SessionPolicy::new(
            store.clone(),
            tokens.clone(),
            accounts.clone(),
            &config.session,
        ));
        let auth_service = Arc::new(AuthService::new(
            config.clone(),
            accounts.clone(),
            hasher.clone(),
            tokens.clone(),
            mfa.clone(),
            sessions.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            store,
            db,
            tokens,
            accounts,
            hasher,
            mfa,
            csrf,
            screen,
            sessions,
            auth_service,
            alerts,
        }))
    }
}

/// 请求追踪中间件
/// 为每个请求生成 trace_id 和 request_id，并记录指标
pub async fn request_tracking_middleware(req: Request, next: Next) -> Response {
    let trace_id = extract_or_generate_trace_id(req.headers());
    let request_id = Uuid::new_v4().to_string();

    let method = req.method().clone();
    let uri = req.uri().path().to_string();

    let span = tracing::info_span!(
        "http_request",
        trace_id = %trace_id,
        request_id = %request_id,
        method = %method,
        uri = %uri,
    );

    async move {
        let start = Instant::now();
        let mut response = next.run(req).await;
        let elapsed = start.elapsed();

        // 指标标签只使用有限取值
        let status = response.status().as_u16();
        let method_name = match method.as_str() {
            "GET" => "GET",
            "POST" => "POST",
            "PUT" => "PUT",
            "DELETE" => "DELETE",
            "PATCH" => "PATCH",
            _ => "OTHER",
        };
        let status_class = match status {
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            _ => "5xx",
        };

        metrics::counter!("http_requests_total", "method" => method_name, "status" => status_class)
            .increment(1);
        metrics::histogram!("http_request_duration_seconds").record(elapsed.as_secs_f64());

        tracing::info!(
            method = %method,
            uri = %uri,
            status,
            elapsed_ms = elapsed.as_millis() as u64,
            "Request completed"
        );

        if let Ok(value) = HeaderValue::from_str(&trace_id) {
            response.headers_mut().insert("x-trace-id", value);
        }
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert("x-request-id", value);
        }

        response
    }
    .instrument(span)
    .await
}

/// 从请求头中提取或生成 trace_id
fn extract_or_generate_trace_id(headers: &HeaderMap) -> String {
    headers
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty() && s.len() <= 128)
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// 获取客户端 IP 地址
///
/// 只有连接来自受信任代理时才读取转发头：从 X-Forwarded-For 最右侧向左跳过
/// 受信任代理，取第一个不受信任的地址；没有转发链时使用 X-Real-IP。
/// 其余情况一律使用连接地址
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, security: &SecurityConfig) -> String {
    let Some(peer) = peer.map(|addr| addr.ip()) else {
        return "unknown".to_string();
    };
    if !security.is_trusted_proxy(peer) {
        return peer.to_string();
    }

    let hops = patterns::forwarded_hops(headers);
    if hops.is_empty() {
        return headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
            .unwrap_or(peer)
            .to_string();
    }

    let mut resolved = peer;
    for hop in hops.iter().rev() {
        let Ok(ip) = hop.parse::<IpAddr>() else {
            // 链上出现无法解析的地址，不再向左信任
            return resolved.to_string();
        };
        resolved = ip;
        if !security.is_trusted_proxy(ip) {
            break;
        }
    }
    resolved.to_string()
}

fn peer_addr(extensions: &axum::http::Extensions) -> Option<SocketAddr> {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

// 在 handler 中直接提取请求来源
impl FromRequestParts<Arc<AppState>> for ClientInfo {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let ip = client_ip(
            &parts.headers,
            peer_addr(&parts.extensions),
            &state.config.security,
        );
        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(ClientInfo {
            ip_address: Some(ip),
            user_agent,
        })
    }
}

/// 从请求头或 urlencoded 表单中取 CSRF 令牌
fn extract_csrf_token(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    let from_header = CSRF_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .find(|v| !v.is_empty());
    if let Some(token) = from_header {
        return Some(token.to_string());
    }

    let is_form = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
    if !is_form {
        return None;
    }

    std::str::from_utf8(body)
        .ok()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == CSRF_FORM_FIELD)
        .and_then(|(_, value)| {
            urlencoding::decode(&value.replace('+', " "))
                .ok()
                .map(|decoded| decoded.into_owned())
        })
        .filter(|value| !value.is_empty())
}

/// 筛查拒绝 → 错误信封
fn blocked_response(decision: ScreenDecision) -> Response {
    let error = match decision.reason {
        Some(BlockReason::RateLimited) => AppError::RateLimitExceeded,
        Some(BlockReason::Threat) => AppError::ThreatBlocked {
            reason: BlockReason::Threat.as_str().to_string(),
            threats: decision.threats,
        },
        Some(BlockReason::BlockedIp) => AppError::authorization("IP address is blocked"),
        Some(BlockReason::Csrf) => AppError::authorization("Missing or invalid CSRF token"),
        Some(BlockReason::PayloadTooLarge) => AppError::PayloadTooLarge,
        Some(BlockReason::StalledBody) => AppError::timeout("request body not received in time"),
        Some(BlockReason::Internal) | None => {
            AppError::Unavailable("security screen unavailable".to_string())
        }
    };

    let mut response = error.into_response();
    headers::apply(response.headers_mut());
    if let Some(retry_after) = decision.retry_after {
        let secs = retry_after.as_secs().max(1);
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

/// 请求安全筛查中间件
///
/// 在超时内缓冲请求体，运行筛查流水线；放行时把请求体交还给后续处理，
/// 并在响应上追加安全头和新的 CSRF 令牌
pub async fn security_screen_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let screen = &state.screen;
    let ip = client_ip(
        req.headers(),
        peer_addr(req.extensions()),
        &state.config.security,
    );

    // 黑名单在读取请求体之前判定
    if screen.is_denied(&ip, req.headers()) {
        return blocked_response(screen.reject_blocked_ip(&ip));
    }

    let (parts, body) = req.into_parts();
    let read = tokio::time::timeout(
        screen.body_read_timeout(),
        axum::body::to_bytes(body, screen.max_body_bytes()),
    )
    .await;

    let bytes = match read {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            tracing::debug!(client_ip = %ip, error = %e, "Request body rejected while reading");
            return blocked_response(screen.reject_oversized_body(&ip));
        }
        Err(_) => return blocked_response(screen.reject_stalled_body(&ip)),
    };

    let csrf_token = extract_csrf_token(&parts.headers, &bytes);
    let uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| parts.uri.path())
        .to_string();

    let decision = screen
        .screen(&ScreenRequest {
            method: &parts.method,
            uri: &uri,
            headers: &parts.headers,
            body: &bytes,
            client_ip: &ip,
            csrf_token: csrf_token.as_deref(),
        })
        .await;

    if !decision.allowed {
        return blocked_response(decision);
    }

    let mut response = next.run(Request::from_parts(parts, Body::from(bytes))).await;
    headers::apply(response.headers_mut());
    if let Some(token) = decision.csrf_token {
        if let Ok(value) = HeaderValue::from_str(&token) {
            response.headers_mut().insert("x-csrf-token", value);
        }
    }
    response
}
