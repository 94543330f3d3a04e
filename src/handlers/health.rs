//! 健康检查处理器
//! 提供 /health、/api/health 和 /ready 端点

use axum::extract::State;
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::{db, middleware::AppState, response::ApiResponse};

/// 存活探针响应
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// 就绪探针响应
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub checks: Vec<HealthCheck>,
}

/// 健康检查项
#[derive(Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthCheck {
    fn healthy(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: "healthy".to_string(),
            message: None,
        }
    }

    fn healthy_with(name: &str, message: String) -> Self {
        Self {
            message: Some(message),
            ..Self::healthy(name)
        }
    }

    fn unhealthy(name: &str, message: String) -> Self {
        Self {
            name: name.to_string(),
            status: "unhealthy".to_string(),
            message: Some(message),
        }
    }
}

static APP_START_TIME: OnceLock<Instant> = OnceLock::new();

/// 设置应用启动时间（在 main.rs 中调用）
pub fn set_start_time() {
    APP_START_TIME.get_or_init(Instant::now);
}

/// 获取应用运行时间（秒）
pub fn get_uptime() -> u64 {
    APP_START_TIME
        .get()
        .map_or(0, |start| start.elapsed().as_secs())
}

/// 存活探针
/// 快速响应，不检查依赖
pub async fn health_check() -> ApiResponse<HealthResponse> {
    ApiResponse::success(
        "Service is healthy",
        HealthResponse {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: get_uptime(),
        },
    )
}

/// 就绪探针
/// 检查存储与数据库
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> ApiResponse<ReadinessResponse> {
    let mut checks = Vec::new();

    checks.push(match state.store.get::<serde_json::Value>("readiness-check").await {
        Ok(_) => HealthCheck::healthy("store"),
        Err(e) => HealthCheck::unhealthy("store", e.to_string()),
    });

    if let Some(pool) = &state.db {
        checks.push(match db::inspect(pool).await {
            Ok(snapshot) => HealthCheck::healthy_with("database", snapshot.summary()),
            Err(e) => {
                tracing::warn!(error = %e, "Readiness check against kv_entries failed");
                HealthCheck::unhealthy("database", e.to_string())
            }
        });
    }

    let ready = checks.iter().all(|c| c.status == "healthy");
    ApiResponse::success(
        if ready { "Service is ready" } else { "Service is not ready" },
        ReadinessResponse { ready, checks },
    )
}
