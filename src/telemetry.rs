//! 日志与审计事件
//!
//! 安全事件（登录失败、令牌重放、筛查拦截、黑名单变更）统一写到
//! [`AUDIT_TARGET`]，无论全局日志级别如何都保留在 info 级别，
//! 方便单独采集。

use crate::config::AppConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// 安全审计事件的日志 target
pub const AUDIT_TARGET: &str = "security_audit";

/// 依赖库噪声较大，只保留警告
const QUIET_DEPENDENCIES: &[&str] = &["sqlx", "hyper", "reqwest"];

/// 由配置的日志级别生成过滤指令
///
/// 审计 target 至少为 info；依赖库不低于 warn
pub fn filter_directives(level: &str) -> String {
    let level = level.to_lowercase();
    let audit_level = match level.as_str() {
        "warn" | "error" => "info",
        other => other,
    };

    let mut directives = vec![level.clone(), format!("{}={}", AUDIT_TARGET, audit_level)];
    let dependency_level = match level.as_str() {
        "error" => "error",
        _ => "warn",
    };
    directives.extend(
        QUIET_DEPENDENCIES
            .iter()
            .map(|dep| format!("{}={}", dep, dependency_level)),
    );
    directives.join(",")
}

/// 初始化日志系统
///
/// `RUST_LOG` 存在时完全覆盖配置的级别
pub fn init_telemetry(config: &AppConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(&config.logging.level)));

    // 审计事件依赖 target 区分，两种格式都输出 target
    let log_layer = match config.logging.format.to_lowercase().as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(log_layer)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        level = %config.logging.level,
        format = %config.logging.format,
        audit_target = AUDIT_TARGET,
        "Security core telemetry initialized"
    );
}
