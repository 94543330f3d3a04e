//! 统一错误模型
//! 定义所有错误类型和错误响应格式

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{response::ApiResponse, screen::ThreatRecord, store::StoreError};

/// 结果类型别名
pub type Result<T> = std::result::Result<T, AppError>;

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Validation failed")]
    InvalidFields(serde_json::Value),

    #[error("Authentication failed")]
    Unauthorized,

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Access denied")]
    Forbidden,

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Request blocked: {reason}")]
    ThreatBlocked {
        reason: String,
        threats: Vec<ThreatRecord>,
    },

    #[error("Payload too large")]
    PayloadTooLarge,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// 获取 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::InvalidFields(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized | AppError::Authentication(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden | AppError::Authorization(_) => StatusCode::FORBIDDEN,
            AppError::ThreatBlocked { .. } => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            AppError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            AppError::Storage(_) | AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Config(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 获取用户友好的错误消息（不包含敏感信息）
    pub fn user_message(&self) -> String {
        match self {
            AppError::Validation(msg) => msg.clone(),
            AppError::InvalidFields(_) => "Validation failed".to_string(),
            AppError::Unauthorized => "Authentication failed".to_string(),
            AppError::Authentication(msg) => msg.clone(),
            AppError::Forbidden => "Access denied".to_string(),
            AppError::Authorization(msg) => msg.clone(),
            AppError::NotFound(msg) => format!("Resource not found: {}", msg),
            AppError::RateLimitExceeded => "Rate limit exceeded".to_string(),
            AppError::ThreatBlocked { .. } => "Request blocked by security policy".to_string(),
            AppError::PayloadTooLarge => "Payload too large".to_string(),
            AppError::Timeout(msg) => format!("Request timeout: {}", msg),
            AppError::Storage(_) | AppError::Unavailable(_) => {
                "Service temporarily unavailable".to_string()
            }
            AppError::Config(_) => "Configuration error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> u16 {
        self.status_code().as_u16()
    }

    /// 是否可重试（基础设施错误）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Storage(_) | AppError::Timeout(_) | AppError::Unavailable(_)
        )
    }

    // 便捷方法
    pub fn not_found(msg: &str) -> Self {
        AppError::NotFound(msg.to_string())
    }

    pub fn validation(msg: &str) -> Self {
        AppError::Validation(msg.to_string())
    }

    pub fn authentication(msg: &str) -> Self {
        AppError::Authentication(msg.to_string())
    }

    pub fn authorization(msg: &str) -> Self {
        AppError::Authorization(msg.to_string())
    }

    pub fn internal_error(msg: &str) -> Self {
        AppError::Internal(msg.to_string())
    }

    pub fn timeout(msg: &str) -> Self {
        AppError::Timeout(msg.to_string())
    }

    /// 错误详情（放入信封的 errors 字段）
    fn details(&self) -> Option<serde_json::Value> {
        match self {
            AppError::InvalidFields(fields) => Some(fields.clone()),
            AppError::ThreatBlocked { reason, threats } => Some(serde_json::json!({
                "reason": reason,
                "threats": threats,
            })),
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let envelope = ApiResponse::error(status, self.user_message(), self.details());

        // 记录错误日志
        if status.is_server_error() {
            if let AppError::Storage(_) = &self {
                metrics::counter!("storage_errors_total").increment(1);
            }
            tracing::error!(
                code = self.code(),
                message = %self,
                request_id = %envelope.metadata.request_id,
                "Application error"
            );
        } else {
            tracing::debug!(
                code = self.code(),
                message = %self,
                request_id = %envelope.metadata.request_id,
                "Request rejected"
            );
        }

        envelope.into_response()
    }
}

/// 从 config::ConfigError 转换
impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

/// 从 validator::ValidationErrors 转换
impl From<validator::ValidationErrors> for AppError {
    fn from(e: validator::ValidationErrors) -> Self {
        let fields: Vec<serde_json::Value> = e
            .field_errors()
            .iter()
            .map(|(field, errors)| {
                serde_json::json!({
                    "field": field.to_string(),
                    "codes": errors.iter().map(|err| err.code.to_string()).collect::<Vec<_>>(),
                })
            })
            .collect();
        AppError::InvalidFields(serde_json::Value::Array(fields))
    }
}
