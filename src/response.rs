//! 统一响应信封
//! 所有 HTTP 响应都使用 `{status, message, data?, errors?, metadata}` 格式

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// 响应元数据
#[derive(Debug, Serialize)]
pub struct ResponseMetadata {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

impl ResponseMetadata {
    pub fn new() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        }
    }
}

impl Default for ResponseMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// 响应信封
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub status: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<serde_json::Value>,
    pub metadata: ResponseMetadata,
    #[serde(skip)]
    status_code: StatusCode,
}

impl<T: Serialize> ApiResponse<T> {
    /// 成功响应（200）
    pub fn success(message: impl Into<String>, data: T) -> Self {
        Self {
            status: "success",
            message: message.into(),
            data: Some(data),
            errors: None,
            metadata: ResponseMetadata::new(),
            status_code: StatusCode::OK,
        }
    }

    /// 创建成功响应（201）
    pub fn created(message: impl Into<String>, data: T) -> Self {
        Self {
            status_code: StatusCode::CREATED,
            ..Self::success(message, data)
        }
    }
}

impl ApiResponse<()> {
    /// 无数据的成功响应
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            status: "success",
            message: message.into(),
            data: None,
            errors: None,
            metadata: ResponseMetadata::new(),
            status_code: StatusCode::OK,
        }
    }

    /// 错误响应
    pub fn error(
        status_code: StatusCode,
        message: impl Into<String>,
        errors: Option<serde_json::Value>,
    ) -> Self {
        Self {
            status: "error",
            message: message.into(),
            data: None,
            errors,
            metadata: ResponseMetadata::new(),
            status_code,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status_code = self.status_code;
        (status_code, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope_shape() {
        let response = ApiResponse::success("ok", serde_json::json!({"value": 1}));
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["status"], "success");
        assert_eq!(json["message"], "ok");
        assert_eq!(json["data"]["value"], 1);
        assert!(json.get("errors").is_none());
        assert!(json["metadata"]["request_id"].is_string());
        assert!(json["metadata"]["timestamp"].is_string());
    }

    #[test]
    fn test_error_envelope_has_no_data() {
        let response = ApiResponse::error(
            StatusCode::BAD_REQUEST,
            "bad",
            Some(serde_json::json!(["field"])),
        );
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["status"], "error");
        assert!(json.get("data").is_none());
        assert_eq!(json["errors"][0], "field");
    }
}
