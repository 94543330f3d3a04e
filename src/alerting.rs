//! 告警通知
//! 严重安全事件通过 webhook 发送，发送失败只记录日志，不影响请求处理

use crate::config::AlertingConfig;
use serde::Serialize;
use std::time::Duration;

/// 告警事件
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub kind: &'static str,
    pub severity: &'static str,
    pub summary: String,
    pub source_ip: Option<String>,
    pub details: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone)]
pub struct AlertNotifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl AlertNotifier {
    pub fn from_config(config: &AlertingConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to build alert HTTP client, using defaults");
                reqwest::Client::new()
            });

        Self {
            client,
            webhook_url: config.webhook_url.clone().filter(|u| !u.is_empty()),
        }
    }

    /// 只记录日志的通知器
    pub fn disabled() -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    /// 发送告警（后台执行，立即返回）
    pub fn notify(&self, event: AlertEvent) {
        tracing::error!(
            kind = event.kind,
            severity = event.severity,
            source_ip = event.source_ip.as_deref().unwrap_or("unknown"),
            summary = %event.summary,
            "Security alert"
        );
        metrics::counter!("security_alerts_total", "kind" => event.kind).increment(1);

        let Some(url) = self.webhook_url.clone() else {
            return;
        };
        let client = self.client.clone();

        tokio::spawn(async move {
            let result = client
                .post(&url)
                .json(&event)
                .send()
                .await
                .and_then(|resp| resp.error_for_status());

            if let Err(e) = result {
                tracing::warn!(error = %e, kind = event.kind, "Alert webhook delivery failed");
            }
        });
    }
}
