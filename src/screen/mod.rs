//! Request security screen
//!
//! Every inbound request runs through [`SecurityScreen::screen`] before it
//! reaches a handler. The pipeline short-circuits on the first rejection:
//!
//! 1. IP denylist
//! 2. payload size ceiling
//! 3. signature scan of URI and headers, plus the body for mutating methods
//! 4. fixed-window rate limit per client IP
//! 5. CSRF validation and issuance for mutating methods
//! 6. security headers
//!
//! Abuse is reported as data in [`ScreenDecision`]. Only a store failure while
//! checking CSRF is an internal fault, and it fails closed.

pub mod headers;
pub mod patterns;
pub mod rate_limit;
pub mod threat_log;

pub use patterns::{Severity, ThreatType};
pub use rate_limit::{FixedWindowLimiter, RateDecision, RateLimiterStats};
pub use threat_log::ThreatLog;

use crate::{
    alerting::{AlertEvent, AlertNotifier},
    config::ScreenConfig,
    csrf::CsrfGuard,
    scheduler::SingleFlight,
    telemetry::AUDIT_TARGET,
};
use axum::http::{HeaderMap, Method};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use patterns::{Finding, Location};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Observed suspicious signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatRecord {
    pub id: Uuid,
    pub threat_type: ThreatType,
    pub severity: Severity,
    pub source_ip: String,
    pub pattern: String,
    pub timestamp: DateTime<Utc>,
    pub blocked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    BlockedIp,
    PayloadTooLarge,
    Threat,
    RateLimited,
    Csrf,
    StalledBody,
    Internal,
}

impl BlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockReason::BlockedIp => "blocked_ip",
            BlockReason::PayloadTooLarge => "payload_too_large",
            BlockReason::Threat => "threat",
            BlockReason::RateLimited => "rate_limited",
            BlockReason::Csrf => "csrf",
            BlockReason::StalledBody => "stalled_body",
            BlockReason::Internal => "internal",
        }
    }
}

/// What the screen looks at
pub struct ScreenRequest<'a> {
    pub method: &'a Method,
    /// Path and query as received
    pub uri: &'a str,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
    pub client_ip: &'a str,
    /// Token from `x-csrf-token`, `csrf-token` or the `csrf_token` form field
    pub csrf_token: Option<&'a str>,
}

impl ScreenRequest<'_> {
    fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or(self.uri)
    }

    fn declared_length(&self) -> Option<u64> {
        self.headers
            .get(axum::http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }
}

#[derive(Debug, Clone)]
pub struct ScreenDecision {
    pub allowed: bool,
    pub blocked: bool,
    pub reason: Option<BlockReason>,
    pub threats: Vec<ThreatRecord>,
    /// Fresh tracked CSRF token for the client's next mutating request
    pub csrf_token: Option<String>,
    pub headers: &'static [(&'static str, &'static str)],
    /// Set when rate limited
    pub retry_after: Option<Duration>,
}

impl ScreenDecision {
    fn allow(threats: Vec<ThreatRecord>, csrf_token: Option<String>) -> Self {
        Self {
            allowed: true,
            blocked: false,
            reason: None,
            threats,
            csrf_token,
            headers: headers::SECURITY_HEADERS,
            retry_after: None,
        }
    }

    fn block(reason: BlockReason, threats: Vec<ThreatRecord>) -> Self {
        Self {
            allowed: false,
            blocked: true,
            reason: Some(reason),
            threats,
            csrf_token: None,
            headers: headers::SECURITY_HEADERS,
            retry_after: None,
        }
    }
}

/// Denylist entry
#[derive(Debug, Clone, Serialize)]
pub struct BlockedIp {
    pub ip: String,
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScreenStats {
    pub requests_screened: u64,
    pub requests_blocked: u64,
    pub threats_logged: usize,
    pub blocked_ips: usize,
    pub rate_limiter: RateLimiterStats,
}

pub struct SecurityScreen {
    config: ScreenConfig,
    blocked_ips: DashMap<String, BlockedIp>,
    limiter: FixedWindowLimiter,
    threats: ThreatLog,
    csrf: Arc<CsrfGuard>,
    alerts: AlertNotifier,
    screened: AtomicU64,
    blocked: AtomicU64,
    sweep_guard: SingleFlight,
}

impl SecurityScreen {
    pub fn new(config: &ScreenConfig, csrf: Arc<CsrfGuard>, alerts: AlertNotifier) -> Self {
        let blocked_ips = DashMap::new();
        for ip in &config.blocked_ips {
            blocked_ips.insert(
                ip.clone(),
                BlockedIp {
                    ip: ip.clone(),
                    reason: "configured".to_string(),
                    blocked_at: Utc::now(),
                },
            );
        }

        Self {
            config: config.clone(),
            blocked_ips,
            limiter: FixedWindowLimiter::new(
                config.rate_limit_max_requests,
                Duration::from_secs(config.rate_limit_window_secs),
            ),
            threats: ThreatLog::new(config.threat_log_capacity),
            csrf,
            alerts,
            screened: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            sweep_guard: SingleFlight::new(),
        }
    }

    pub fn csrf(&self) -> &CsrfGuard {
        &self.csrf
    }

    pub fn max_body_bytes(&self) -> usize {
        self.config.max_body_bytes
    }

    pub fn body_read_timeout(&self) -> Duration {
        Duration::from_millis(self.config.body_read_timeout_ms)
    }

    /// Run the full pipeline
    pub async fn screen(&self, req: &ScreenRequest<'_>) -> ScreenDecision {
        self.screen_at(req, Instant::now()).await
    }

    pub async fn screen_at(&self, req: &ScreenRequest<'_>, now: Instant) -> ScreenDecision {
        self.screened.fetch_add(1, Ordering::Relaxed);
        let ip = req.client_ip;

        // 1. denylist
        if self.is_denied(ip, req.headers) {
            return self.reject(BlockReason::BlockedIp, Vec::new(), ip);
        }

        // 2. size
        let size = req
            .declared_length()
            .unwrap_or(0)
            .max(req.body.len() as u64);
        if size > self.config.max_body_bytes as u64 {
            let record = self.record(
                Finding {
                    threat_type: ThreatType::PayloadTooLarge,
                    severity: Severity::Medium,
                    pattern: "max-body-bytes",
                },
                ip,
                true,
            );
            return self.reject(BlockReason::PayloadTooLarge, vec![record], ip);
        }

        // 3. signatures
        let mutating = is_mutating(req.method);
        let mut findings = patterns::scan(req.uri, Location::Uri);
        findings.extend(patterns::scan_headers(req.headers));
        findings.extend(patterns::detect_forwarded_spoofing(req.headers));
        if mutating && !req.body.is_empty() {
            findings.extend(patterns::scan(&String::from_utf8_lossy(req.body), Location::Body));
        }

        let blocking = findings.iter().any(|f| f.severity.blocks());
        let threats: Vec<ThreatRecord> = findings
            .into_iter()
            .map(|finding| self.record(finding, ip, blocking))
            .collect();
        if blocking {
            return self.reject(BlockReason::Threat, threats, ip);
        }

        // 4. rate limit
        let rate = self.limiter.check_at(ip, now);
        if !rate.allowed {
            let record = self.record(
                Finding {
                    threat_type: ThreatType::RateLimitExceeded,
                    severity: Severity::Medium,
                    pattern: "fixed-window",
                },
                ip,
                true,
            );
            let mut threats = threats;
            threats.push(record);
            let mut decision = self.reject(BlockReason::RateLimited, threats, ip);
            decision.retry_after = Some(rate.reset_in);
            return decision;
        }

        // 5. CSRF
        if !mutating {
            return ScreenDecision::allow(threats, None);
        }

        if !self.csrf.bypass(req.method, req.path()) {
            let valid = match req.csrf_token {
                Some(token) => match self.csrf.validate_tracked(token, ip).await {
                    Ok(valid) => valid,
                    Err(e) => return self.fail_closed(e, threats, ip),
                },
                None => false,
            };
            if !valid {
                return self.reject(BlockReason::Csrf, threats, ip);
            }
        }

        match self.csrf.issue_tracked(ip).await {
            Ok(token) => ScreenDecision::allow(threats, Some(token)),
            Err(e) => self.fail_closed(e, threats, ip),
        }
    }

    /// Denylist check against the resolved client and every forwarded hop.
    /// Runs before the body is read.
    pub fn is_denied(&self, client_ip: &str, headers: &HeaderMap) -> bool {
        if self.blocked_ips.is_empty() {
            return false;
        }
        self.is_blocked(client_ip)
            || patterns::claimed_addresses(headers)
                .into_iter()
                .any(|hop| self.is_blocked(hop))
    }

    /// Denylisted client rejected before its body is buffered
    pub fn reject_blocked_ip(&self, client_ip: &str) -> ScreenDecision {
        self.screened.fetch_add(1, Ordering::Relaxed);
        self.reject(BlockReason::BlockedIp, Vec::new(), client_ip)
    }

    /// The body did not arrive within the read timeout
    pub fn reject_stalled_body(&self, client_ip: &str) -> ScreenDecision {
        self.screened.fetch_add(1, Ordering::Relaxed);
        let record = self.record(
            Finding {
                threat_type: ThreatType::StalledBody,
                severity: Severity::Medium,
                pattern: "body-read-timeout",
            },
            client_ip,
            true,
        );
        self.reject(BlockReason::StalledBody, vec![record], client_ip)
    }

    /// The body exceeded the ceiling while streaming
    pub fn reject_oversized_body(&self, client_ip: &str) -> ScreenDecision {
        self.screened.fetch_add(1, Ordering::Relaxed);
        let record = self.record(
            Finding {
                threat_type: ThreatType::PayloadTooLarge,
                severity: Severity::Medium,
                pattern: "max-body-bytes",
            },
            client_ip,
            true,
        );
        self.reject(BlockReason::PayloadTooLarge, vec![record], client_ip)
    }

    fn fail_closed(
        &self,
        error: crate::store::StoreError,
        threats: Vec<ThreatRecord>,
        ip: &str,
    ) -> ScreenDecision {
        metrics::counter!("storage_errors_total").increment(1);
        tracing::error!(client_ip = ip, error = %error, "Security screen failed closed");
        self.reject(BlockReason::Internal, threats, ip)
    }

    fn reject(&self, reason: BlockReason, threats: Vec<ThreatRecord>, ip: &str) -> ScreenDecision {
        self.blocked.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("security_requests_blocked_total", "reason" => reason.as_str()).increment(1);
        tracing::warn!(
            target: AUDIT_TARGET,
            client_ip = ip,
            reason = reason.as_str(),
            threats = threats.len(),
            "Request blocked by security screen"
        );
        ScreenDecision::block(reason, threats)
    }

    /// Turn a finding into a logged threat record; critical ones raise an alert
    fn record(&self, finding: Finding, ip: &str, blocked: bool) -> ThreatRecord {
        let record = ThreatRecord {
            id: Uuid::new_v4(),
            threat_type: finding.threat_type,
            severity: finding.severity,
            source_ip: ip.to_string(),
            pattern: finding.pattern.to_string(),
            timestamp: Utc::now(),
            blocked,
        };

        metrics::counter!("security_threats_total", "severity" => finding.severity.as_str())
            .increment(1);
        if finding.severity == Severity::Low {
            tracing::info!(client_ip = ip, pattern = finding.pattern, "Low severity signal");
        } else {
            tracing::warn!(
                target: AUDIT_TARGET,
                client_ip = ip,
                pattern = finding.pattern,
                severity = finding.severity.as_str(),
                blocked,
                "Threat detected"
            );
        }

        if finding.severity == Severity::Critical {
            self.alerts.notify(AlertEvent {
                kind: "threat",
                severity: finding.severity.as_str(),
                summary: format!("{:?} from {}", finding.threat_type, ip),
                source_ip: Some(ip.to_string()),
                details: serde_json::json!({ "pattern": finding.pattern, "threat_id": record.id }),
                timestamp: record.timestamp,
            });
        }

        self.threats.push(record.clone());
        record
    }

    // ==================== 管理操作 ====================

    pub fn block_ip(&self, ip: &str, reason: &str) -> bool {
        let inserted = self
            .blocked_ips
            .insert(
                ip.to_string(),
                BlockedIp {
                    ip: ip.to_string(),
                    reason: reason.to_string(),
                    blocked_at: Utc::now(),
                },
            )
            .is_none();
        tracing::warn!(target: AUDIT_TARGET, ip, reason, "IP blocked");
        inserted
    }

    pub fn unblock_ip(&self, ip: &str) -> bool {
        let removed = self.blocked_ips.remove(ip).is_some();
        if removed {
            tracing::info!(ip, "IP unblocked");
        }
        removed
    }

    pub fn is_blocked(&self, ip: &str) -> bool {
        self.blocked_ips.contains_key(ip)
    }

    pub fn blocked_ips(&self) -> Vec<BlockedIp> {
        let mut list: Vec<_> = self.blocked_ips.iter().map(|e| e.value().clone()).collect();
        list.sort_by(|a, b| a.blocked_at.cmp(&b.blocked_at));
        list
    }

    /// Newest first
    pub fn recent_threats(&self, limit: usize) -> Vec<ThreatRecord> {
        self.threats.recent(limit)
    }

    pub fn stats(&self) -> ScreenStats {
        ScreenStats {
            requests_screened: self.screened.load(Ordering::Relaxed),
            requests_blocked: self.blocked.load(Ordering::Relaxed),
            threats_logged: self.threats.len(),
            blocked_ips: self.blocked_ips.len(),
            rate_limiter: self.limiter.stats(),
        }
    }

    /// Trim aged threat records and elapsed rate windows
    pub fn sweep(&self) -> u64 {
        let Some(_flight) = self.sweep_guard.try_begin() else {
            return 0;
        };

        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.threat_max_age_secs as i64);
        self.threats.trim_before(cutoff) + self.limiter.trim(Instant::now())
    }
}

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}
