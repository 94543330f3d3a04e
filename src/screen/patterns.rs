//! Threat signatures
//!
//! Regex signatures are compiled once. Each carries the severity used when it
//! fires in a header; script injection inside a request body is escalated to
//! critical.

use axum::http::HeaderMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High and critical findings stop the request; lower ones are only logged
    pub fn blocks(self) -> bool {
        self >= Severity::High
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatType {
    ScriptInjection,
    SqlInjection,
    PathTraversal,
    HeaderSpoofing,
    PayloadTooLarge,
    RateLimitExceeded,
    StalledBody,
}

/// Where in the request a signature fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Uri,
    Header,
    Body,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub threat_type: ThreatType,
    pub severity: Severity,
    pub pattern: &'static str,
}

struct Signature {
    name: &'static str,
    threat_type: ThreatType,
    severity: Severity,
    regex: Regex,
}

fn signature(
    name: &'static str,
    threat_type: ThreatType,
    severity: Severity,
    pattern: &str,
) -> Option<Signature> {
    match Regex::new(pattern) {
        Ok(regex) => Some(Signature {
            name,
            threat_type,
            severity,
            regex,
        }),
        Err(e) => {
            tracing::error!(signature = name, error = %e, "Invalid threat signature skipped");
            None
        }
    }
}

static SIGNATURES: Lazy<Vec<Signature>> = Lazy::new(|| {
    [
        signature("script-tag", ThreatType::ScriptInjection, Severity::High, r"(?i)<\s*script\b"),
        signature("javascript-uri", ThreatType::ScriptInjection, Severity::High, r"(?i)javascript\s*:"),
        signature(
            "event-handler",
            ThreatType::ScriptInjection,
            Severity::Medium,
            r"(?i)\bon(load|error|click|mouseover|focus)\s*=",
        ),
        signature(
            "sql-union-select",
            ThreatType::SqlInjection,
            Severity::High,
            r"(?i)\bunion\b(\s+all)?\s+select\b",
        ),
        signature(
            "sql-destructive",
            ThreatType::SqlInjection,
            Severity::High,
            r"(?i)\b(drop\s+table|truncate\s+table|delete\s+from|insert\s+into)\b",
        ),
        signature(
            "sql-tautology",
            ThreatType::SqlInjection,
            Severity::High,
            r#"(?i)['"]\s*or\s+['"]?\d+['"]?\s*=\s*['"]?\d+"#,
        ),
        signature(
            "sql-keyword",
            ThreatType::SqlInjection,
            Severity::Low,
            r"(?i)\b(select|union|drop|exec)\b",
        ),
        signature(
            "path-traversal",
            ThreatType::PathTraversal,
            Severity::High,
            r"(?i)(\.\./|\.\.\\|%2e%2e(%2f|%5c|/))",
        ),
    ]
    .into_iter()
    .flatten()
    .collect()
});

/// Run every signature over `text`. The percent-decoded form is scanned as
/// well so encoded payloads do not slip through.
pub fn scan(text: &str, location: Location) -> Vec<Finding> {
    if text.is_empty() {
        return Vec::new();
    }

    let decoded = urlencoding::decode(&text.replace('+', " "))
        .map(|d| d.into_owned())
        .unwrap_or_default();

    SIGNATURES
        .iter()
        .filter(|sig| sig.regex.is_match(text) || sig.regex.is_match(&decoded))
        .map(|sig| Finding {
            threat_type: sig.threat_type,
            severity: escalate(sig.threat_type, sig.severity, location),
            pattern: sig.name,
        })
        .collect()
}

fn escalate(threat_type: ThreatType, severity: Severity, location: Location) -> Severity {
    match (threat_type, location) {
        (ThreatType::ScriptInjection, Location::Body) if severity.blocks() => Severity::Critical,
        _ => severity,
    }
}

/// Headers never scanned: opaque credentials that trip keyword signatures
const SKIPPED_HEADERS: &[&str] = &["authorization", "cookie", "x-csrf-token", "csrf-token"];

/// Scan all header values except credentials
pub fn scan_headers(headers: &HeaderMap) -> Vec<Finding> {
    headers
        .iter()
        .filter(|(name, _)| !SKIPPED_HEADERS.contains(&name.as_str()))
        .filter_map(|(_, value)| value.to_str().ok())
        .flat_map(|value| scan(value, Location::Header))
        .collect()
}

/// All `X-Forwarded-For` hops, left to right, across repeated header lines
pub fn forwarded_hops(headers: &HeaderMap) -> Vec<&str> {
    headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .collect()
}

/// Every address a request claims to have passed through: all
/// `X-Forwarded-For` hops in order, then `X-Real-IP`
pub fn claimed_addresses(headers: &HeaderMap) -> Vec<&str> {
    let mut addresses = forwarded_hops(headers);

    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        addresses.push(real_ip);
    }
    addresses
}

/// Forwarded-header spoofing: repeated `X-Forwarded-For` lines, a first hop
/// that is not an IP, or an `X-Real-IP` that contradicts it.
pub fn detect_forwarded_spoofing(headers: &HeaderMap) -> Option<Finding> {
    let forwarded: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    if forwarded.is_empty() {
        return None;
    }

    let finding = |severity, pattern| Finding {
        threat_type: ThreatType::HeaderSpoofing,
        severity,
        pattern,
    };

    if forwarded.len() > 1 {
        return Some(finding(Severity::Medium, "duplicate-forwarded-for"));
    }

    let first_hop = forwarded[0].split(',').next().unwrap_or_default().trim();
    let Ok(first_hop) = first_hop.parse::<IpAddr>() else {
        return Some(finding(Severity::Medium, "malformed-forwarded-for"));
    };

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());

    match real_ip {
        Some(real_ip) if real_ip != first_hop => {
            Some(finding(Severity::Critical, "conflicting-forwarded-headers"))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(findings: &[Finding]) -> Vec<ThreatType> {
        findings.iter().map(|f| f.threat_type).collect()
    }

    #[test]
    fn test_signatures_compile() {
        assert_eq!(SIGNATURES.len(), 8);
    }

    #[test]
    fn test_script_injection() {
        let header = scan("<script>alert(1)</script>", Location::Header);
        assert!(header.iter().any(|f| f.severity == Severity::High));

        let body = scan(r#"{"name":"<SCRIPT src=x>"}"#, Location::Body);
        assert!(body.iter().any(|f| f.severity == Severity::Critical));

        let encoded = scan("name=%3Cscript%3Ealert(1)", Location::Body);
        assert!(types(&encoded).contains(&ThreatType::ScriptInjection));
    }

    #[test]
    fn test_sql_injection() {
        let findings = scan("1 UNION SELECT password FROM users", Location::Body);
        assert!(findings.iter().any(|f| f.pattern == "sql-union-select" && f.severity.blocks()));

        let tautology = scan("' OR '1'='1", Location::Body);
        assert!(tautology.iter().any(|f| f.pattern == "sql-tautology"));
    }

    #[test]
    fn test_plain_keyword_is_low_severity() {
        let findings = scan("please select a plan", Location::Body);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Low);
        assert!(!findings[0].severity.blocks());
    }

    #[test]
    fn test_path_traversal() {
        assert!(types(&scan("/files/../../etc/passwd", Location::Uri)).contains(&ThreatType::PathTraversal));
        assert!(types(&scan("/files/%2e%2e%2fetc", Location::Uri)).contains(&ThreatType::PathTraversal));
        assert!(scan("/api/user/profile", Location::Uri).is_empty());
    }

    #[test]
    fn test_benign_input() {
        assert!(scan(r#"{"display_name":"Ada Lovelace"}"#, Location::Body).is_empty());
        assert!(scan("Mozilla/5.0 (X11; Linux x86_64)", Location::Header).is_empty());
    }

    #[test]
    fn test_credential_headers_skipped() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer select.union.drop".parse().unwrap());
        headers.insert("user-agent", "curl/8.0".parse().unwrap());
        assert!(scan_headers(&headers).is_empty());
    }

    #[test]
    fn test_forwarded_spoofing() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.1".parse().unwrap());
        assert!(detect_forwarded_spoofing(&headers).is_none());

        headers.insert("x-real-ip", "10.0.0.1".parse().unwrap());
        assert!(detect_forwarded_spoofing(&headers).is_none());

        headers.insert("x-real-ip", "172.16.0.9".parse().unwrap());
        let finding = detect_forwarded_spoofing(&headers).unwrap();
        assert_eq!(finding.severity, Severity::Critical);

        let mut duplicated = HeaderMap::new();
        duplicated.append("x-forwarded-for", "10.0.0.1".parse().unwrap());
        duplicated.append("x-forwarded-for", "10.0.0.2".parse().unwrap());
        assert_eq!(
            detect_forwarded_spoofing(&duplicated).unwrap().pattern,
            "duplicate-forwarded-for"
        );

        let mut malformed = HeaderMap::new();
        malformed.insert("x-forwarded-for", "not-an-ip".parse().unwrap());
        assert_eq!(
            detect_forwarded_spoofing(&malformed).unwrap().severity,
            Severity::Medium
        );
    }

    #[test]
    fn test_claimed_addresses_cover_every_hop() {
        let mut headers = HeaderMap::new();
        headers.append("x-forwarded-for", "1.1.1.1, 2.2.2.2".parse().unwrap());
        headers.append("x-forwarded-for", " 3.3.3.3 ,".parse().unwrap());
        headers.insert("x-real-ip", "4.4.4.4".parse().unwrap());

        assert_eq!(
            claimed_addresses(&headers),
            vec!["1.1.1.1", "2.2.2.2", "3.3.3.3", "4.4.4.4"]
        );
        assert!(claimed_addresses(&HeaderMap::new()).is_empty());
    }
}
