pub mod api_keys;
pub mod blocklist;
pub mod body_inspector;
pub mod csrf;
pub mod detector;
pub mod headers;
pub mod ip_filter;
pub mod key_store;
pub mod pipeline;
pub mod policy;
pub mod rate_limiter;
pub mod signatures;
pub mod threat_log;

pub use api_keys::*;
pub use blocklist::*;
pub use body_inspector::*;
pub use csrf::*;
pub use detector::*;
pub use headers::*;
pub use ip_filter::*;
pub use key_store::*;
pub use pipeline::*;
pub use policy::*;
pub use rate_limiter::*;
pub use signatures::*;
pub use threat_log::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatType {
    Xss,
    Injection,
    PathTraversal,
    SuspiciousHeader,
    RateLimit,
}

impl ThreatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatType::Xss => "xss",
            ThreatType::Injection => "injection",
            ThreatType::PathTraversal => "path_traversal",
            ThreatType::SuspiciousHeader => "suspicious_header",
            ThreatType::RateLimit => "rate_limit",
        }
    }
}

impl fmt::Display for ThreatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatRecord {
    pub threat_type: ThreatType,
    pub severity: Severity,
    pub source: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub blocked: bool,
}

impl ThreatRecord {
    pub fn new(
        threat_type: ThreatType,
        severity: Severity,
        source: impl Into<String>,
        description: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            threat_type,
            severity,
            source: source.into(),
            description: description.into(),
            pattern: None,
            timestamp,
            blocked: false,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }
}

/// Highest severity among `records`, if any.
pub fn max_severity(records: &[ThreatRecord]) -> Option<Severity> {
    records.iter().map(|r| r.severity).max()
}

/// Key used for rate limiting and blocking. An API key id takes precedence over
/// the address when both are known.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    pub ip: String,
    pub api_key_id: Option<String>,
}

impl ClientIdentity {
    pub fn from_ip(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            api_key_id: None,
        }
    }

    pub fn key(&self) -> String {
        match &self.api_key_id {
            Some(id) => format!("key:{}", id),
            None => self.ip.clone(),
        }
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Transport-neutral view of an inbound HTTP request.
#[derive(Debug, Clone, Default)]
pub struct SecurityRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub client_ip: String,
    pub content_length: Option<u64>,
    pub api_key_id: Option<String>,
}

impl SecurityRequest {
    pub fn new(method: &str, url: &str, client_ip: &str) -> Self {
        Self {
            method: method.to_uppercase(),
            url: url.to_string(),
            client_ip: client_ip.to_string(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        if self.content_length.is_none() {
            self.content_length = Some(body.len() as u64);
        }
        self.body = Some(body);
        self
    }

    pub fn with_content_length(mut self, len: u64) -> Self {
        self.content_length = Some(len);
        self
    }

    pub fn with_api_key(mut self, id: &str) -> Self {
        self.api_key_id = Some(id.to_string());
        self
    }

    /// Case-insensitive header lookup, first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity {
            ip: self.client_ip.clone(),
            api_key_id: self.api_key_id.clone(),
        }
    }

    pub fn is_state_changing(&self) -> bool {
        is_state_changing_method(&self.method)
    }
}

pub fn is_state_changing_method(method: &str) -> bool {
    matches!(
        method.to_ascii_uppercase().as_str(),
        "POST" | "PUT" | "PATCH" | "DELETE"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_max_severity() {
        let now = Utc::now();
        let records = vec![
            ThreatRecord::new(ThreatType::Xss, Severity::Medium, "1.1.1.1", "a", now),
            ThreatRecord::new(ThreatType::Injection, Severity::Critical, "1.1.1.1", "b", now),
        ];
        assert_eq!(max_severity(&records), Some(Severity::Critical));
        assert_eq!(max_severity(&[]), None);
    }

    #[test]
    fn test_identity_prefers_api_key() {
        let req = SecurityRequest::new("get", "/", "10.0.0.1").with_api_key("gk_abc");
        assert_eq!(req.identity().key(), "key:gk_abc");
        assert_eq!(ClientIdentity::from_ip("10.0.0.1").key(), "10.0.0.1");
    }

    #[test]
    fn test_state_changing_methods() {
        for m in ["POST", "put", "Patch", "DELETE"] {
            assert!(is_state_changing_method(m));
        }
        for m in ["GET", "HEAD", "OPTIONS"] {
            assert!(!is_state_changing_method(m));
        }
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let req =
            SecurityRequest::new("GET", "/", "10.0.0.1").with_header("Content-Type", "text/plain");
        assert_eq!(req.header("content-type"), Some("text/plain"));
        assert_eq!(req.header("accept"), None);
    }

    #[test]
    fn test_threat_type_serializes_snake_case() {
        let json = serde_json::to_string(&ThreatType::RateLimit).unwrap();
        assert_eq!(json, "\"rate_limit\"");
    }
}
