use crate::clock::MAX_DURATION_SECS;
use crate::error::SecurityError;
use crate::monitoring::AlertRule;
use crate::security::{parse_network, PolicyRule};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SecurityConfig {
    #[serde(default)]
    pub csrf: CsrfConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub ip_filter: IpFilterConfig,
    #[serde(default)]
    pub threat_detection: ThreatDetectionConfig,
    #[serde(default)]
    pub threat_log: ThreatLogConfig,
    #[serde(default)]
    pub headers: HeadersConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub api_keys: ApiKeyConfig,
    #[serde(default = "default_max_request_size")]
    pub max_request_size: u64,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Peers whose `X-Forwarded-For` header is believed.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CsrfConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_csrf_ttl_secs")]
    pub ttl_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct IpFilterConfig {
    pub enabled: bool,
    #[serde(default)] // Empty vec if missing
    pub whitelist: Vec<String>,
    #[serde(default)] // Empty vec if missing
    pub blacklist: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ThreatDetectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Number of high-or-critical records that blocks a request on its own.
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: usize,
    /// Overrides on top of the standard block policy.
    #[serde(default)]
    pub policy: Vec<PolicyRule>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ThreatLogConfig {
    #[serde(default = "default_threat_log_capacity")]
    pub max_entries: usize,
    #[serde(default = "default_threat_retention_secs")]
    pub retention_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CspDirective {
    pub name: String,
    pub sources: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HeadersConfig {
    #[serde(default = "default_csp")]
    pub csp: Vec<CspDirective>,
    #[serde(default = "default_hsts_max_age")]
    pub hsts_max_age: u64,
    #[serde(default = "default_true")]
    pub hsts_include_subdomains: bool,
    #[serde(default = "default_true")]
    pub hsts_preload: bool,
    #[serde(default = "default_permissions_policy")]
    pub permissions_policy: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MonitoringConfig {
    #[serde(default = "default_series_capacity")]
    pub max_points_per_series: usize,
    #[serde(default = "default_true")]
    pub default_alert_rules: bool,
    #[serde(default)]
    pub alert_rules: Vec<AlertRule>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApiKeyConfig {
    #[serde(default = "default_key_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_key_rate_limit")]
    pub default_rate_limit: u32,
    #[serde(default = "default_key_window_secs")]
    pub default_window_secs: u64,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_max_request_size() -> u64 {
    10 * 1024 * 1024 // 10MB
}

fn default_csrf_ttl_secs() -> u64 {
    3600
}

fn default_max_requests() -> u32 {
    100
}

fn default_window_secs() -> u64 {
    60
}

fn default_escalation_threshold() -> usize {
    2
}

fn default_threat_log_capacity() -> usize {
    1000
}

fn default_threat_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_csp() -> Vec<CspDirective> {
    [
        ("default-src", vec!["'self'"]),
        ("script-src", vec!["'self'"]),
        ("style-src", vec!["'self'", "'unsafe-inline'"]),
        ("img-src", vec!["'self'", "data:", "https:"]),
        ("font-src", vec!["'self'"]),
        ("connect-src", vec!["'self'"]),
        ("frame-ancestors", vec!["'none'"]),
        ("base-uri", vec!["'self'"]),
        ("form-action", vec!["'self'"]),
    ]
    .into_iter()
    .map(|(name, sources)| CspDirective {
        name: name.to_string(),
        sources: sources.into_iter().map(String::from).collect(),
    })
    .collect()
}

fn default_hsts_max_age() -> u64 {
    31_536_000
}

fn default_permissions_policy() -> Vec<String> {
    vec![
        "camera=()".to_string(),
        "microphone=()".to_string(),
        "geolocation=()".to_string(),
        "payment=(self)".to_string(),
    ]
}

fn default_series_capacity() -> usize {
    1000
}

fn default_key_cache_ttl_secs() -> u64 {
    300
}

fn default_key_rate_limit() -> u32 {
    1000
}

fn default_key_window_secs() -> u64 {
    3600
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_csrf_ttl_secs(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
        }
    }
}

impl Default for ThreatDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            escalation_threshold: default_escalation_threshold(),
            policy: Vec::new(),
        }
    }
}

impl Default for ThreatLogConfig {
    fn default() -> Self {
        Self {
            max_entries: default_threat_log_capacity(),
            retention_secs: default_threat_retention_secs(),
        }
    }
}

impl Default for HeadersConfig {
    fn default() -> Self {
        Self {
            csp: default_csp(),
            hsts_max_age: default_hsts_max_age(),
            hsts_include_subdomains: true,
            hsts_preload: true,
            permissions_policy: default_permissions_policy(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            max_points_per_series: default_series_capacity(),
            default_alert_rules: true,
            alert_rules: Vec::new(),
        }
    }
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_key_cache_ttl_secs(),
            default_rate_limit: default_key_rate_limit(),
            default_window_secs: default_key_window_secs(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            csrf: CsrfConfig::default(),
            rate_limit: RateLimitConfig::default(),
            ip_filter: IpFilterConfig::default(),
            threat_detection: ThreatDetectionConfig::default(),
            threat_log: ThreatLogConfig::default(),
            headers: HeadersConfig::default(),
            monitoring: MonitoringConfig::default(),
            api_keys: ApiKeyConfig::default(),
            max_request_size: default_max_request_size(),
            allowed_origins: Vec::new(),
            trusted_proxies: Vec::new(),
        }
    }
}

impl SecurityConfig {
    pub fn from_file(path: &str) -> Result<Self, SecurityError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, SecurityError> {
        let config: SecurityConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SecurityError> {
        if self.rate_limit.enabled && self.rate_limit.window_secs == 0 {
            return Err(SecurityError::Config(
                "rate_limit.window_secs must be greater than zero".to_string(),
            ));
        }
        if self.csrf.enabled && self.csrf.ttl_secs == 0 {
            return Err(SecurityError::Config(
                "csrf.ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.threat_log.max_entries == 0 || self.monitoring.max_points_per_series == 0 {
            return Err(SecurityError::Config(
                "log and series capacities must be greater than zero".to_string(),
            ));
        }

        let mut durations = vec![
            ("csrf.ttl_secs", self.csrf.ttl_secs),
            ("rate_limit.window_secs", self.rate_limit.window_secs),
            ("threat_log.retention_secs", self.threat_log.retention_secs),
            ("api_keys.cache_ttl_secs", self.api_keys.cache_ttl_secs),
            ("api_keys.default_window_secs", self.api_keys.default_window_secs),
        ];
        for rule in &self.monitoring.alert_rules {
            durations.push(("monitoring.alert_rules.cooldown_secs", rule.cooldown_secs));
        }
        let too_long = durations.iter().find(|(_, secs)| *secs > MAX_DURATION_SECS);
        if let Some((name, secs)) = too_long {
            return Err(SecurityError::Config(format!(
                "{} is {}, the maximum is {}",
                name, secs, MAX_DURATION_SECS
            )));
        }

        for proxy in &self.trusted_proxies {
            parse_network(proxy).map_err(SecurityError::Config)?;
        }
        Ok(())
    }

    /// Parsed `trusted_proxies`. Entries were checked by [`Self::validate`].
    pub fn trusted_proxy_networks(&self) -> Vec<ipnetwork::IpNetwork> {
        self.trusted_proxies
            .iter()
            .filter_map(|p| match parse_network(p) {
                Ok(network) => Some(network),
                Err(e) => {
                    warn!("Ignoring trusted proxy {}: {}", p, e);
                    None
                }
            })
            .collect()
    }

    /// Apply `GUARD_*` environment overrides on top of the loaded values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("GUARD_CSRF_ENABLED") {
            match parse_bool(&v) {
                Some(b) => self.csrf.enabled = b,
                None => warn!("Ignoring GUARD_CSRF_ENABLED={}", v),
            }
        }
        if let Some(v) = lookup("GUARD_RATE_LIMIT_ENABLED") {
            match parse_bool(&v) {
                Some(b) => self.rate_limit.enabled = b,
                None => warn!("Ignoring GUARD_RATE_LIMIT_ENABLED={}", v),
            }
        }
        if let Some(v) = lookup("GUARD_MAX_REQUEST_SIZE") {
            match v.trim().parse::<u64>() {
                Ok(size) => self.max_request_size = size,
                Err(_) => warn!("Ignoring GUARD_MAX_REQUEST_SIZE={}", v),
            }
        }
        if let Some(v) = lookup("GUARD_ALLOWED_ORIGINS") {
            self.allowed_origins = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            info!("Allowed origins from environment: {:?}", self.allowed_origins);
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::AlertCondition;
    use crate::security::Severity;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = SecurityConfig::default();
        assert!(config.csrf.enabled);
        assert_eq!(config.rate_limit.max_requests, 100);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.max_request_size, 10 * 1024 * 1024);
        assert_eq!(config.threat_log.max_entries, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
rate_limit:
  max_requests: 5
ip_filter:
  enabled: true
  blacklist: ["10.0.0.0/8"]
threat_detection:
  policy:
    - threat_type: xss
      severity: high
      block: true
monitoring:
  alert_rules:
    - id: slow_checkout
      metric: checkout_ms
      condition: gt
      threshold: 2000
      severity: medium
      cooldown_secs: 60
"#;
        let config = SecurityConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert!(config.rate_limit.enabled);
        assert_eq!(config.ip_filter.blacklist, vec!["10.0.0.0/8"]);
        assert_eq!(config.threat_detection.policy.len(), 1);
        assert_eq!(config.monitoring.alert_rules[0].id, "slow_checkout");
        assert!(config.monitoring.alert_rules[0].enabled);
    }

    #[test]
    fn test_zero_window_rejected() {
        let yaml = "rate_limit:\n  window_secs: 0\n";
        assert!(matches!(
            SecurityConfig::from_yaml(yaml),
            Err(SecurityError::Config(_))
        ));
    }

    #[test]
    fn test_unbounded_durations_rejected() {
        for yaml in [
            "csrf:\n  ttl_secs: 18446744073709551615\n",
            "threat_log:\n  retention_secs: 10000000000000000\n",
            "api_keys:\n  cache_ttl_secs: 10000000000000000\n",
            "rate_limit:\n  window_secs: 10000000000000000\n",
        ] {
            assert!(
                matches!(SecurityConfig::from_yaml(yaml), Err(SecurityError::Config(_))),
                "accepted {}",
                yaml
            );
        }

        let mut config = SecurityConfig::default();
        config.monitoring.alert_rules.push(AlertRule::new(
            "forever",
            "security_request_processed",
            AlertCondition::Gt,
            0.0,
            Severity::Low,
            10_000_000_000_000_000,
        ));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_trusted_proxies() {
        let yaml = "trusted_proxies: [\"10.0.0.0/8\", \"::1\"]\n";
        let config = SecurityConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.trusted_proxy_networks().len(), 2);

        assert!(SecurityConfig::from_yaml("trusted_proxies: [\"nope\"]\n").is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(SecurityConfig::from_file("nonexistent.yaml").is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("GUARD_CSRF_ENABLED", "false"),
            ("GUARD_RATE_LIMIT_ENABLED", "maybe"),
            ("GUARD_MAX_REQUEST_SIZE", "2048"),
            ("GUARD_ALLOWED_ORIGINS", "https://a.test, https://b.test,"),
        ]
        .into_iter()
        .collect();

        let mut config = SecurityConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert!(!config.csrf.enabled);
        assert!(config.rate_limit.enabled);
        assert_eq!(config.max_request_size, 2048);
        assert_eq!(config.allowed_origins, vec!["https://a.test", "https://b.test"]);
    }

    #[test]
    fn test_bundled_config_loads() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/guard.yaml");
        let config = SecurityConfig::from_file(path).unwrap();
        assert_eq!(config.allowed_origins, vec!["https://app.example.com"]);
        assert_eq!(config.monitoring.alert_rules[0].id, "blocked_burst");
        assert!(!config.headers.csp.is_empty());
    }
}
