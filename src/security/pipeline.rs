use super::api_keys::{ApiKeyError, ApiKeyManager, ApiKeyRecord};
use super::blocklist::{BlockedIp, Blocklist};
use super::csrf::CsrfTokenStore;
use super::detector::ThreatDetector;
use super::headers::SecurityHeaders;
use super::ip_filter::NetworkFilter;
use super::policy::BlockPolicy;
use super::rate_limiter::RateLimiter;
use super::threat_log::ThreatLog;
use super::{max_severity, SecurityRequest, Severity, ThreatRecord, ThreatType};
use crate::clock::{system_clock, SharedClock};
use crate::config::SecurityConfig;
use crate::error::{Result, SecurityError};
use crate::monitoring::MonitoringSystem;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const BLOCKLIST_MESSAGE: &str = "Client address is blocked";
pub const CSRF_TOKEN_HEADER: &str = "X-CSRF-Token";

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Blocklisted,
    RequestTooLarge,
    RateLimited,
    Threat,
    InvalidCsrfToken,
    ProcessingError,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::Blocklisted => "blocklisted",
            BlockReason::RequestTooLarge => "request_too_large",
            BlockReason::RateLimited => "rate_limited",
            BlockReason::Threat => "threat",
            BlockReason::InvalidCsrfToken => "invalid_csrf_token",
            BlockReason::ProcessingError => "processing_error",
        }
    }
}

/// Outcome of [`SecurityPipeline::process_request`].
#[derive(Debug, Clone, Serialize)]
pub struct SecurityDecision {
    pub allowed: bool,
    pub blocked: bool,
    pub threats: Vec<ThreatRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csrf_token: Option<String>,
    pub headers: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<BlockReason>,
}

impl SecurityDecision {
    fn allow(threats: Vec<ThreatRecord>) -> Self {
        Self {
            allowed: true,
            blocked: false,
            threats,
            csrf_token: None,
            headers: Vec::new(),
            block_reason: None,
        }
    }

    fn block(reason: BlockReason, threats: Vec<ThreatRecord>) -> Self {
        Self {
            allowed: false,
            blocked: true,
            threats,
            csrf_token: None,
            headers: Vec::new(),
            block_reason: Some(reason),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self.block_reason {
            None => 200,
            Some(BlockReason::RateLimited) => 429,
            Some(_) => 403,
        }
    }

    /// JSON body for a refused request.
    pub fn error_body(&self) -> String {
        let error = match self.block_reason {
            Some(BlockReason::RateLimited) => "Too many requests",
            Some(BlockReason::RequestTooLarge) => "Request too large",
            Some(_) => "Request blocked by security policy",
            None => "",
        };
        json!({
            "error": error,
            "reason": self.block_reason.map(|r| r.as_str()),
            "threats": self.threats,
        })
        .to_string()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityStats {
    pub blocked_ips: usize,
    pub active_csrf_tokens: usize,
    pub threat_count: usize,
    pub request_counts: HashMap<String, u32>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct MaintenanceReport {
    pub expired_tokens: usize,
    pub pruned_threats: usize,
    pub stale_windows: usize,
    pub evicted_keys: usize,
}

/// Per-request security decision.
///
/// Steps run in order and stop at the first block: blocklist, size, rate
/// limit, threat scan. Allowed state-changing requests get a CSRF token and
/// every outcome carries the security headers.
pub struct SecurityPipeline {
    blocklist: Blocklist,
    networks: NetworkFilter,
    rate_limiter: RateLimiter,
    detector: ThreatDetector,
    policy: BlockPolicy,
    csrf: CsrfTokenStore,
    csrf_enabled: bool,
    threat_log: ThreatLog,
    headers: SecurityHeaders,
    allowed_origins: Vec<String>,
    max_request_size: u64,
    monitoring: Arc<MonitoringSystem>,
    api_keys: Option<Arc<ApiKeyManager>>,
    clock: SharedClock,
}

impl SecurityPipeline {
    pub fn new(config: &SecurityConfig) -> Result<Self> {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: &SecurityConfig, clock: SharedClock) -> Result<Self> {
        config.validate()?;

        let mut networks = NetworkFilter::new(config.ip_filter.enabled);
        for entry in &config.ip_filter.whitelist {
            networks.allow(entry).map_err(SecurityError::Config)?;
        }
        for entry in &config.ip_filter.blacklist {
            networks.deny(entry).map_err(SecurityError::Config)?;
        }

        let monitoring = Arc::new(MonitoringSystem::with_clock(
            &config.monitoring,
            clock.clone(),
        ));

        Ok(Self {
            blocklist: Blocklist::with_clock(clock.clone()),
            networks,
            rate_limiter: RateLimiter::with_clock(
                config.rate_limit.max_requests,
                config.rate_limit.window_secs,
                config.rate_limit.enabled,
                clock.clone(),
            ),
            detector: ThreatDetector::with_clock(config.threat_detection.enabled, clock.clone()),
            policy: BlockPolicy::from_rules(
                &config.threat_detection.policy,
                config.threat_detection.escalation_threshold,
            ),
            csrf: CsrfTokenStore::with_clock(config.csrf.ttl_secs, clock.clone()),
            csrf_enabled: config.csrf.enabled,
            threat_log: ThreatLog::with_clock(
                config.threat_log.max_entries,
                config.threat_log.retention_secs,
                clock.clone(),
            ),
            headers: SecurityHeaders::from_config(&config.headers),
            allowed_origins: config.allowed_origins.clone(),
            max_request_size: config.max_request_size,
            monitoring,
            api_keys: None,
            clock,
        })
    }

    pub fn with_api_keys(mut self, manager: Arc<ApiKeyManager>) -> Self {
        self.api_keys = Some(manager);
        self
    }

    /// Evaluate one request. Never fails: internal faults come back as a
    /// blocked decision carrying a critical injection threat.
    pub fn process_request(&self, request: &SecurityRequest) -> SecurityDecision {
        self.guarded(request, || match self.admission_steps(request)? {
            Some(blocked) => Ok(blocked),
            None => self.inspection_steps(request),
        })
    }

    /// Blocklist, declared size and rate limit only. Returns a finished
    /// decision when the request is refused; `None` means the request must
    /// still go through [`inspect`](Self::inspect) once its body is known.
    pub fn admit(&self, request: &SecurityRequest) -> Option<SecurityDecision> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.admission_steps(request)));
        match outcome {
            Ok(Ok(None)) => None,
            Ok(Ok(Some(blocked))) => Some(self.guarded(request, || Ok(blocked))),
            Ok(Err(e)) => Some(self.guarded(request, || Err(e))),
            Err(_) => Some(self.guarded(request, || {
                Err(SecurityError::Processing(
                    "internal fault during admission".to_string(),
                ))
            })),
        }
    }

    /// Size recheck on the buffered body, threat scan, CSRF issuance and
    /// headers for a request that already passed [`admit`](Self::admit).
    pub fn inspect(&self, request: &SecurityRequest) -> SecurityDecision {
        self.guarded(request, || self.inspection_steps(request))
    }

    /// Runs `steps` and the bookkeeping after it under `catch_unwind`.
    fn guarded<F>(&self, request: &SecurityRequest, steps: F) -> SecurityDecision
    where
        F: FnOnce() -> Result<SecurityDecision>,
    {
        let outcome = panic::catch_unwind(AssertUnwindSafe(steps));

        let mut decision = match outcome {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                error!("Security evaluation failed for {}: {}", request.client_ip, e);
                self.fault_decision(request, &e.to_string())
            }
            Err(_) => {
                error!("Security evaluation panicked for {}", request.client_ip);
                self.fault_decision(request, "internal fault during security evaluation")
            }
        };

        decision.headers = self.response_headers(request);

        let bookkeeping = panic::catch_unwind(AssertUnwindSafe(|| {
            if !decision.threats.is_empty() {
                self.threat_log.append(&decision.threats);
            }
            self.record_outcome(&decision);
        }));
        if bookkeeping.is_err() {
            error!(
                "Recording the outcome for {} failed, decision unchanged",
                request.client_ip
            );
        }

        decision
    }

    fn admission_steps(&self, request: &SecurityRequest) -> Result<Option<SecurityDecision>> {
        let identity = request.identity().key();

        // 1. blocklist
        let listed = self
            .blocklist
            .get(&request.client_ip)
            .map(|entry| entry.reason)
            .or_else(|| self.networks.refusal(&request.client_ip));
        if let Some(reason) = listed {
            warn!("Blocked request from {}: {}", request.client_ip, reason);
            let threat = self.threat(
                ThreatType::RateLimit,
                Severity::High,
                &identity,
                BLOCKLIST_MESSAGE,
            );
            return Ok(Some(SecurityDecision::block(
                BlockReason::Blocklisted,
                vec![threat],
            )));
        }

        // 2. size
        if let Some(blocked) = self.size_check(request, &identity) {
            return Ok(Some(blocked));
        }

        // 3. rate limit
        let limit = self.rate_limiter.check_rate_limit(&identity);
        if !limit.allowed {
            let err = SecurityError::RateLimitExceeded {
                identity: identity.clone(),
            };
            warn!("{} (resets at {})", err, limit.reset_at);
            let threat = self.threat(
                ThreatType::RateLimit,
                Severity::Medium,
                &identity,
                &err.to_string(),
            );
            return Ok(Some(SecurityDecision::block(
                BlockReason::RateLimited,
                vec![threat],
            )));
        }

        Ok(None)
    }

    fn size_check(&self, request: &SecurityRequest, identity: &str) -> Option<SecurityDecision> {
        let size = request
            .content_length
            .into_iter()
            .chain(request.body.as_ref().map(|b| b.len() as u64))
            .max()
            .unwrap_or(0);
        if size <= self.max_request_size {
            return None;
        }

        let err = SecurityError::RequestTooLarge {
            size,
            limit: self.max_request_size,
        };
        warn!("Refused request from {}: {}", identity, err);
        let threat = self.threat(
            ThreatType::RateLimit,
            Severity::Medium,
            identity,
            &err.to_string(),
        );
        Some(SecurityDecision::block(
            BlockReason::RequestTooLarge,
            vec![threat],
        ))
    }

    fn inspection_steps(&self, request: &SecurityRequest) -> Result<SecurityDecision> {
        let identity = request.identity().key();

        // A streamed body can outgrow its declared length
        if let Some(blocked) = self.size_check(request, &identity) {
            return Ok(blocked);
        }

        // 4. threat scan
        let mut threats = self.detector.scan_request(request);
        if self.policy.apply(&mut threats) {
            warn!(
                "Blocked request from {}: {} threat(s), max severity {}",
                identity,
                threats.len(),
                max_severity(&threats).map(|s| s.as_str()).unwrap_or("none")
            );
            return Ok(SecurityDecision::block(BlockReason::Threat, threats));
        }
        for threat in &threats {
            info!(
                "Logged non-blocking {} threat ({}) from {}: {}",
                threat.threat_type, threat.severity, identity, threat.description
            );
        }

        // 5. csrf
        let mut decision = SecurityDecision::allow(threats);
        if self.csrf_enabled && request.is_state_changing() {
            decision.csrf_token = Some(self.csrf.issue(&identity));
        }

        Ok(decision)
    }

    /// Refusal for a state-changing request presenting a CSRF token that is
    /// unknown, expired, replayed or issued to another identity. Requests
    /// without a token are left alone.
    pub fn check_presented_csrf(&self, request: &SecurityRequest) -> Option<SecurityDecision> {
        if !self.csrf_enabled || !request.is_state_changing() {
            return None;
        }
        let token = request.header(CSRF_TOKEN_HEADER)?;
        let identity = request.identity().key();
        if self.csrf.validate(token, &identity) {
            return None;
        }

        warn!("Invalid CSRF token presented by {}", identity);
        let threat = self.threat(
            ThreatType::SuspiciousHeader,
            Severity::High,
            &identity,
            "Invalid or replayed CSRF token",
        );
        Some(self.guarded(request, || {
            Ok(SecurityDecision::block(BlockReason::InvalidCsrfToken, vec![threat]))
        }))
    }

    fn threat(
        &self,
        threat_type: ThreatType,
        severity: Severity,
        source: &str,
        description: &str,
    ) -> ThreatRecord {
        let mut record =
            ThreatRecord::new(threat_type, severity, source, description, self.clock.now());
        record.blocked = true;
        record
    }

    fn fault_decision(&self, request: &SecurityRequest, message: &str) -> SecurityDecision {
        let err = SecurityError::Processing(message.to_string());
        let threat = self.threat(
            ThreatType::Injection,
            Severity::Critical,
            &request.identity().key(),
            &err.to_string(),
        );
        SecurityDecision::block(BlockReason::ProcessingError, vec![threat])
    }

    fn response_headers(&self, request: &SecurityRequest) -> Vec<(String, String)> {
        let mut headers = self.headers.to_vec();
        if let Some(origin) = request.header("origin") {
            if self
                .allowed_origins
                .iter()
                .any(|allowed| allowed == "*" || allowed == origin)
            {
                headers.push(("Access-Control-Allow-Origin".to_string(), origin.to_string()));
                headers.push(("Vary".to_string(), "Origin".to_string()));
            }
        }
        headers
    }

    fn record_outcome(&self, decision: &SecurityDecision) {
        let outcome = if decision.blocked { "blocked" } else { "allowed" };
        self.monitoring
            .record_metric("security_request_processed", 1.0, &[("outcome", outcome)]);

        if let Some(reason) = decision.block_reason {
            self.monitoring
                .record_metric("security_request_blocked", 1.0, &[("reason", reason.as_str())]);
        }

        if let Some(severity) = max_severity(&decision.threats) {
            self.monitoring.record_metric(
                "security_threat_detected",
                decision.threats.len() as f64,
                &[("max_severity", severity.as_str())],
            );
        }
    }

    /// Consume a CSRF token issued to `identity`. Single use.
    pub fn validate_csrf_token(&self, token: &str, identity: &str) -> bool {
        self.csrf.validate(token, identity)
    }

    pub fn block_ip(&self, ip: &str, reason: &str) {
        self.blocklist.block(ip, reason);
        warn!("Blocked IP {}: {}", ip, reason);
    }

    pub fn unblock_ip(&self, ip: &str) -> bool {
        let removed = self.blocklist.unblock(ip);
        if removed {
            info!("Unblocked IP {}", ip);
        }
        removed
    }

    pub fn is_blocked(&self, ip: &str) -> bool {
        self.blocklist.contains(ip)
    }

    pub fn blocked_ips(&self) -> Vec<BlockedIp> {
        self.blocklist.list()
    }

    /// Check an API key presented as `<id>.<secret>`. Requires an attached
    /// [`ApiKeyManager`].
    pub fn authenticate_api_key(
        &self,
        presented: &str,
        client_ip: &str,
        origin: Option<&str>,
    ) -> std::result::Result<ApiKeyRecord, ApiKeyError> {
        let Some(manager) = &self.api_keys else {
            return Err(ApiKeyError::NotFound);
        };
        let (id, secret) = presented.split_once('.').ok_or(ApiKeyError::InvalidSecret)?;
        manager.validate(id, secret, client_ip, origin)
    }

    pub fn api_keys(&self) -> Option<&Arc<ApiKeyManager>> {
        self.api_keys.as_ref()
    }

    pub fn stats(&self) -> SecurityStats {
        SecurityStats {
            blocked_ips: self.blocklist.len(),
            active_csrf_tokens: self.csrf.active_count(),
            threat_count: self.threat_log.len(),
            request_counts: self.rate_limiter.request_counts(),
        }
    }

    /// Most recent first.
    pub fn recent_threats(&self, n: usize) -> Vec<ThreatRecord> {
        self.threat_log.recent(n)
    }

    pub fn monitoring(&self) -> &Arc<MonitoringSystem> {
        &self.monitoring
    }

    pub fn headers(&self) -> &SecurityHeaders {
        &self.headers
    }

    pub fn detector(&self) -> &ThreatDetector {
        &self.detector
    }

    /// One sweep over expiring state.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let report = MaintenanceReport {
            expired_tokens: self.csrf.sweep(),
            pruned_threats: self.threat_log.prune(),
            stale_windows: self.rate_limiter.cleanup_old_entries(),
            evicted_keys: self
                .api_keys
                .as_ref()
                .map(|manager| manager.evict_expired())
                .unwrap_or(0),
        };
        debug!("Maintenance sweep: {:?}", report);
        report
    }

    /// Run [`run_maintenance`](Self::run_maintenance) every `interval` on a
    /// background thread. A failing sweep is logged and retried next tick.
    pub fn spawn_maintenance(self: Arc<Self>, interval: Duration) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name("guard-maintenance".to_string())
            .spawn(move || loop {
                thread::sleep(interval);
                match panic::catch_unwind(AssertUnwindSafe(|| self.run_maintenance())) {
                    Ok(report) => info!(
                        "Maintenance: {} tokens, {} threats, {} windows, {} keys removed",
                        report.expired_tokens,
                        report.pruned_threats,
                        report.stale_windows,
                        report.evicted_keys
                    ),
                    Err(_) => error!("Maintenance sweep failed, retrying next tick"),
                }
            })?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ApiKeyConfig;
    use crate::monitoring::{AlertCondition, AlertRule};
    use crate::security::{ApiKeyOptions, MemoryKeyStore};

    fn pipeline_with(config: SecurityConfig) -> (SecurityPipeline, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let pipeline = SecurityPipeline::with_clock(&config, clock.clone()).unwrap();
        (pipeline, clock)
    }

    fn pipeline() -> (SecurityPipeline, Arc<ManualClock>) {
        pipeline_with(SecurityConfig::default())
    }

    fn get(ip: &str) -> SecurityRequest {
        SecurityRequest::new("GET", "/api/services", ip)
    }

    #[test]
    fn test_clean_get_is_allowed_without_token() {
        let (pipeline, _) = pipeline();
        let decision = pipeline.process_request(&get("10.0.0.1"));
        assert!(decision.allowed);
        assert!(!decision.blocked);
        assert!(decision.threats.is_empty());
        assert!(decision.csrf_token.is_none());
        assert_eq!(decision.status_code(), 200);

        let head = SecurityRequest::new("HEAD", "/", "10.0.0.1");
        assert!(pipeline.process_request(&head).csrf_token.is_none());
    }

    #[test]
    fn test_state_changing_methods_get_token() {
        let (pipeline, _) = pipeline();
        for method in ["POST", "PUT", "PATCH", "DELETE"] {
            let request = SecurityRequest::new(method, "/api/bookings", "10.0.0.2")
                .with_body(r#"{"service":"cut"}"#)
                .with_header("Content-Type", "application/json");
            let decision = pipeline.process_request(&request);
            let token = decision.csrf_token.expect(method);
            assert_eq!(token.len(), 64);
        }
    }

    #[test]
    fn test_csrf_disabled_issues_nothing() {
        let mut config = SecurityConfig::default();
        config.csrf.enabled = false;
        let (pipeline, _) = pipeline_with(config);
        let request = SecurityRequest::new("POST", "/api/bookings", "10.0.0.2");
        assert!(pipeline.process_request(&request).csrf_token.is_none());
    }

    #[test]
    fn test_issued_token_is_single_use() {
        let (pipeline, _) = pipeline();
        let request = SecurityRequest::new("POST", "/api/bookings", "10.0.0.3");
        let token = pipeline.process_request(&request).csrf_token.unwrap();
        assert!(pipeline.validate_csrf_token(&token, "10.0.0.3"));
        assert!(!pipeline.validate_csrf_token(&token, "10.0.0.3"));
    }

    #[test]
    fn test_headers_on_every_outcome() {
        let (pipeline, _) = pipeline();
        pipeline.block_ip("10.0.0.9", "abuse");
        let blocked = pipeline.process_request(&get("10.0.0.9"));
        let allowed = pipeline.process_request(&get("10.0.0.1"));

        for decision in [&blocked, &allowed] {
            assert_eq!(decision.header("x-frame-options"), Some("DENY"));
            assert_eq!(decision.header("X-Content-Type-Options"), Some("nosniff"));
            assert!(decision.header("Content-Security-Policy").is_some());
            assert!(decision.header("Strict-Transport-Security").is_some());
        }
    }

    #[test]
    fn test_rate_limit_boundary_and_reset() {
        let mut config = SecurityConfig::default();
        config.rate_limit.max_requests = 3;
        config.rate_limit.window_secs = 60;
        let (pipeline, clock) = pipeline_with(config);

        for _ in 0..3 {
            assert!(pipeline.process_request(&get("10.0.0.4")).allowed);
        }
        let decision = pipeline.process_request(&get("10.0.0.4"));
        assert!(decision.blocked);
        assert_eq!(decision.block_reason, Some(BlockReason::RateLimited));
        assert_eq!(decision.threats[0].threat_type, ThreatType::RateLimit);
        assert_eq!(decision.status_code(), 429);

        clock.advance_secs(60);
        assert!(pipeline.process_request(&get("10.0.0.4")).allowed);
        assert_eq!(pipeline.stats().request_counts["10.0.0.4"], 1);
    }

    #[test]
    fn test_api_key_id_is_rate_limit_identity() {
        let mut config = SecurityConfig::default();
        config.rate_limit.max_requests = 1;
        let (pipeline, _) = pipeline_with(config);

        let keyed = get("10.0.0.5").with_api_key("gk_0011223344556677");
        assert!(pipeline.process_request(&keyed).allowed);
        assert!(pipeline.process_request(&get("10.0.0.5")).allowed);
        assert!(pipeline.process_request(&keyed).blocked);
    }

    #[test]
    fn test_blocklist_round_trip() {
        let (pipeline, _) = pipeline();
        pipeline.block_ip("10.0.0.6", "credential stuffing");
        assert!(pipeline.is_blocked("10.0.0.6"));

        let decision = pipeline.process_request(&get("10.0.0.6"));
        assert!(decision.blocked);
        assert_eq!(decision.block_reason, Some(BlockReason::Blocklisted));
        assert_eq!(decision.threats[0].severity, Severity::High);
        assert_eq!(decision.threats[0].description, BLOCKLIST_MESSAGE);
        assert_eq!(decision.status_code(), 403);

        assert!(pipeline.unblock_ip("10.0.0.6"));
        assert!(!pipeline.unblock_ip("10.0.0.6"));
        assert!(pipeline.process_request(&get("10.0.0.6")).allowed);
    }

    #[test]
    fn test_blocklist_precedes_rate_limit() {
        let mut config = SecurityConfig::default();
        config.rate_limit.max_requests = 1;
        let (pipeline, _) = pipeline_with(config);
        pipeline.block_ip("10.0.0.7", "abuse");
        pipeline.process_request(&get("10.0.0.7"));
        pipeline.process_request(&get("10.0.0.7"));
        assert!(pipeline.stats().request_counts.is_empty());
    }

    #[test]
    fn test_static_network_blocklist() {
        let mut config = SecurityConfig::default();
        config.ip_filter.enabled = true;
        config.ip_filter.blacklist = vec!["192.0.2.0/24".to_string()];
        let (pipeline, _) = pipeline_with(config);

        let decision = pipeline.process_request(&get("192.0.2.44"));
        assert_eq!(decision.block_reason, Some(BlockReason::Blocklisted));
        assert!(pipeline.process_request(&get("198.51.100.1")).allowed);
    }

    #[test]
    fn test_oversized_request() {
        let mut config = SecurityConfig::default();
        config.max_request_size = 1024;
        let (pipeline, _) = pipeline_with(config);

        let request = SecurityRequest::new("POST", "/upload", "10.0.0.8").with_content_length(4096);
        let decision = pipeline.process_request(&request);
        assert_eq!(decision.block_reason, Some(BlockReason::RequestTooLarge));
        assert_eq!(decision.threats[0].threat_type, ThreatType::RateLimit);
        assert_eq!(decision.threats[0].severity, Severity::Medium);
        assert!(decision.csrf_token.is_none());
    }

    #[test]
    fn test_single_high_xss_is_logged_not_blocked() {
        let (pipeline, _) = pipeline();
        let request = get("10.0.0.10").with_header("X-Comment", "<script>alert(1)</script>");
        let decision = pipeline.process_request(&request);

        assert!(decision.allowed);
        assert!(decision
            .threats
            .iter()
            .any(|t| t.threat_type == ThreatType::Xss && t.severity == Severity::High));
        assert!(!pipeline.recent_threats(10).is_empty());
    }

    #[test]
    fn test_critical_injection_blocks() {
        let (pipeline, _) = pipeline();
        let request = SecurityRequest::new("GET", "/api/users?id=1' OR '1'='1", "10.0.0.11");
        let decision = pipeline.process_request(&request);
        assert!(decision.blocked);
        assert_eq!(decision.block_reason, Some(BlockReason::Threat));
        assert!(decision.csrf_token.is_none());
        assert!(decision.error_body().contains("\"threats\""));
    }

    #[test]
    fn test_combined_high_signals_escalate() {
        let (pipeline, _) = pipeline();
        let request = SecurityRequest::new("GET", "/files/../../etc/passwd", "10.0.0.20")
            .with_header("X-Comment", "<script>alert(1)</script>");
        let decision = pipeline.process_request(&request);
        assert!(decision.blocked);
        assert_eq!(decision.block_reason, Some(BlockReason::Threat));
        assert!(decision.threats.iter().all(|t| t.blocked));
    }

    #[test]
    fn test_fault_becomes_critical_injection_block() {
        let (pipeline, _) = pipeline();
        let decision = pipeline.fault_decision(&get("10.0.0.21"), "boom");
        assert!(decision.blocked);
        assert_eq!(decision.block_reason, Some(BlockReason::ProcessingError));
        assert_eq!(decision.threats[0].threat_type, ThreatType::Injection);
        assert_eq!(decision.threats[0].severity, Severity::Critical);
        assert_eq!(decision.status_code(), 403);
    }

    #[test]
    fn test_malformed_json_body_blocks() {
        let (pipeline, _) = pipeline();
        let request = SecurityRequest::new("POST", "/api/bookings", "10.0.0.12")
            .with_header("Content-Type", "application/json")
            .with_body("{not json");
        let decision = pipeline.process_request(&request);
        assert!(decision.blocked);
        assert!(decision
            .threats
            .iter()
            .any(|t| t.threat_type == ThreatType::Injection && t.severity == Severity::Critical));
    }

    #[test]
    fn test_metrics_recorded() {
        let (pipeline, _) = pipeline();
        pipeline.block_ip("10.0.0.13", "abuse");
        pipeline.process_request(&get("10.0.0.1"));
        pipeline.process_request(&get("10.0.0.13"));

        let monitoring = pipeline.monitoring();
        assert_eq!(monitoring.series("security_request_processed").len(), 2);
        let blocked = monitoring.series("security_request_blocked");
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].labels["reason"], "blocklisted");
        assert_eq!(monitoring.series("security_threat_detected")[0].value, 1.0);
    }

    #[test]
    fn test_stats_and_recent_threats_order() {
        let (pipeline, clock) = pipeline();
        pipeline.block_ip("10.0.0.14", "abuse");
        pipeline.process_request(&get("10.0.0.14"));
        clock.advance_secs(1);
        pipeline.process_request(&SecurityRequest::new("GET", "/../../etc/passwd", "10.0.0.15"));
        pipeline.process_request(&SecurityRequest::new("POST", "/api/bookings", "10.0.0.15"));

        let stats = pipeline.stats();
        assert_eq!(stats.blocked_ips, 1);
        assert_eq!(stats.active_csrf_tokens, 1);
        assert!(stats.threat_count >= 2);

        let recent = pipeline.recent_threats(10);
        assert_eq!(recent.last().unwrap().source, "10.0.0.14");
        assert_eq!(recent[0].source, "10.0.0.15");
    }

    #[test]
    fn test_allowed_origin_echoed() {
        let mut config = SecurityConfig::default();
        config.allowed_origins = vec!["https://salon.test".to_string()];
        let (pipeline, _) = pipeline_with(config);

        let request = get("10.0.0.16").with_header("Origin", "https://salon.test");
        let decision = pipeline.process_request(&request);
        assert_eq!(decision.header("Access-Control-Allow-Origin"), Some("https://salon.test"));

        let request = get("10.0.0.16").with_header("Origin", "https://evil.test");
        let decision = pipeline.process_request(&request);
        assert!(decision.header("Access-Control-Allow-Origin").is_none());
    }

    #[test]
    fn test_maintenance_sweeps_expired_state() {
        let (pipeline, clock) = pipeline();
        pipeline.process_request(&SecurityRequest::new("POST", "/api/bookings", "10.0.0.17"));
        pipeline.block_ip("10.0.0.18", "abuse");
        pipeline.process_request(&get("10.0.0.18"));

        clock.advance_secs(2 * 24 * 60 * 60);
        let report = pipeline.run_maintenance();
        assert_eq!(report.expired_tokens, 1);
        assert_eq!(report.pruned_threats, 1);
        assert_eq!(report.stale_windows, 1);
        assert_eq!(pipeline.stats().threat_count, 0);
    }

    #[test]
    fn test_authenticate_api_key() {
        let clock = Arc::new(ManualClock::default());
        let manager = Arc::new(ApiKeyManager::with_clock(
            Arc::new(MemoryKeyStore::new()),
            &ApiKeyConfig::default(),
            clock.clone(),
        ));
        let key = manager.generate("widget", ApiKeyOptions::default()).unwrap();
        let pipeline = SecurityPipeline::with_clock(&SecurityConfig::default(), clock)
            .unwrap()
            .with_api_keys(manager);

        let presented = format!("{}.{}", key.id, key.secret);
        assert_eq!(
            pipeline.authenticate_api_key(&presented, "10.0.0.19", None).unwrap().id,
            key.id
        );
        assert!(matches!(
            pipeline.authenticate_api_key(&key.id, "10.0.0.19", None),
            Err(ApiKeyError::InvalidSecret)
        ));
    }

    #[test]
    fn test_admit_refuses_before_body_arrives() {
        let mut config = SecurityConfig::default();
        config.rate_limit.max_requests = 1;
        config.max_request_size = 1024;
        let (pipeline, _) = pipeline_with(config);

        pipeline.block_ip("10.0.0.30", "abuse");
        let post = |ip: &str| {
            SecurityRequest::new("POST", "/api/bookings", ip).with_content_length(64)
        };
        let listed = pipeline.admit(&post("10.0.0.30")).unwrap();
        assert_eq!(listed.block_reason, Some(BlockReason::Blocklisted));
        assert!(listed.header("X-Frame-Options").is_some());

        let huge = SecurityRequest::new("POST", "/upload", "10.0.0.31").with_content_length(4096);
        let refused = pipeline.admit(&huge).unwrap();
        assert_eq!(refused.block_reason, Some(BlockReason::RequestTooLarge));

        assert!(pipeline.admit(&post("10.0.0.32")).is_none());
        let limited = pipeline.admit(&post("10.0.0.32")).unwrap();
        assert_eq!(limited.block_reason, Some(BlockReason::RateLimited));
        assert_eq!(limited.status_code(), 429);
    }

    #[test]
    fn test_admit_then_inspect_counts_once() {
        let mut config = SecurityConfig::default();
        config.rate_limit.max_requests = 1;
        let (pipeline, _) = pipeline_with(config);

        let request = SecurityRequest::new("POST", "/api/bookings", "10.0.0.33")
            .with_body(r#"{"service":"trim"}"#);
        assert!(pipeline.admit(&request).is_none());
        let decision = pipeline.inspect(&request);
        assert!(decision.allowed);
        assert!(decision.csrf_token.is_some());

        // inspect neither consumes rate budget nor double-records
        assert_eq!(pipeline.stats().request_counts["10.0.0.33"], 1);
        let processed = pipeline.monitoring().series("security_request_processed");
        assert_eq!(processed.len(), 1);
    }

    #[test]
    fn test_inspect_rechecks_streamed_size() {
        let mut config = SecurityConfig::default();
        config.max_request_size = 8;
        let (pipeline, _) = pipeline_with(config);

        let request = SecurityRequest::new("POST", "/upload", "10.0.0.34");
        assert!(pipeline.admit(&request).is_none());
        let request = request.with_body("far more than eight bytes");
        let decision = pipeline.inspect(&request);
        assert_eq!(decision.block_reason, Some(BlockReason::RequestTooLarge));
    }

    #[test]
    fn test_presented_csrf_token() {
        let (pipeline, _) = pipeline();
        let issued = SecurityRequest::new("POST", "/api/bookings", "10.0.0.35");
        let token = pipeline.process_request(&issued).csrf_token.unwrap();

        let presenting = |value: &str| {
            SecurityRequest::new("POST", "/api/bookings", "10.0.0.35")
                .with_header(CSRF_TOKEN_HEADER, value)
        };
        assert!(pipeline.check_presented_csrf(&presenting(&token)).is_none());

        let replay = pipeline.check_presented_csrf(&presenting(&token)).unwrap();
        assert_eq!(replay.block_reason, Some(BlockReason::InvalidCsrfToken));
        assert_eq!(replay.status_code(), 403);
        assert_eq!(replay.threats[0].threat_type, ThreatType::SuspiciousHeader);

        // Absent tokens and safe methods are not checked
        assert!(pipeline.check_presented_csrf(&issued).is_none());
        let safe = get("10.0.0.35").with_header(CSRF_TOKEN_HEADER, "bogus");
        assert!(pipeline.check_presented_csrf(&safe).is_none());
    }

    #[test]
    fn test_huge_runtime_cooldown_keeps_pipeline_running() {
        let (pipeline, clock) = pipeline();
        pipeline.monitoring().add_alert_rule(AlertRule::new(
            "every_request",
            "security_request_processed",
            AlertCondition::Gt,
            0.0,
            Severity::Low,
            10_000_000_000_000_000,
        ));

        assert!(pipeline.process_request(&get("10.0.0.36")).allowed);
        clock.advance_secs(3600);
        assert!(pipeline.process_request(&get("10.0.0.36")).allowed);
        assert_eq!(pipeline.monitoring().active_alerts().len(), 1);
    }

    #[test]
    fn test_unbounded_ttl_rejected() {
        let mut config = SecurityConfig::default();
        config.csrf.ttl_secs = u64::MAX;
        assert!(matches!(
            SecurityPipeline::new(&config),
            Err(SecurityError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_static_network_rejected() {
        let mut config = SecurityConfig::default();
        config.ip_filter.blacklist = vec!["not-a-network".to_string()];
        assert!(matches!(
            SecurityPipeline::new(&config),
            Err(SecurityError::Config(_))
        ));
    }
}
