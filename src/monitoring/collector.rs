use log::warn;
use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

// Registered in the default registry served by pingora's Prometheus service
static TOTAL_REQUESTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("guard_total_requests", "Total HTTP requests").expect("metric creation failed")
});

static ALLOWED_REQUESTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("guard_allowed_requests", "Allowed HTTP requests")
        .expect("metric creation failed")
});

static BLOCKED_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("guard_blocked_requests", "Blocked HTTP requests"),
        &["reason"],
    )
    .expect("metric creation failed")
});

static DETECTED_THREATS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("guard_detected_threats", "Threat records by type"),
        &["threat_type"],
    )
    .expect("metric creation failed")
});

/// Process-wide request counters for the proxy front end.
pub struct MetricsCollector {
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let collectors: [Box<dyn prometheus::core::Collector>; 4] = [
            Box::new(TOTAL_REQUESTS.clone()),
            Box::new(ALLOWED_REQUESTS.clone()),
            Box::new(BLOCKED_REQUESTS.clone()),
            Box::new(DETECTED_THREATS.clone()),
        ];
        for collector in collectors {
            if let Err(e) = prometheus::register(collector) {
                // A second collector in the same process reuses the registration.
                warn!("Prometheus registration skipped: {}", e);
            }
        }

        Self {
            registry: Arc::new(prometheus::default_registry().clone()),
        }
    }

    pub fn increment_allowed_requests(&self) {
        TOTAL_REQUESTS.inc();
        ALLOWED_REQUESTS.inc();
    }

    pub fn increment_blocked_requests(&self, reason: &str) {
        TOTAL_REQUESTS.inc();
        BLOCKED_REQUESTS.with_label_values(&[reason]).inc();
    }

    pub fn increment_threats(&self, threat_type: &str) {
        DETECTED_THREATS.with_label_values(&[threat_type]).inc();
    }

    pub fn total_requests(&self) -> u64 {
        TOTAL_REQUESTS.get()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let collector = MetricsCollector::new();
        let _second = MetricsCollector::new();
        let before = collector.total_requests();

        collector.increment_allowed_requests();
        collector.increment_blocked_requests("rate_limit");
        collector.increment_threats("xss");

        assert!(collector.total_requests() >= before + 2);
        assert!(BLOCKED_REQUESTS.with_label_values(&["rate_limit"]).get() >= 1);
    }
}
