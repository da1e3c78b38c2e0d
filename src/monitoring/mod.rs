pub mod alerts;
pub mod collector;
pub mod exporter;
pub mod health;
pub mod metrics_store;

pub use alerts::*;
pub use collector::*;
pub use exporter::*;
pub use health::*;
pub use metrics_store::*;

use crate::clock::{system_clock, SharedClock};
use crate::config::MonitoringConfig;
use chrono::{DateTime, Duration, Utc};
use log::debug;

/// Metric series, alert rules and service health behind one handle.
pub struct MonitoringSystem {
    store: MetricsStore,
    alerts: AlertEngine,
    health: HealthRegistry,
}

impl MonitoringSystem {
    pub fn new(config: &MonitoringConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: &MonitoringConfig, clock: SharedClock) -> Self {
        let alerts = if config.default_alert_rules {
            AlertEngine::with_default_rules(clock.clone())
        } else {
            AlertEngine::with_clock(clock.clone())
        };
        for rule in &config.alert_rules {
            alerts.add_rule(rule.clone());
        }

        let store = MetricsStore::with_clock(config.max_points_per_series, clock.clone());
        store.describe(
            "security_request_processed",
            "Requests evaluated by the security pipeline",
        );
        store.describe(
            "security_request_blocked",
            "Requests refused by the security pipeline",
        );
        store.describe(
            "security_threat_detected",
            "Threat records produced per request",
        );

        Self {
            store,
            alerts,
            health: HealthRegistry::with_clock(clock),
        }
    }

    /// Append a point and run alert rules against it.
    pub fn record_metric(&self, name: &str, value: f64, labels: &[(&str, &str)]) -> Vec<Alert> {
        let metric = self.store.record(name, value, self::labels(labels));
        let fired = self.alerts.evaluate(&metric);
        if !fired.is_empty() {
            debug!("{} alert(s) fired on {}", fired.len(), name);
        }
        fired
    }

    pub fn metrics(&self, name: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Metric> {
        self.store.range(name, from, to)
    }

    pub fn series(&self, name: &str) -> Vec<Metric> {
        self.store.series(name)
    }

    pub fn aggregated_metrics(&self, name: &str, interval: Duration) -> Aggregate {
        self.store.aggregate(name, interval)
    }

    pub fn export_prometheus_metrics(&self) -> String {
        export_prometheus(&self.store)
    }

    pub fn add_alert_rule(&self, rule: AlertRule) {
        self.alerts.add_rule(rule);
    }

    pub fn remove_alert_rule(&self, rule_id: &str) -> bool {
        self.alerts.remove_rule(rule_id)
    }

    pub fn alert_rules(&self) -> Vec<AlertRule> {
        self.alerts.rules()
    }

    pub fn register_alert_handler(&self, rule_id: &str, handler: AlertHandler) {
        self.alerts.register_handler(rule_id, handler);
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts.active_alerts()
    }

    pub fn alert_history(&self, limit: usize) -> Vec<Alert> {
        self.alerts.history(limit)
    }

    pub fn resolve_alert(&self, alert_id: &str) -> bool {
        self.alerts.resolve(alert_id)
    }

    /// Store the latest report for `service` and record its response time.
    pub fn update_health_check(
        &self,
        service: &str,
        status: HealthStatus,
        response_time_ms: f64,
        details: serde_json::Value,
    ) -> HealthCheck {
        let check = self
            .health
            .update(service, status, response_time_ms, details);
        self.record_metric(
            "health_check_response_time_ms",
            response_time_ms,
            &[("service", service)],
        );
        check
    }

    pub fn system_health(&self) -> SystemHealth {
        self.health.system_health()
    }

    /// Drop metric points older than `max_age`.
    pub fn prune_metrics(&self, max_age: Duration) -> usize {
        self.store.prune(max_age)
    }

    pub fn store(&self) -> &MetricsStore {
        &self.store
    }
}

impl Default for MonitoringSystem {
    fn default() -> Self {
        Self::new(&MonitoringConfig::default())
    }
}
