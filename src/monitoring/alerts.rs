use super::Metric;
use crate::clock::{self, system_clock, SharedClock};
use crate::security::Severity;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use uuid::Uuid;

const MAX_ALERT_HISTORY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertCondition {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Ne,
}

impl AlertCondition {
    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        match self {
            AlertCondition::Gt => value > threshold,
            AlertCondition::Gte => value >= threshold,
            AlertCondition::Lt => value < threshold,
            AlertCondition::Lte => value <= threshold,
            AlertCondition::Eq => (value - threshold).abs() < f64::EPSILON,
            AlertCondition::Ne => (value - threshold).abs() >= f64::EPSILON,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            AlertCondition::Gt => ">",
            AlertCondition::Gte => ">=",
            AlertCondition::Lt => "<",
            AlertCondition::Lte => "<=",
            AlertCondition::Eq => "==",
            AlertCondition::Ne => "!=",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertRule {
    pub id: String,
    pub metric: String,
    pub condition: AlertCondition,
    pub threshold: f64,
    pub severity: Severity,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default)]
    pub description: String,
}

fn default_enabled() -> bool {
    true
}

fn default_cooldown_secs() -> u64 {
    300
}

impl AlertRule {
    pub fn new(
        id: &str,
        metric: &str,
        condition: AlertCondition,
        threshold: f64,
        severity: Severity,
        cooldown_secs: u64,
    ) -> Self {
        Self {
            id: id.to_string(),
            metric: metric.to_string(),
            condition,
            threshold,
            severity,
            enabled: true,
            cooldown_secs,
            description: String::new(),
        }
    }
}

/// Rules every engine starts with.
pub fn default_alert_rules() -> Vec<AlertRule> {
    vec![
        AlertRule {
            description: "Response time above 5s".to_string(),
            ..AlertRule::new(
                "high_response_time",
                "response_time_ms",
                AlertCondition::Gt,
                5000.0,
                Severity::High,
                300,
            )
        },
        AlertRule {
            description: "Error rate above 5%".to_string(),
            ..AlertRule::new(
                "high_error_rate",
                "error_rate",
                AlertCondition::Gt,
                0.05,
                Severity::Critical,
                300,
            )
        },
    ]
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub metric: String,
    pub metric_value: f64,
    pub threshold: f64,
    pub severity: Severity,
    pub message: String,
    pub fired_at: DateTime<Utc>,
    pub is_resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Notification callback. An `Err` or a panic is logged and does not stop
/// the remaining handlers.
pub type AlertHandler = Arc<dyn Fn(&Alert) -> Result<(), String> + Send + Sync>;

struct RuleState {
    rule: AlertRule,
    last_fired_at: Option<DateTime<Utc>>,
}

pub struct AlertEngine {
    rules: RwLock<Vec<RuleState>>,
    alerts: RwLock<VecDeque<Alert>>,
    handlers: RwLock<HashMap<String, Vec<AlertHandler>>>,
    clock: SharedClock,
}

impl AlertEngine {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            alerts: RwLock::new(VecDeque::new()),
            handlers: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Engine preloaded with [`default_alert_rules`].
    pub fn with_default_rules(clock: SharedClock) -> Self {
        let engine = Self::with_clock(clock);
        for rule in default_alert_rules() {
            engine.add_rule(rule);
        }
        engine
    }

    /// Add or replace the rule with the same id.
    pub fn add_rule(&self, rule: AlertRule) {
        let mut rules = self.rules.write();
        if let Some(existing) = rules.iter_mut().find(|s| s.rule.id == rule.id) {
            existing.rule = rule;
            return;
        }
        rules.push(RuleState {
            rule,
            last_fired_at: None,
        });
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|s| s.rule.id != rule_id);
        let removed = rules.len() != before;
        if removed {
            self.handlers.write().remove(rule_id);
        }
        removed
    }

    pub fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> bool {
        match self.rules.write().iter_mut().find(|s| s.rule.id == rule_id) {
            Some(state) => {
                state.rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        self.rules.read().iter().map(|s| s.rule.clone()).collect()
    }

    pub fn register_handler(&self, rule_id: &str, handler: AlertHandler) {
        self.handlers
            .write()
            .entry(rule_id.to_string())
            .or_default()
            .push(handler);
    }

    /// Evaluate every enabled rule watching `metric.name`. Returns the alerts
    /// that fired.
    pub fn evaluate(&self, metric: &Metric) -> Vec<Alert> {
        let now = self.clock.now();
        let mut fired = Vec::new();

        {
            let mut rules = self.rules.write();
            for state in rules.iter_mut() {
                let rule = &state.rule;
                if !rule.enabled || rule.metric != metric.name {
                    continue;
                }
                if !rule.condition.evaluate(metric.value, rule.threshold) {
                    continue;
                }

                let cooldown = clock::seconds(rule.cooldown_secs);
                if let Some(last) = state.last_fired_at {
                    if now - last < cooldown {
                        continue;
                    }
                }

                state.last_fired_at = Some(now);
                fired.push(Alert {
                    id: Uuid::new_v4().to_string(),
                    rule_id: rule.id.clone(),
                    metric: metric.name.clone(),
                    metric_value: metric.value,
                    threshold: rule.threshold,
                    severity: rule.severity,
                    message: format!(
                        "{} {} {} (value {})",
                        metric.name,
                        rule.condition.symbol(),
                        rule.threshold,
                        metric.value
                    ),
                    fired_at: now,
                    is_resolved: false,
                    resolved_at: None,
                });
            }
        }

        if fired.is_empty() {
            return fired;
        }

        {
            let mut alerts = self.alerts.write();
            for alert in &fired {
                warn!(
                    "Alert fired - rule: {}, severity: {}, {}",
                    alert.rule_id, alert.severity, alert.message
                );
                alerts.push_back(alert.clone());
            }
            while alerts.len() > MAX_ALERT_HISTORY {
                alerts.pop_front();
            }
        }

        for alert in &fired {
            self.notify(alert);
        }

        fired
    }

    fn notify(&self, alert: &Alert) {
        let handlers = self
            .handlers
            .read()
            .get(&alert.rule_id)
            .cloned()
            .unwrap_or_default();

        for (index, handler) in handlers.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(alert))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(
                    "Alert handler {} for rule {} failed: {}",
                    index, alert.rule_id, e
                ),
                Err(_) => error!(
                    "Alert handler {} for rule {} panicked",
                    index, alert.rule_id
                ),
            }
        }
    }

    /// Mark an open alert resolved. Unknown or already resolved ids return false.
    pub fn resolve(&self, alert_id: &str) -> bool {
        let mut alerts = self.alerts.write();
        match alerts
            .iter_mut()
            .find(|a| a.id == alert_id && !a.is_resolved)
        {
            Some(alert) => {
                alert.is_resolved = true;
                alert.resolved_at = Some(self.clock.now());
                info!("Alert {} for rule {} resolved", alert.id, alert.rule_id);
                true
            }
            None => false,
        }
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts
            .read()
            .iter()
            .filter(|a| !a.is_resolved)
            .cloned()
            .collect()
    }

    /// Most recent first.
    pub fn history(&self, limit: usize) -> Vec<Alert> {
        self.alerts.read().iter().rev().take(limit).cloned().collect()
    }
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new()
    }
}
