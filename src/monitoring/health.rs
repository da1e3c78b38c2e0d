use crate::clock::{system_clock, SharedClock};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub service: String,
    pub status: HealthStatus,
    pub response_time_ms: f64,
    pub details: serde_json::Value,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub overall: HealthStatus,
    pub services: Vec<HealthCheck>,
    pub summary: HealthSummary,
}

/// Latest health report per service.
pub struct HealthRegistry {
    checks: DashMap<String, HealthCheck>,
    clock: SharedClock,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            checks: DashMap::new(),
            clock,
        }
    }

    pub fn update(
        &self,
        service: &str,
        status: HealthStatus,
        response_time_ms: f64,
        details: serde_json::Value,
    ) -> HealthCheck {
        let check = HealthCheck {
            service: service.to_string(),
            status,
            response_time_ms,
            details,
            checked_at: self.clock.now(),
        };
        self.checks.insert(service.to_string(), check.clone());
        check
    }

    pub fn get(&self, service: &str) -> Option<HealthCheck> {
        self.checks.get(service).map(|c| c.value().clone())
    }

    /// Worst status across services; healthy when nothing has reported.
    pub fn system_health(&self) -> SystemHealth {
        let mut services: Vec<HealthCheck> =
            self.checks.iter().map(|c| c.value().clone()).collect();
        services.sort_by(|a, b| a.service.cmp(&b.service));

        let mut summary = HealthSummary {
            total: services.len(),
            ..Default::default()
        };
        for check in &services {
            match check.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
            }
        }

        let overall = services
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        SystemHealth {
            overall,
            services,
            summary,
        }
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}
