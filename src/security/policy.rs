use super::{Severity, ThreatRecord, ThreatType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One row of the block policy table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyRule {
    pub threat_type: ThreatType,
    pub severity: Severity,
    pub block: bool,
}

/// Maps `(threat_type, severity)` to a block decision.
///
/// Pairs absent from the table fall back to `default_block`. Independently of
/// the table, a request is blocked once `escalation_threshold` records of high
/// or critical severity accumulate (0 disables escalation).
#[derive(Debug, Clone)]
pub struct BlockPolicy {
    table: HashMap<(ThreatType, Severity), bool>,
    default_block: bool,
    escalation_threshold: usize,
}

const ALL_TYPES: [ThreatType; 5] = [
    ThreatType::Xss,
    ThreatType::Injection,
    ThreatType::PathTraversal,
    ThreatType::SuspiciousHeader,
    ThreatType::RateLimit,
];

const ALL_SEVERITIES: [Severity; 4] = [
    Severity::Low,
    Severity::Medium,
    Severity::High,
    Severity::Critical,
];

impl BlockPolicy {
    pub fn empty(default_block: bool, escalation_threshold: usize) -> Self {
        Self {
            table: HashMap::new(),
            default_block,
            escalation_threshold,
        }
    }

    /// Every critical record blocks, rate-limit records always block, and a
    /// lone high-severity xss/traversal/exploit record is only logged.
    pub fn standard(escalation_threshold: usize) -> Self {
        let mut policy = Self::empty(false, escalation_threshold);
        for threat_type in ALL_TYPES {
            policy.set(threat_type, Severity::Critical, true);
        }
        for severity in ALL_SEVERITIES {
            policy.set(ThreatType::RateLimit, severity, true);
        }
        policy
    }

    /// Standard table with `rules` applied on top.
    pub fn from_rules(rules: &[PolicyRule], escalation_threshold: usize) -> Self {
        let mut policy = Self::standard(escalation_threshold);
        for rule in rules {
            policy.set(rule.threat_type, rule.severity, rule.block);
        }
        policy
    }

    pub fn set(&mut self, threat_type: ThreatType, severity: Severity, block: bool) {
        self.table.insert((threat_type, severity), block);
    }

    pub fn should_block(&self, threat_type: ThreatType, severity: Severity) -> bool {
        self.table
            .get(&(threat_type, severity))
            .copied()
            .unwrap_or(self.default_block)
    }

    pub fn escalation_threshold(&self) -> usize {
        self.escalation_threshold
    }

    /// Mark each record's `blocked` flag and return the aggregate decision.
    pub fn apply(&self, records: &mut [ThreatRecord]) -> bool {
        let mut block = false;
        for record in records.iter_mut() {
            record.blocked = self.should_block(record.threat_type, record.severity);
            block |= record.blocked;
        }

        if !block && self.escalation_threshold > 0 {
            let serious = records
                .iter()
                .filter(|r| r.severity >= Severity::High)
                .count();
            if serious >= self.escalation_threshold {
                for record in records.iter_mut() {
                    record.blocked = true;
                }
                block = true;
            }
        }

        block
    }
}

impl Default for BlockPolicy {
    fn default() -> Self {
        Self::standard(2)
    }
}
