use crate::clock::{system_clock, SharedClock};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{info, warn};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct BlockedIp {
    pub ip: String,
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
}

/// Identities refused before any other check runs.
pub struct Blocklist {
    entries: DashMap<String, BlockedIp>,
    clock: SharedClock,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Block `ip`. Re-blocking replaces the reason and timestamp.
    pub fn block(&self, ip: &str, reason: &str) {
        warn!("Blocking {}: {}", ip, reason);
        self.entries.insert(
            ip.to_string(),
            BlockedIp {
                ip: ip.to_string(),
                reason: reason.to_string(),
                blocked_at: self.clock.now(),
            },
        );
    }

    pub fn unblock(&self, ip: &str) -> bool {
        let removed = self.entries.remove(ip).is_some();
        if removed {
            info!("Unblocked {}", ip);
        }
        removed
    }

    pub fn get(&self, ip: &str) -> Option<BlockedIp> {
        self.entries.get(ip).map(|e| e.value().clone())
    }

    pub fn contains(&self, ip: &str) -> bool {
        self.entries.contains_key(ip)
    }

    pub fn list(&self) -> Vec<BlockedIp> {
        let mut all: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.blocked_at.cmp(&b.blocked_at));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Blocklist {
    fn default() -> Self {
        Self::new()
    }
}
