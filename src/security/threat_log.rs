use super::ThreatRecord;
use crate::clock::{self, system_clock, SharedClock};
use chrono::Duration;
use parking_lot::Mutex;
use std::collections::VecDeque;

pub const DEFAULT_THREAT_LOG_CAPACITY: usize = 1000;
pub const DEFAULT_THREAT_RETENTION_SECS: u64 = 24 * 60 * 60;

/// Capped, time-pruned log of every detected threat.
pub struct ThreatLog {
    entries: Mutex<VecDeque<ThreatRecord>>,
    capacity: usize,
    retention: Duration,
    clock: SharedClock,
}

impl ThreatLog {
    pub fn new(capacity: usize, retention_secs: u64) -> Self {
        Self::with_clock(capacity, retention_secs, system_clock())
    }

    pub fn with_clock(capacity: usize, retention_secs: u64, clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            retention: clock::seconds(retention_secs),
            clock,
        }
    }

    /// Append and trim under one lock.
    pub fn append(&self, records: &[ThreatRecord]) {
        if records.is_empty() {
            return;
        }
        let mut entries = self.entries.lock();
        for record in records {
            entries.push_back(record.clone());
        }
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Most recent first.
    pub fn recent(&self, n: usize) -> Vec<ThreatRecord> {
        self.entries.lock().iter().rev().take(n).cloned().collect()
    }

    /// Drop entries older than the retention period.
    pub fn prune(&self) -> usize {
        let cutoff = self.clock.now() - self.retention;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|r| r.timestamp >= cutoff);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for ThreatLog {
    fn default() -> Self {
        Self::new(DEFAULT_THREAT_LOG_CAPACITY, DEFAULT_THREAT_RETENTION_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::security::{Severity, ThreatType};
    use std::sync::Arc;

    fn record(clock: &ManualClock, n: usize) -> ThreatRecord {
        ThreatRecord::new(
            ThreatType::Xss,
            Severity::High,
            "ip",
            format!("threat {}", n),
            clock.now(),
        )
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let clock = Arc::new(ManualClock::default());
        let log = ThreatLog::with_clock(3, 3600, clock.clone());
        let records: Vec<_> = (0..5).map(|n| record(&clock, n)).collect();
        log.append(&records);

        assert_eq!(log.len(), 3);
        let recent = log.recent(10);
        assert_eq!(recent[0].description, "threat 4");
        assert_eq!(recent[2].description, "threat 2");
    }

    #[test]
    fn test_prune_by_age() {
        let clock = Arc::new(ManualClock::default());
        let log = ThreatLog::with_clock(100, 3600, clock.clone());
        log.append(&[record(&clock, 0)]);
        clock.advance_secs(3601);
        log.append(&[record(&clock, 1)]);

        assert_eq!(log.prune(), 1);
        assert_eq!(log.recent(10)[0].description, "threat 1");
    }

    #[test]
    fn test_concurrent_appends_respect_capacity() {
        let clock = Arc::new(ManualClock::default());
        let log = Arc::new(ThreatLog::with_clock(64, 3600, clock.clone()));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let log = log.clone();
                let clock = clock.clone();
                std::thread::spawn(move || {
                    for i in 0..40 {
                        log.append(&[record(&clock, t * 40 + i)]);
                        assert!(log.len() <= 64);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(log.len(), 64);
        assert_eq!(log.recent(100).len(), 64);
    }
}
