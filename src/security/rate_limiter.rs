use crate::clock::{system_clock, SharedClock, MAX_DURATION_SECS};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::warn;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct RateWindow {
    pub count: u32,
    /// Window start in unix seconds, aligned to a multiple of `window_secs`.
    pub window_start: i64,
    pub window_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// Fixed-window counter keyed by client identity.
///
/// Windows are aligned to `floor(now / window) * window`, so a client can get
/// up to twice its limit through when a burst straddles a boundary.
pub struct RateLimiter {
    windows: Arc<DashMap<String, RateWindow>>,
    max_requests: u32,
    window_secs: u64,
    enabled: bool,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window_secs: u64, enabled: bool) -> Self {
        Self::with_clock(max_requests, window_secs, enabled, system_clock())
    }

    pub fn with_clock(
        max_requests: u32,
        window_secs: u64,
        enabled: bool,
        clock: SharedClock,
    ) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            max_requests,
            window_secs,
            enabled,
            clock,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    /// Check against the configured limit and window.
    pub fn check_rate_limit(&self, identity: &str) -> RateLimitDecision {
        self.check(identity, self.max_requests, self.window_secs)
    }

    /// Count one request for `identity` and report whether it fits in `limit`.
    pub fn check(&self, identity: &str, limit: u32, window_secs: u64) -> RateLimitDecision {
        let now = self.clock.now();

        if !self.enabled {
            return RateLimitDecision {
                allowed: true,
                remaining: limit,
                reset_at: now,
            };
        }

        if window_secs == 0 {
            // Misconfiguration must not turn into an outage.
            warn!(
                "Rate limiter called with zero window for {}, failing open",
                identity
            );
            return RateLimitDecision {
                allowed: true,
                remaining: limit,
                reset_at: now,
            };
        }

        let window = window_secs.min(MAX_DURATION_SECS) as i64;
        let window_start = now.timestamp().div_euclid(window) * window;

        let mut entry = self.windows.entry(identity.to_string()).or_insert(RateWindow {
            count: 0,
            window_start,
            window_secs,
        });

        if entry.window_start != window_start || entry.window_secs != window_secs {
            entry.count = 0;
            entry.window_start = window_start;
            entry.window_secs = window_secs;
        }

        entry.count = entry.count.saturating_add(1);

        let reset_at = DateTime::from_timestamp(window_start + window, 0).unwrap_or(now);

        if entry.count > limit {
            RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at,
            }
        } else {
            RateLimitDecision {
                allowed: true,
                remaining: limit - entry.count,
                reset_at,
            }
        }
    }

    /// Forget the window for `identity`.
    pub fn reset(&self, identity: &str) -> bool {
        self.windows.remove(identity).is_some()
    }

    pub fn request_count(&self, identity: &str) -> Option<u32> {
        self.windows.get(identity).map(|w| w.count)
    }

    /// Request counts of every live window.
    pub fn request_counts(&self) -> HashMap<String, u32> {
        self.windows
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().count))
            .collect()
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Drop windows that ended more than one full window ago.
    pub fn cleanup_old_entries(&self) -> usize {
        let now = self.clock.now().timestamp();
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            now - window.window_start
                <= (window.window_secs.min(MAX_DURATION_SECS) as i64) * 2
        });
        before.saturating_sub(self.windows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn limiter(limit: u32, window: u64) -> (RateLimiter, Arc<ManualClock>) {
        // Start on a window boundary so the tests never straddle one by accident.
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_040, 0).unwrap()));
        let limiter = RateLimiter::with_clock(limit, window, true, clock.clone());
        (limiter, clock)
    }

    #[test]
    fn test_allows_up_to_limit() {
        let (limiter, _) = limiter(3, 60);
        assert_eq!(limiter.check_rate_limit("1.2.3.4").remaining, 2);
        assert_eq!(limiter.check_rate_limit("1.2.3.4").remaining, 1);
        let third = limiter.check_rate_limit("1.2.3.4");
        assert!(third.allowed);
        assert_eq!(third.remaining, 0);

        let fourth = limiter.check_rate_limit("1.2.3.4");
        assert!(!fourth.allowed);
        assert_eq!(fourth.remaining, 0);
    }

    #[test]
    fn test_keys_are_independent() {
        let (limiter, _) = limiter(1, 60);
        assert!(limiter.check_rate_limit("a").allowed);
        assert!(!limiter.check_rate_limit("a").allowed);
        assert!(limiter.check_rate_limit("b").allowed);
    }

    #[test]
    fn test_window_reset() {
        let (limiter, clock) = limiter(2, 60);
        limiter.check_rate_limit("ip");
        limiter.check_rate_limit("ip");
        assert!(!limiter.check_rate_limit("ip").allowed);

        clock.advance_secs(60);
        let decision = limiter.check_rate_limit("ip");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[test]
    fn test_reset_at_is_window_end() {
        let (limiter, clock) = limiter(5, 60);
        clock.advance_secs(15);
        let decision = limiter.check_rate_limit("ip");
        assert_eq!(decision.reset_at.timestamp(), 1_700_000_100);
    }

    #[test]
    fn test_disabled_limiter_allows_everything() {
        let limiter = RateLimiter::new(1, 60, false);
        for _ in 0..10 {
            assert!(limiter.check_rate_limit("ip").allowed);
        }
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_zero_window_fails_open() {
        let (limiter, _) = limiter(0, 60);
        let decision = limiter.check("ip", 0, 0);
        assert!(decision.allowed);
    }

    #[test]
    fn test_cleanup_old_entries() {
        let (limiter, clock) = limiter(10, 60);
        limiter.check_rate_limit("old");
        clock.advance_secs(180);
        limiter.check_rate_limit("fresh");

        assert_eq!(limiter.cleanup_old_entries(), 1);
        assert!(limiter.request_count("old").is_none());
        assert_eq!(limiter.request_count("fresh"), Some(1));
    }

    #[test]
    fn test_concurrent_checks_never_exceed_limit() {
        let (limiter, _) = limiter(50, 60);
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .filter(|_| limiter.check_rate_limit("shared").allowed)
                        .count()
                })
            })
            .collect();
        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(allowed, 50);
        assert_eq!(limiter.request_count("shared"), Some(200));
    }
}
