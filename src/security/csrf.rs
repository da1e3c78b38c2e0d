use crate::clock::{self, system_clock, SharedClock};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::debug;
use rand::RngCore;
use std::sync::Arc;

pub const CSRF_TOKEN_BYTES: usize = 32;
pub const DEFAULT_CSRF_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone)]
pub struct CsrfToken {
    pub token: String,
    pub identity: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

impl CsrfToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Single-use, time-bound CSRF tokens.
pub struct CsrfTokenStore {
    tokens: Arc<DashMap<String, CsrfToken>>,
    ttl: Duration,
    clock: SharedClock,
}

impl CsrfTokenStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self::with_clock(ttl_secs, system_clock())
    }

    pub fn with_clock(ttl_secs: u64, clock: SharedClock) -> Self {
        Self {
            tokens: Arc::new(DashMap::new()),
            ttl: clock::seconds(ttl_secs),
            clock,
        }
    }

    /// Issue a fresh token bound to `identity`.
    pub fn issue(&self, identity: &str) -> String {
        let mut bytes = [0u8; CSRF_TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        let now = self.clock.now();
        self.tokens.insert(
            token.clone(),
            CsrfToken {
                token: token.clone(),
                identity: identity.to_string(),
                created_at: now,
                expires_at: now + self.ttl,
                used: false,
            },
        );

        token
    }

    /// Consume `token`. Succeeds at most once per token.
    pub fn validate(&self, token: &str, identity: &str) -> bool {
        let now = self.clock.now();

        // The shard write lock is held for the whole check-and-set.
        let Some(mut entry) = self.tokens.get_mut(token) else {
            debug!("CSRF token not found for {}", identity);
            return false;
        };

        if entry.used {
            debug!("CSRF token replay from {}", identity);
            return false;
        }
        if entry.is_expired(now) {
            debug!("Expired CSRF token from {}", identity);
            return false;
        }
        if entry.identity != identity {
            debug!(
                "CSRF token issued to {} presented by {}",
                entry.identity, identity
            );
            return false;
        }

        entry.used = true;
        true
    }

    /// Remove every token past its expiry, used or not.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.tokens.len();
        self.tokens.retain(|_, t| !t.is_expired(now));
        before.saturating_sub(self.tokens.len())
    }

    /// Tokens that could still be validated.
    pub fn active_count(&self) -> usize {
        let now = self.clock.now();
        self.tokens
            .iter()
            .filter(|t| !t.used && !t.is_expired(now))
            .count()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (CsrfTokenStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (CsrfTokenStore::with_clock(3600, clock.clone()), clock)
    }

    #[test]
    fn test_token_format() {
        let (store, _) = store();
        let token = store.issue("10.0.0.1");
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, store.issue("10.0.0.1"));
    }

    #[test]
    fn test_single_use() {
        let (store, _) = store();
        let token = store.issue("10.0.0.1");
        assert!(store.validate(&token, "10.0.0.1"));
        assert!(!store.validate(&token, "10.0.0.1"));
    }

    #[test]
    fn test_expired_token_rejected() {
        let (store, clock) = store();
        let token = store.issue("10.0.0.1");
        clock.advance_secs(3601);
        assert!(!store.validate(&token, "10.0.0.1"));
    }

    #[test]
    fn test_wrong_identity_rejected() {
        let (store, _) = store();
        let token = store.issue("10.0.0.1");
        assert!(!store.validate(&token, "10.0.0.2"));
        // A mismatched attempt does not burn the token.
        assert!(store.validate(&token, "10.0.0.1"));
    }

    #[test]
    fn test_unknown_token_rejected() {
        let (store, _) = store();
        assert!(!store.validate("deadbeef", "10.0.0.1"));
    }

    #[test]
    fn test_sweep_removes_expired_regardless_of_use() {
        let (store, clock) = store();
        let used = store.issue("a");
        assert!(store.validate(&used, "a"));
        store.issue("b");
        clock.advance_secs(3601);
        store.issue("c");

        assert_eq!(store.sweep(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.active_count(), 1);
    }

    #[test]
    fn test_concurrent_validation_succeeds_once() {
        let store = Arc::new(CsrfTokenStore::new(3600));
        let token = store.issue("ip");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let token = token.clone();
                std::thread::spawn(move || store.validate(&token, "ip"))
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
    }
}
