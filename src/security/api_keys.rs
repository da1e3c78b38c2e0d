use super::ip_filter::{ip_in_networks, parse_network};
use super::key_store::{KeyStore, KeyStoreError};
use super::rate_limiter::RateLimiter;
use crate::clock::{self, system_clock, SharedClock};
use crate::config::ApiKeyConfig;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use ipnetwork::IpNetwork;
use log::{debug, info, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;

pub const API_KEY_PREFIX: &str = "gk_";

#[derive(Debug, Error)]
pub enum ApiKeyError {
    #[error("API key not found")]
    NotFound,
    #[error("API key has been revoked")]
    Revoked,
    #[error("API key has expired")]
    Expired,
    #[error("API key secret does not match")]
    InvalidSecret,
    #[error("IP {0} is not allowed for this key")]
    IpNotAllowed(String),
    #[error("origin {0} is not allowed for this key")]
    OriginNotAllowed(String),
    #[error("API key rate limit exceeded, resets at {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },
    #[error("invalid allowed network: {0}")]
    InvalidNetwork(String),
    #[error(transparent)]
    Store(#[from] KeyStoreError),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct KeyRateLimit {
    pub max_requests: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub name: String,
    pub secret_hash: String,
    pub permissions: Vec<String>,
    pub rate_limit: KeyRateLimit,
    pub allowed_ips: Vec<String>,
    pub allowed_origins: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions
            .iter()
            .any(|p| p == "*" || p == permission)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now > at).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApiKeyOptions {
    pub permissions: Vec<String>,
    pub rate_limit: Option<KeyRateLimit>,
    pub allowed_ips: Vec<String>,
    pub allowed_origins: Vec<String>,
    pub expires_in: Option<Duration>,
}

/// Returned once at creation; the secret is not recoverable afterwards.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub id: String,
    pub secret: String,
    pub record: ApiKeyRecord,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ApiKeyUsage {
    pub total_requests: u64,
    pub rejected_requests: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

struct CachedKey {
    record: ApiKeyRecord,
    cached_at: DateTime<Utc>,
}

/// API key lifecycle and per-request validation.
///
/// Records are written through to the [`KeyStore`] on create and revoke, and
/// read through on cache miss. Usage counters live in memory only.
pub struct ApiKeyManager {
    store: Arc<dyn KeyStore>,
    cache: DashMap<String, CachedKey>,
    usage: DashMap<String, ApiKeyUsage>,
    limiter: RateLimiter,
    cache_ttl: Duration,
    default_rate_limit: KeyRateLimit,
    clock: SharedClock,
}

impl ApiKeyManager {
    pub fn new(store: Arc<dyn KeyStore>, config: &ApiKeyConfig) -> Self {
        Self::with_clock(store, config, system_clock())
    }

    pub fn with_clock(store: Arc<dyn KeyStore>, config: &ApiKeyConfig, clock: SharedClock) -> Self {
        let default_rate_limit = KeyRateLimit {
            max_requests: config.default_rate_limit,
            window_secs: config.default_window_secs,
        };
        Self {
            store,
            cache: DashMap::new(),
            usage: DashMap::new(),
            limiter: RateLimiter::with_clock(
                default_rate_limit.max_requests,
                default_rate_limit.window_secs,
                true,
                clock.clone(),
            ),
            cache_ttl: clock::seconds(config.cache_ttl_secs),
            default_rate_limit,
            clock,
        }
    }

    pub fn generate(
        &self,
        name: &str,
        options: ApiKeyOptions,
    ) -> Result<GeneratedKey, ApiKeyError> {
        for entry in &options.allowed_ips {
            parse_network(entry).map_err(ApiKeyError::InvalidNetwork)?;
        }

        let id = format!("{}{}", API_KEY_PREFIX, random_hex(8));
        let secret = random_hex(32);
        let now = self.clock.now();

        let record = ApiKeyRecord {
            id: id.clone(),
            name: name.to_string(),
            secret_hash: hash_secret(&secret),
            permissions: options.permissions,
            rate_limit: options.rate_limit.unwrap_or(self.default_rate_limit),
            allowed_ips: options.allowed_ips,
            allowed_origins: options.allowed_origins,
            expires_at: options.expires_in.map(|d| now + d),
            is_active: true,
            created_at: now,
            last_used_at: None,
        };

        self.store.save(&record)?;
        self.cache_record(record.clone());
        info!("Generated API key {} ({})", id, name);

        Ok(GeneratedKey { id, secret, record })
    }

    /// Check `secret` for key `id` coming from `client_ip` / `origin` and
    /// count the request against the key's rate limit.
    pub fn validate(
        &self,
        id: &str,
        secret: &str,
        client_ip: &str,
        origin: Option<&str>,
    ) -> Result<ApiKeyRecord, ApiKeyError> {
        let record = self.lookup(id)?.ok_or(ApiKeyError::NotFound)?;

        let result = self.check(&record, secret, client_ip, origin);
        let now = self.clock.now();

        let mut usage = self.usage.entry(id.to_string()).or_default();
        usage.total_requests += 1;
        match &result {
            Ok(_) => {
                usage.last_used_at = Some(now);
                drop(usage);
                if let Some(mut cached) = self.cache.get_mut(id) {
                    cached.record.last_used_at = Some(now);
                }
            }
            Err(e) => {
                usage.rejected_requests += 1;
                debug!("API key {} rejected: {}", id, e);
            }
        }

        result.map(|_| {
            let mut record = record;
            record.last_used_at = Some(now);
            record
        })
    }

    fn check(
        &self,
        record: &ApiKeyRecord,
        secret: &str,
        client_ip: &str,
        origin: Option<&str>,
    ) -> Result<(), ApiKeyError> {
        if !record.is_active {
            return Err(ApiKeyError::Revoked);
        }
        if record.is_expired(self.clock.now()) {
            return Err(ApiKeyError::Expired);
        }

        let presented = hash_secret(secret);
        if !bool::from(presented.as_bytes().ct_eq(record.secret_hash.as_bytes())) {
            return Err(ApiKeyError::InvalidSecret);
        }

        if !record.allowed_ips.is_empty() {
            let networks: Vec<IpNetwork> = record
                .allowed_ips
                .iter()
                .filter_map(|entry| parse_network(entry).ok())
                .collect();
            if !ip_in_networks(client_ip, &networks) {
                return Err(ApiKeyError::IpNotAllowed(client_ip.to_string()));
            }
        }

        if !record.allowed_origins.is_empty() {
            let allowed = origin
                .map(|o| record.allowed_origins.iter().any(|a| a == "*" || a == o))
                .unwrap_or(false);
            if !allowed {
                return Err(ApiKeyError::OriginNotAllowed(
                    origin.unwrap_or("<none>").to_string(),
                ));
            }
        }

        let decision = self.limiter.check(
            &record.id,
            record.rate_limit.max_requests,
            record.rate_limit.window_secs,
        );
        if !decision.allowed {
            return Err(ApiKeyError::RateLimited {
                reset_at: decision.reset_at,
            });
        }

        Ok(())
    }

    /// Deactivate a key. Returns false when the key does not exist.
    pub fn revoke(&self, id: &str) -> Result<bool, ApiKeyError> {
        let Some(mut record) = self.lookup(id)? else {
            return Ok(false);
        };
        record.is_active = false;
        self.store.save(&record)?;
        self.cache_record(record);
        self.limiter.reset(id);
        warn!("Revoked API key {}", id);
        Ok(true)
    }

    pub fn get(&self, id: &str) -> Result<Option<ApiKeyRecord>, ApiKeyError> {
        self.lookup(id)
    }

    pub fn list(&self) -> Result<Vec<ApiKeyRecord>, ApiKeyError> {
        Ok(self.store.list()?)
    }

    pub fn usage(&self, id: &str) -> Option<ApiKeyUsage> {
        self.usage.get(id).map(|u| u.value().clone())
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// Drop cache entries older than the cache TTL.
    pub fn evict_expired(&self) -> usize {
        let cutoff = self.clock.now() - self.cache_ttl;
        let before = self.cache.len();
        self.cache.retain(|_, cached| cached.cached_at >= cutoff);
        let evicted = before.saturating_sub(self.cache.len());
        self.limiter.cleanup_old_entries();
        evicted
    }

    fn lookup(&self, id: &str) -> Result<Option<ApiKeyRecord>, ApiKeyError> {
        if let Some(cached) = self.cache.get(id) {
            if cached.cached_at >= self.clock.now() - self.cache_ttl {
                return Ok(Some(cached.record.clone()));
            }
        }

        let loaded = self.store.load(id)?;
        if let Some(record) = &loaded {
            self.cache_record(record.clone());
        }
        Ok(loaded)
    }

    fn cache_record(&self, record: ApiKeyRecord) {
        self.cache.insert(
            record.id.clone(),
            CachedKey {
                record,
                cached_at: self.clock.now(),
            },
        );
    }
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}
