//! Three-tier fixed-window rate limiting over a shared counter store.
//!
//! Tiers are evaluated global → per-caller → per-key; the first denial
//! short-circuits the cascade. The store is advisory: any transport error
//! fails open so a redis outage never takes the gateway down with it.

pub mod store;

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::config::{RateLimitConfig, TierLimit};

pub use store::RedisCounterStore;

#[derive(Debug, Error)]
pub enum RateStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Atomic counter store shared by every gateway instance.
#[async_trait::async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increments `key` and reads its TTL in one round-trip.
    /// A bucket created by this call carries `window_secs` of expiry.
    async fn increment_and_ttl(
        &self,
        key: &str,
        window_secs: u64,
    ) -> Result<(u64, i64), RateStoreError>;

    async fn set_expiry(&self, key: &str, secs: u64) -> Result<(), RateStoreError>;

    async fn get(&self, key: &str) -> Result<Option<u64>, RateStoreError>;

    async fn keys_matching(&self, prefix: &str) -> Result<Vec<String>, RateStoreError>;

    async fn delete(&self, keys: &[String]) -> Result<u64, RateStoreError>;

    async fn ping(&self) -> Result<(), RateStoreError>;
}

pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0))
            .as_secs()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Global,
    PerCaller,
    PerKey,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Global => "global",
            Tier::PerCaller => "caller",
            Tier::PerKey => "key",
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "global" => Ok(Tier::Global),
            "caller" => Ok(Tier::PerCaller),
            "key" => Ok(Tier::PerKey),
            other => Err(format!("unknown rate limit tier: {other}")),
        }
    }
}

/// Immutable outcome of one admission check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub tier: Tier,
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_epoch: Option<u64>,
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    /// Store unreachable: admit the request and emit no headers.
    fn fail_open(tier: Tier) -> Self {
        Self {
            allowed: true,
            tier,
            limit: None,
            remaining: None,
            reset_epoch: None,
            retry_after_secs: None,
        }
    }
}

/// Current bucket state read without incrementing, for the admin surface.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct TierStatus {
    pub tier: Tier,
    pub count: u64,
    pub limit: u64,
    pub window_start: u64,
    pub reset_epoch: u64,
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
    clock: Box<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self::with_clock(store, config, Box::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn CounterStore>,
        config: RateLimitConfig,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    fn tier_limit(&self, tier: Tier) -> TierLimit {
        match tier {
            Tier::Global => self.config.global,
            Tier::PerCaller => self.config.per_caller,
            Tier::PerKey => self.config.per_key,
        }
    }

    fn bucket_key(tier: Tier, identifier: &str, window_start: u64) -> String {
        format!("rate_limit:{}:{identifier}:{window_start}", tier.as_str())
    }

    /// Evaluates the tier cascade for one request. `api_key_fingerprint`
    /// being absent skips the per-key tier entirely.
    pub async fn check(
        &self,
        caller_fingerprint: &str,
        api_key_fingerprint: Option<&str>,
    ) -> RateLimitDecision {
        let mut tiers: Vec<(Tier, &str)> =
            vec![(Tier::Global, "global"), (Tier::PerCaller, caller_fingerprint)];
        if let Some(key_fp) = api_key_fingerprint {
            tiers.push((Tier::PerKey, key_fp));
        }

        let now = self.clock.now_epoch_seconds();
        let mut allowed = Vec::with_capacity(tiers.len());

        for (tier, identifier) in tiers {
            let TierLimit { max, window_secs } = self.tier_limit(tier);
            let window_start = now - (now % window_secs);
            let key = Self::bucket_key(tier, identifier, window_start);

            let (count, ttl) = match self.store.increment_and_ttl(&key, window_secs).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(tier = tier.as_str(), error = %err, "rate limit store unreachable, failing open");
                    return RateLimitDecision::fail_open(tier);
                }
            };

            // A bucket without an expiry would outlive its window.
            if ttl < 0 {
                if let Err(err) = self.store.set_expiry(&key, window_secs).await {
                    warn!(tier = tier.as_str(), error = %err, "rate limit store unreachable, failing open");
                    return RateLimitDecision::fail_open(tier);
                }
            }

            let reset_epoch = window_start + window_secs;
            if count > max {
                // Denial short-circuits: no downstream tier is touched.
                return RateLimitDecision {
                    allowed: false,
                    tier,
                    limit: Some(max),
                    remaining: Some(0),
                    reset_epoch: Some(reset_epoch),
                    retry_after_secs: Some(reset_epoch.saturating_sub(now)),
                };
            }

            allowed.push(RateLimitDecision {
                allowed: true,
                tier,
                limit: Some(max),
                remaining: Some(max.saturating_sub(count)),
                reset_epoch: Some(reset_epoch),
                retry_after_secs: None,
            });
        }

        // All tiers allowed: report the binding constraint, the tier that
        // would deny first. Ties go to the more specific tier, which was
        // evaluated later.
        allowed
            .into_iter()
            .rev()
            .min_by_key(|decision| decision.remaining)
            .unwrap_or_else(|| RateLimitDecision::fail_open(Tier::Global))
    }

    /// Reads a tier's current bucket without incrementing.
    pub async fn status(
        &self,
        tier: Tier,
        identifier: &str,
    ) -> Result<TierStatus, RateStoreError> {
        let TierLimit { max, window_secs } = self.tier_limit(tier);
        let now = self.clock.now_epoch_seconds();
        let window_start = now - (now % window_secs);
        let key = Self::bucket_key(tier, identifier, window_start);
        let count = self.store.get(&key).await?.unwrap_or(0);
        Ok(TierStatus {
            tier,
            count,
            limit: max,
            window_start,
            reset_epoch: window_start + window_secs,
        })
    }

    /// Deletes every bucket for `(tier, identifier)` across all windows.
    pub async fn reset(&self, tier: Tier, identifier: &str) -> Result<u64, RateStoreError> {
        let prefix = format!("rate_limit:{}:{identifier}:", tier.as_str());
        let keys = self.store.keys_matching(&prefix).await?;
        self.store.delete(&keys).await
    }

    pub async fn health(&self) -> bool {
        self.store.ping().await.is_ok()
    }
}
