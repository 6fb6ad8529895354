//! Bucket bookkeeping
//!
//! Bucket state is only trusted after a live response has described it;
//! before that a bucket lets one request through at a time and never waits.

use crate::route::BucketKey;
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;

/// Rate-limit headers present on a response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Epoch seconds at which the bucket resets
    pub reset: Option<f64>,
    /// Seconds until the bucket resets
    pub reset_after: Option<f64>,
    /// Server-side bucket hash
    pub bucket: Option<String>,
    pub global: bool,
    /// `user`, `global` or `shared`
    pub scope: Option<String>,
    pub retry_after: Option<f64>,
}

impl RateLimitHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let number = |name: &str| text(name).and_then(|value| value.parse::<f64>().ok());
        let count = |name: &str| text(name).and_then(|value| value.parse::<u32>().ok());

        Self {
            limit: count("x-ratelimit-limit"),
            remaining: count("x-ratelimit-remaining"),
            reset: number("x-ratelimit-reset"),
            reset_after: number("x-ratelimit-reset-after"),
            bucket: text("x-ratelimit-bucket"),
            global: text("x-ratelimit-global").is_some_and(|value| value.eq_ignore_ascii_case("true")),
            scope: text("x-ratelimit-scope"),
            retry_after: number("retry-after"),
        }
    }

    /// Whether the response described the bucket at all
    pub fn is_present(&self) -> bool {
        self.remaining.is_some() && self.reset_after.is_some()
    }
}

#[derive(Debug)]
struct BucketState {
    limit: u32,
    remaining: u32,
    reset_at: Option<Instant>,
    known: bool,
}

impl Default for BucketState {
    fn default() -> Self {
        Self {
            limit: 1,
            remaining: 1,
            reset_at: None,
            known: false,
        }
    }
}

/// One rate-limit bucket; holding its guard serializes requests
#[derive(Debug, Default)]
pub struct Bucket {
    state: Arc<AsyncMutex<BucketState>>,
}

impl Bucket {
    /// Wait for exclusive use of the bucket
    pub async fn acquire(&self) -> BucketGuard {
        BucketGuard {
            state: Arc::clone(&self.state).lock_owned().await,
        }
    }
}

/// Exclusive access to a bucket for the duration of one request
#[derive(Debug)]
pub struct BucketGuard {
    state: OwnedMutexGuard<BucketState>,
}

impl BucketGuard {
    /// Sleep through the reset window if the bucket is depleted
    pub async fn wait_until_ready(&mut self) {
        if !self.state.known || self.state.remaining > 0 {
            return;
        }

        if let Some(reset_at) = self.state.reset_at {
            if reset_at > Instant::now() {
                tracing::debug!(
                    wait_ms = reset_at.saturating_duration_since(Instant::now()).as_millis() as u64,
                    "Bucket depleted, waiting for reset"
                );
                tokio::time::sleep_until(reset_at).await;
            }
        }

        self.state.remaining = self.state.limit.max(1);
        self.state.reset_at = None;
    }

    /// Apply rate-limit headers from a live response
    pub fn update(&mut self, headers: &RateLimitHeaders) {
        let (Some(remaining), Some(reset_after)) = (headers.remaining, headers.reset_after) else {
            return;
        };

        self.state.known = true;
        self.state.limit = headers.limit.unwrap_or(self.state.limit).max(1);
        self.state.remaining = remaining;
        self.state.reset_at = Some(Instant::now() + secs(reset_after));
    }

    /// Mark the bucket empty until `retry_after` has elapsed
    pub fn deplete_for(&mut self, retry_after: Duration) {
        self.state.known = true;
        self.state.remaining = 0;
        self.state.reset_at = Some(Instant::now() + retry_after);
    }

    pub fn remaining(&self) -> u32 {
        self.state.remaining
    }

    pub fn limit(&self) -> u32 {
        self.state.limit
    }

    /// Whether a response has described this bucket yet
    pub fn is_known(&self) -> bool {
        self.state.known
    }

    pub fn reset_at(&self) -> Option<Instant> {
        self.state.reset_at
    }
}

/// Convert a header value in seconds, clamping garbage to zero
pub(crate) fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

/// Shared rate-limit state for one token
#[derive(Debug, Default)]
pub struct RateLimiter {
    /// Route key (method + template) to server bucket hash
    hashes: DashMap<String, String>,
    buckets: DashMap<String, Arc<Bucket>>,
    global_reset: Mutex<Option<Instant>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket for a key, created on first use
    pub fn bucket(&self, key: &BucketKey) -> Arc<Bucket> {
        let hash = self.bucket_hash(key);
        let resolved = key.resolve(hash.as_deref());
        Arc::clone(self.buckets.entry(resolved).or_default().value())
    }

    /// Server hash learned for a route, if any
    pub fn bucket_hash(&self, key: &BucketKey) -> Option<String> {
        self.hashes
            .get(&key.route_key())
            .map(|hash| hash.value().clone())
    }

    /// Record the server hash for a route.
    ///
    /// The bucket currently used by `key` becomes the state behind the hashed
    /// key unless another route already established it, so routes the server
    /// groups together share one bucket from then on.
    pub fn learn_bucket_hash(&self, key: &BucketKey, hash: &str) {
        let route_key = key.route_key();
        if self
            .hashes
            .get(&route_key)
            .is_some_and(|known| known.value() == hash)
        {
            return;
        }

        let current = self.bucket(key);
        self.hashes.insert(route_key, hash.to_string());
        self.buckets
            .entry(key.resolve(Some(hash)))
            .or_insert(current);

        tracing::debug!(bucket = %key, hash, "Discovered bucket hash");
    }

    /// Pause every bucket for `retry_after`
    pub fn set_global_lock(&self, retry_after: Duration) {
        let until = Instant::now() + retry_after;
        let mut global = self.global_reset.lock();
        if global.map_or(true, |current| current < until) {
            *global = Some(until);
        }
        tracing::warn!(
            retry_after_ms = retry_after.as_millis() as u64,
            "Global rate limit hit"
        );
    }

    pub fn global_reset(&self) -> Option<Instant> {
        *self.global_reset.lock()
    }

    /// Whether a global lockout is in effect right now
    pub fn is_globally_locked(&self) -> bool {
        self.global_reset()
            .is_some_and(|until| until > Instant::now())
    }

    /// Sleep until any global lockout has passed
    pub async fn wait_global(&self) {
        loop {
            let until = match self.global_reset() {
                Some(until) if until > Instant::now() => until,
                _ => return,
            };
            tokio::time::sleep_until(until).await;
        }
    }

    /// Number of distinct bucket keys tracked
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
