//! Identify concurrency control
//!
//! Shards sharing a bucket (`shard_id % max_concurrency`) identify at most
//! once per interval.

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Duration, Instant};

/// Queue shared by all shards of one application
#[derive(Debug)]
pub struct IdentifyQueue {
    interval: Duration,
    buckets: Vec<Mutex<Option<Instant>>>,
}

impl IdentifyQueue {
    /// Spacing the service enforces between identifies in one bucket
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

    #[must_use]
    pub fn new(max_concurrency: u32) -> Self {
        Self::with_interval(max_concurrency, Self::DEFAULT_INTERVAL)
    }

    #[must_use]
    pub fn with_interval(max_concurrency: u32, interval: Duration) -> Self {
        let buckets = (0..max_concurrency.max(1)).map(|_| Mutex::new(None)).collect();
        Self { interval, buckets }
    }

    #[must_use]
    pub fn max_concurrency(&self) -> u32 {
        self.buckets.len() as u32
    }

    /// Wait until `shard_id` may identify, then claim the slot
    pub async fn wait_turn(&self, shard_id: u32) {
        let index = (shard_id % self.max_concurrency()) as usize;
        let Some(bucket) = self.buckets.get(index) else {
            return;
        };

        // The lock is held while sleeping so waiters queue in order
        let mut last = bucket.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.interval;
            if ready_at > Instant::now() {
                tracing::debug!(shard_id, bucket = index, "Waiting for identify slot");
                sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

impl Default for IdentifyQueue {
    fn default() -> Self {
        Self::new(1)
    }
}
