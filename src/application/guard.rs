use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Why an access guard refused a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    RateLimit {
        remaining: u32,
        reset_in_seconds: Option<u64>,
    },
    Blocked {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Allow,
    Deny(DenyReason),
}

/// Request-level policy check consulted before every mutating operation.
/// Implementations may call out to a remote service; callers bound the call
/// with a timeout.
#[async_trait]
pub trait AccessGuard: Send + Sync {
    /// Ask whether `subject` may spend `requested` units now.
    async fn protect(&self, subject: &str, requested: u32) -> Result<GuardDecision>;
}

/// Lets every request through.
pub struct AllowAll;

#[async_trait]
impl AccessGuard for AllowAll {
    async fn protect(&self, _subject: &str, _requested: u32) -> Result<GuardDecision> {
        Ok(GuardDecision::Allow)
    }
}

/// Per-subject token bucket: `capacity` tokens, refilled in full `refill`
/// units every `interval`.
pub struct TokenBucketGuard {
    capacity: u32,
    refill: u32,
    interval: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucketGuard {
    pub fn new(capacity: u32, refill: u32, interval: Duration) -> Self {
        Self {
            capacity,
            refill,
            interval,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        if self.interval.is_zero() {
            bucket.tokens = self.capacity;
            bucket.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let periods = (elapsed.as_nanos() / self.interval.as_nanos()) as u64;
        if periods == 0 {
            return;
        }
        let added = periods.saturating_mul(u64::from(self.refill));
        bucket.tokens = (u64::from(bucket.tokens) + added).min(u64::from(self.capacity)) as u32;
        bucket.last_refill += self.interval * periods.min(u64::from(u32::MAX)) as u32;
    }
}

#[async_trait]
impl AccessGuard for TokenBucketGuard {
    async fn protect(&self, subject: &str, requested: u32) -> Result<GuardDecision> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(subject.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });
        self.refill(bucket, now);

        if bucket.tokens >= requested {
            bucket.tokens -= requested;
            return Ok(GuardDecision::Allow);
        }

        let next_refill = (bucket.last_refill + self.interval).saturating_duration_since(now);
        Ok(GuardDecision::Deny(DenyReason::RateLimit {
            remaining: bucket.tokens,
            reset_in_seconds: Some(next_refill.as_secs_f64().ceil() as u64),
        }))
    }
}
