//! Token-bucket rate limiting for tracker calls.
//!
//! The bucket holds up to `capacity` tokens and refills continuously at the
//! current rate. A 429 response halves the rate (down to a floor); every
//! success afterwards recovers it by a quarter of the gap to the configured
//! rate. Acquiring blocks, but never longer than the acquire budget: a miss
//! surfaces as a transient failure the retry layer handles.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use super::{AdapterError, MutationOutcome, NewIssue, RemoteIssue, TrackerAdapter};
use crate::model::{EntityFields, Field, FieldValue};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    rate: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    base_rate: f64,
    min_rate: f64,
    state: Mutex<Bucket>,
}

impl TokenBucket {
    /// `capacity` is the burst size, `requests_per_second` the refill rate.
    /// Both are clamped to small positive minimums.
    #[must_use]
    pub fn new(capacity: u32, requests_per_second: f64) -> Self {
        let capacity = f64::from(capacity.max(1));
        let rate = requests_per_second.max(0.001);
        Self {
            capacity,
            base_rate: rate,
            min_rate: rate / 16.0,
            state: Mutex::new(Bucket {
                tokens: capacity,
                rate,
                last_refill: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = elapsed.mul_add(bucket.rate, bucket.tokens).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Take a token without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.lock();
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take a token, waiting at most `timeout`.
    pub fn acquire(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let wait = {
                let mut bucket = self.lock();
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return true;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / bucket.rate)
            };
            let now = Instant::now();
            if now >= deadline || now + wait > deadline {
                return false;
            }
            thread::sleep(wait);
        }
    }

    /// Back off after a rate-limit response.
    pub fn penalize(&self) {
        let mut bucket = self.lock();
        self.refill(&mut bucket);
        bucket.rate = (bucket.rate / 2.0).max(self.min_rate);
        tracing::debug!(rate = bucket.rate, "rate limit hit, slowing down");
    }

    /// Recover toward the configured rate after a success.
    pub fn reward(&self) {
        let mut bucket = self.lock();
        if bucket.rate < self.base_rate {
            bucket.rate = ((self.base_rate - bucket.rate) / 4.0 + bucket.rate).min(self.base_rate);
        }
    }

    /// Current refill rate in requests per second.
    #[must_use]
    pub fn rate(&self) -> f64 {
        self.lock().rate
    }
}

/// Wraps a tracker so every call first takes a token.
#[derive(Debug)]
pub struct RateLimitedTracker<A> {
    inner: A,
    bucket: TokenBucket,
    acquire_timeout: Duration,
}

impl<A: TrackerAdapter> RateLimitedTracker<A> {
    #[must_use]
    pub const fn new(inner: A, bucket: TokenBucket, acquire_timeout: Duration) -> Self {
        Self {
            inner,
            bucket,
            acquire_timeout,
        }
    }

    #[must_use]
    pub const fn inner(&self) -> &A {
        &self.inner
    }

    #[must_use]
    pub const fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    fn limited<T>(&self, f: impl FnOnce(&A) -> Result<T, AdapterError>) -> Result<T, AdapterError> {
        if !self.bucket.acquire(self.acquire_timeout) {
            return Err(AdapterError::transient(format!(
                "no rate-limit token within {:?}",
                self.acquire_timeout
            )));
        }
        let result = f(&self.inner);
        match &result {
            Err(AdapterError::RateLimited { .. }) => self.bucket.penalize(),
            Ok(_) => self.bucket.reward(),
            Err(_) => {}
        }
        result
    }
}

impl<A: TrackerAdapter> TrackerAdapter for RateLimitedTracker<A> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn get_issue(&self, key: &str) -> Result<RemoteIssue, AdapterError> {
        self.limited(|t| t.get_issue(key))
    }

    fn list_epic_children(&self, epic_key: &str) -> Result<Vec<RemoteIssue>, AdapterError> {
        self.limited(|t| t.list_epic_children(epic_key))
    }

    fn create_issue(&self, issue: &NewIssue) -> Result<RemoteIssue, AdapterError> {
        self.limited(|t| t.create_issue(issue))
    }

    fn create_subtask(&self, parent_key: &str, fields: &EntityFields) -> Result<RemoteIssue, AdapterError> {
        self.limited(|t| t.create_subtask(parent_key, fields))
    }

    fn update_issue(
        &self,
        key: &str,
        changes: &BTreeMap<Field, FieldValue>,
    ) -> Result<MutationOutcome, AdapterError> {
        self.limited(|t| t.update_issue(key, changes))
    }

    fn transition(&self, key: &str, status: &str) -> Result<MutationOutcome, AdapterError> {
        self.limited(|t| t.transition(key, status))
    }

    fn add_comment(&self, key: &str, body: &str) -> Result<String, AdapterError> {
        self.limited(|t| t.add_comment(key, body))
    }

    fn delete_issue(&self, key: &str) -> Result<(), AdapterError> {
        self.limited(|t| t.delete_issue(key))
    }

    fn delete_comment(&self, key: &str, comment_id: &str) -> Result<(), AdapterError> {
        self.limited(|t| t.delete_comment(key, comment_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::{FailureRule, InMemoryTracker, TrackerOp};

    #[test]
    fn burst_then_empty() {
        let bucket = TokenBucket::new(2, 0.001);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn acquire_gives_up_within_budget() {
        let bucket = TokenBucket::new(1, 0.01);
        assert!(bucket.acquire(Duration::ZERO));
        let start = Instant::now();
        assert!(!bucket.acquire(Duration::from_millis(20)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn acquire_waits_for_refill() {
        let bucket = TokenBucket::new(1, 200.0);
        assert!(bucket.try_acquire());
        assert!(bucket.acquire(Duration::from_millis(500)));
    }

    #[test]
    fn penalize_halves_and_reward_recovers() {
        let bucket = TokenBucket::new(5, 8.0);
        bucket.penalize();
        assert!((bucket.rate() - 4.0).abs() < f64::EPSILON);
        bucket.reward();
        assert!(bucket.rate() > 4.0);
        for _ in 0..100 {
            bucket.reward();
        }
        assert!(bucket.rate() <= 8.0);
        assert!(bucket.rate() > 7.9);
    }

    #[test]
    fn exhausted_bucket_surfaces_transient_error() {
        let tracker = InMemoryTracker::default();
        tracker.insert_epic("E", "x");
        let limited = RateLimitedTracker::new(tracker, TokenBucket::new(1, 0.001), Duration::ZERO);
        assert!(limited.list_epic_children("E").is_ok());
        let err = limited.list_epic_children("E").unwrap_err();
        assert!(err.is_transient());
        assert_eq!(limited.inner().calls().len(), 1);
    }

    #[test]
    fn rate_limited_response_slows_bucket() {
        let tracker = InMemoryTracker::default();
        tracker.insert_epic("E", "x");
        tracker.fail_on(
            FailureRule::on(TrackerOp::ListChildren, AdapterError::RateLimited { retry_after: None }).times(1),
        );
        let limited = RateLimitedTracker::new(tracker, TokenBucket::new(10, 10.0), Duration::from_millis(50));
        assert!(limited.list_epic_children("E").is_err());
        assert!(limited.bucket().rate() < 10.0);
    }
}
