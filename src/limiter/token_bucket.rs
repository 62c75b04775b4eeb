//! Token bucket rate limiter.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// A token bucket with lazy refill.
///
/// Tokens are refilled from the elapsed time at each consumption attempt,
/// so the bucket never needs a background task. Refill and consume happen
/// under one lock, making `try_consume` safe to call from any task.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, capacity: f64, refill_rate: f64, now: Instant) {
        // An instant earlier than the last refill adds nothing.
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self::with_tokens(capacity, refill_rate, capacity, Instant::now())
    }

    /// Create a bucket holding `tokens` (clamped to `[0, capacity]`) as of `now`.
    ///
    /// Negative or NaN arguments are treated as zero.
    pub fn with_tokens(capacity: f64, refill_rate: f64, tokens: f64, now: Instant) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            capacity,
            refill_rate: refill_rate.max(0.0),
            state: Mutex::new(BucketState {
                tokens: tokens.max(0.0).min(capacity),
                last_refill: now,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Take `n` tokens if available. Never blocks.
    pub fn try_consume(&self, n: f64) -> bool {
        self.try_consume_at(n, Instant::now())
    }

    /// Take `n` tokens as of `now`. On rejection the token count is left as
    /// refilled; nothing is subtracted.
    pub fn try_consume_at(&self, n: f64, now: Instant) -> bool {
        let mut state = self.lock();
        state.refill(self.capacity, self.refill_rate, now);

        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Tokens available as of `now`.
    pub fn available_at(&self, now: Instant) -> f64 {
        let mut state = self.lock();
        state.refill(self.capacity, self.refill_rate, now);
        state.tokens
    }

    pub fn available(&self) -> f64 {
        self.available_at(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_starts_full() {
        let bucket = TokenBucket::new(10.0, 5.0);
        let now = Instant::now();
        for _ in 0..10 {
            assert!(bucket.try_consume_at(1.0, now));
        }
        assert!(!bucket.try_consume_at(1.0, now));
    }

    #[test]
    fn test_refill_from_empty() {
        let start = Instant::now();
        let bucket = TokenBucket::with_tokens(10.0, 5.0, 0.0, start);
        assert_eq!(bucket.available_at(start + Duration::from_secs(2)), 10.0);
    }

    #[test]
    fn test_refill_is_capped() {
        let start = Instant::now();
        let bucket = TokenBucket::with_tokens(10.0, 5.0, 0.0, start);
        assert_eq!(bucket.available_at(start + Duration::from_secs(60)), 10.0);
    }

    #[test]
    fn test_partial_refill() {
        let start = Instant::now();
        let bucket = TokenBucket::with_tokens(20.0, 10.0, 0.0, start);
        assert!(!bucket.try_consume_at(1.0, start + Duration::from_millis(50)));
        assert!(bucket.try_consume_at(1.0, start + Duration::from_millis(150)));
        let left = bucket.available_at(start + Duration::from_millis(150));
        assert!((left - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_rejection_does_not_subtract() {
        let now = Instant::now();
        let bucket = TokenBucket::with_tokens(5.0, 0.0, 2.0, now);
        assert!(!bucket.try_consume_at(3.0, now));
        assert_eq!(bucket.available_at(now), 2.0);
        assert!(bucket.try_consume_at(2.0, now));
        assert_eq!(bucket.available_at(now), 0.0);
    }

    #[test]
    fn test_zero_rate_never_refills() {
        let start = Instant::now();
        let bucket = TokenBucket::with_tokens(1.0, 0.0, 1.0, start);
        assert!(bucket.try_consume_at(1.0, start));
        assert!(!bucket.try_consume_at(1.0, start + Duration::from_secs(3600)));
    }

    #[test]
    fn test_earlier_instant_adds_nothing() {
        let start = Instant::now();
        let later = start + Duration::from_secs(1);
        let bucket = TokenBucket::with_tokens(10.0, 5.0, 0.0, later);
        assert_eq!(bucket.available_at(start), 0.0);
        assert_eq!(bucket.available_at(later + Duration::from_secs(1)), 5.0);
    }

    #[test]
    fn test_invalid_arguments_give_empty_bucket() {
        let start = Instant::now();
        let later = start + Duration::from_secs(10);
        for (capacity, rate, tokens) in [
            (-5.0, 1.0, 3.0),
            (f64::NAN, 1.0, 3.0),
            (10.0, -2.0, f64::NAN),
            (10.0, f64::NAN, -4.0),
        ] {
            let bucket = TokenBucket::with_tokens(capacity, rate, tokens, start);
            assert!(bucket.capacity() >= 0.0);
            assert!(!bucket.try_consume_at(1.0, start));
            assert_eq!(bucket.available_at(start), 0.0);
            assert_eq!(bucket.available_at(later), 0.0);
        }
    }

    #[test]
    fn test_tokens_stay_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let start = Instant::now();
        let bucket = TokenBucket::with_tokens(10.0, 5.0, 3.0, start);
        let mut now = start;

        for _ in 0..5_000 {
            now += Duration::from_millis(rng.gen_range(0..400));
            let before = bucket.available_at(now);
            let n = rng.gen_range(1..4) as f64;
            let admitted = bucket.try_consume_at(n, now);
            let after = bucket.available_at(now);

            assert!((0.0..=10.0).contains(&after), "tokens out of range: {after}");
            if admitted {
                assert!((before - n - after).abs() < 1e-9);
            } else {
                assert_eq!(before, after);
            }
        }
    }

    #[test]
    fn test_concurrent_consumers_never_overdraw() {
        let bucket = Arc::new(TokenBucket::new(100.0, 0.0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = bucket.clone();
                std::thread::spawn(move || (0..50).filter(|_| bucket.try_consume(1.0)).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
        assert_eq!(bucket.available(), 0.0);
    }
}
