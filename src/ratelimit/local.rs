use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// In-process refilling token bucket.
///
/// Refill and consumption happen in one short critical section with no
/// await points, so the request path never parks on it.
pub struct LocalBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl LocalBucket {
    pub fn new(limit: u64, unit_seconds: u64) -> Self {
        let capacity = limit as f64;
        Self {
            capacity,
            refill_per_sec: capacity / unit_seconds.max(1) as f64,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    /// Consume `tokens` if the bucket holds at least that many.
    pub fn try_consume(&self, tokens: f64) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= tokens {
            state.tokens -= tokens;
            true
        } else {
            false
        }
    }

    /// Consume unconditionally; the bucket may go into debt. Used for
    /// post-hoc output accounting, where the tokens were already produced.
    pub fn deduct(&self, tokens: f64) {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens -= tokens;
    }

    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    /// How long until `tokens` will be available at the current refill rate.
    pub fn time_until(&self, tokens: f64) -> Duration {
        let missing = tokens - self.available();
        if missing <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(missing / self.refill_per_sec)
    }
}

/* ============================= TESTS ============================= */
