//! Token bucket for a single client.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One client's token bucket.
///
/// Starts full. Tokens accrue lazily on every take at `refill_rate` per
/// second, truncated to whole tokens and capped at `capacity`; fractional
/// progress lives only in the elapsed-time delta, never as stored state.
/// All mutation happens under the internal mutex, so takes on one bucket
/// are totally ordered.
#[derive(Debug)]
pub struct Bucket {
    capacity: i64,
    refill_rate: f64,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    tokens: i64,
    last_refill: Instant,
    last_access: Instant,
}

impl Bucket {
    /// Creates a bucket holding `capacity` tokens.
    ///
    /// Returns `None` when `capacity` or `rate` is not positive.
    pub fn new(capacity: i64, rate: f64) -> Option<Self> {
        if capacity <= 0 || rate <= 0.0 {
            return None;
        }
        let now = Instant::now();
        Some(Self {
            capacity,
            refill_rate: rate,
            state: Mutex::new(State {
                tokens: capacity,
                last_refill: now,
                last_access: now,
            }),
        })
    }

    /// Takes one token if available.
    ///
    /// Refills before taking, so a drained bucket admits again as soon as
    /// one whole token's worth of time has elapsed.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.refill(self.capacity, self.refill_rate);
        if state.tokens >= 1 {
            state.tokens -= 1;
            state.last_access = Instant::now();
            true
        } else {
            false
        }
    }

    /// True when no take has succeeded for longer than `threshold`.
    pub fn is_inactive(&self, threshold: Duration) -> bool {
        let last_access = self.state.lock().unwrap().last_access;
        last_access.elapsed() > threshold
    }
}

impl State {
    fn refill(&mut self, capacity: i64, rate: f64) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let tokens_to_add = (elapsed.as_secs_f64() * rate) as i64;
        self.tokens = (self.tokens + tokens_to_add).min(capacity);
        self.last_refill = now;
    }
}
