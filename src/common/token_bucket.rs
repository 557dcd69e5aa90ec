use crate::Error;

use std::{sync, time};
use tokio::time::Instant;

/// Capacity-unit budget shared by the fetchers and writers of one table or index.
///
/// The bucket refills continuously at `capacity` units per second and never banks more than
/// one second worth of units. Consumed capacity is charged after each response, possibly
/// driving the balance negative; a negative balance delays the next request instead of
/// rejecting it.
///
/// ```rust
/// use dynamodb_fetch::common::token_bucket::TokenBucket;
/// use std::sync::Arc;
///
/// let bucket = Arc::new(TokenBucket::new(100.0).unwrap());
/// assert!(bucket.take(10.0, false));
/// ```
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    state: sync::Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    balance: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    /// Creates a full bucket holding `capacity` units, refilled at `capacity` units per second.
    pub fn new(capacity: f64) -> Result<Self, Error> {
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(Error::configuration(format!(
                "token bucket capacity must be positive, got {capacity}"
            )));
        }
        Ok(Self {
            capacity,
            state: sync::Mutex::new(BucketState {
                balance: capacity,
                refilled_at: Instant::now(),
            }),
        })
    }

    /// Maximum balance of the bucket.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Units added per second.
    pub fn fill_rate(&self) -> f64 {
        self.capacity
    }

    /// Takes `quantity` units.
    ///
    /// When the balance is insufficient the units are only taken if `allow_deficit` is set,
    /// leaving the balance negative. Returns whether there were enough units.
    pub fn take(&self, quantity: f64, allow_deficit: bool) -> bool {
        let mut state = self.lock();
        self.refill(&mut state);
        if state.balance >= quantity {
            state.balance -= quantity;
            true
        } else {
            if allow_deficit {
                state.balance -= quantity;
            }
            false
        }
    }

    /// Returns the current balance without taking anything.
    pub fn peek(&self) -> f64 {
        let mut state = self.lock();
        self.refill(&mut state);
        state.balance
    }

    /// Time until a negative balance is paid back, `None` when the balance is not negative.
    pub fn deficit_delay(&self) -> Option<time::Duration> {
        let balance = self.peek();
        (balance < 0.0).then(|| time::Duration::from_secs_f64(-balance / self.fill_rate()))
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
        state.balance = (state.balance + elapsed * self.fill_rate()).min(self.capacity);
        state.refilled_at = now;
    }

    fn lock(&self) -> sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(sync::PoisonError::into_inner)
    }
}
