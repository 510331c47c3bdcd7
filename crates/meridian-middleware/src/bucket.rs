//! Token bucket with nanosecond resolution.
//!
//! The bucket state is a single atomic: the virtual time at which the bucket
//! was last empty. Taking `n` tokens advances it by `n * speed`; the bucket
//! refuses when that would move it past now. Capping the lag behind now at
//! `max` bounds the burst size.
//!
//! Time comes from [`tokio::time::Instant`], so tests can drive buckets with
//! a paused clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why [`RateBucket::wait`] gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The tokens would not be available before the deadline.
    #[error("rate limit wait would exceed the deadline")]
    Deadline,
    /// The request was cancelled while waiting.
    #[error("rate limit wait cancelled")]
    Cancelled,
    /// More tokens were requested than the bucket can ever hold.
    #[error("requested more tokens than the bucket capacity")]
    Capacity,
}

/// A lock-free token bucket.
///
/// # Example
///
/// ```
/// use meridian_middleware::RateBucket;
///
/// // 10 tokens per second, bursts of up to 5.
/// let bucket = RateBucket::per_second(10.0, 5);
/// assert!(bucket.try_take(5));
/// assert!(!bucket.try_take(1));
/// ```
#[derive(Debug)]
pub struct RateBucket {
    epoch: Instant,
    speed_ns: i64,
    max_ns: i64,
    last_ns: AtomicI64,
}

impl RateBucket {
    /// Creates a bucket that refills one token every `speed_ns` nanoseconds
    /// and holds at most `max_ns / speed_ns` tokens. Starts full.
    #[must_use]
    pub fn new(speed_ns: i64, max_ns: i64) -> Self {
        let speed_ns = speed_ns.max(1);
        let max_ns = max_ns.max(speed_ns);
        Self {
            epoch: Instant::now(),
            speed_ns,
            max_ns,
            last_ns: AtomicI64::new(-max_ns),
        }
    }

    /// Creates a bucket refilling `rate` tokens per second with a burst of
    /// `burst` tokens.
    #[must_use]
    pub fn per_second(rate: f64, burst: u32) -> Self {
        let speed_ns = if rate > 0.0 {
            (1e9 / rate).round() as i64
        } else {
            i64::MAX / 4
        };
        Self::new(speed_ns, speed_ns.saturating_mul(i64::from(burst.max(1))))
    }

    /// Nanoseconds per token.
    #[must_use]
    pub fn speed_ns(&self) -> i64 {
        self.speed_ns
    }

    /// Bucket capacity in nanoseconds.
    #[must_use]
    pub fn max_ns(&self) -> i64 {
        self.max_ns
    }

    /// Bucket capacity in tokens.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        (self.max_ns / self.speed_ns) as u64
    }

    fn now_ns(&self) -> i64 {
        i64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }

    /// Takes `n` tokens if they are available now.
    pub fn try_take(&self, n: u32) -> bool {
        self.allow(n).1
    }

    /// Takes `n` tokens if available. Otherwise returns how long until they
    /// would be, without taking anything.
    ///
    /// No reservation is handed out: a refusal leaves the bucket untouched.
    /// Use [`RateBucket::wait`] to queue for tokens.
    pub fn allow(&self, n: u32) -> (Duration, bool) {
        let cost = self.speed_ns.saturating_mul(i64::from(n));
        loop {
            let now = self.now_ns();
            let observed = self.last_ns.load(Ordering::Acquire);
            let last = observed.max(now - self.max_ns);
            let proposed = last.saturating_add(cost);
            if proposed > now {
                return (nanos(proposed - now), false);
            }
            if self
                .last_ns
                .compare_exchange(observed, proposed, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return (Duration::ZERO, true);
            }
        }
    }

    /// Waits until `n` tokens can be taken, giving up when they would not be
    /// available by `deadline` or when `cancel` fires.
    pub async fn wait(
        &self,
        n: u32,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), WaitError> {
        if self.speed_ns.saturating_mul(i64::from(n)) > self.max_ns {
            return Err(WaitError::Capacity);
        }
        loop {
            let (wait, ok) = self.allow(n);
            if ok {
                return Ok(());
            }
            let ready_at = Instant::now() + wait;
            if ready_at > deadline {
                return Err(WaitError::Deadline);
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(WaitError::Cancelled),
                () = tokio::time::sleep_until(ready_at) => {}
            }
        }
    }

    /// How long the bucket has been full, i.e. untouched beyond its refill
    /// horizon. Used to reap idle buckets.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let now = self.now_ns();
        let full_since = self.last_ns.load(Ordering::Acquire) + self.max_ns;
        nanos(now - full_since)
    }
}

fn nanos(ns: i64) -> Duration {
    Duration::from_nanos(u64::try_from(ns).unwrap_or(0))
}
