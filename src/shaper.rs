use std::time::Instant;

use parking_lot::Mutex;
use tracing::trace;

/// Millisecond time source for [`TrafficShaper`].
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Monotonic milliseconds since the clock was created.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        MonotonicClock {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

#[derive(Debug)]
struct Bucket {
    // in thousandths of a byte, so a refill of `elapsed_ms * rate` is exact
    milli_tokens: u64,
    last_refill_ms: u64,
}

/// Token-bucket byte limiter.
///
/// Capacity equals the per-second rate and the bucket starts full. Refill is
/// computed lazily on every [`acquire`](Self::acquire); there is no background
/// timer. Safe to share between threads.
#[derive(Debug)]
pub struct TrafficShaper<C: Clock = MonotonicClock> {
    rate: u64,
    capacity_milli: u64,
    bucket: Mutex<Bucket>,
    clock: C,
}

impl TrafficShaper {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        Self::with_clock(rate_bytes_per_sec, MonotonicClock::default())
    }
}

impl<C: Clock> TrafficShaper<C> {
    pub fn with_clock(rate_bytes_per_sec: u64, clock: C) -> Self {
        let capacity_milli = rate_bytes_per_sec.saturating_mul(1000);
        let now = clock.now_millis();
        TrafficShaper {
            rate: rate_bytes_per_sec,
            capacity_milli,
            bucket: Mutex::new(Bucket {
                milli_tokens: capacity_milli,
                last_refill_ms: now,
            }),
            clock,
        }
    }

    /// Takes `bytes` tokens if that many are available. Never blocks; a denied
    /// caller backs off and retries on its own schedule.
    pub fn acquire(&self, bytes: usize) -> bool {
        let wanted = (bytes as u64).saturating_mul(1000);
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);

        if bucket.milli_tokens >= wanted {
            bucket.milli_tokens -= wanted;
            true
        } else {
            trace!(bytes, available = bucket.milli_tokens / 1000, "traffic shaped");
            false
        }
    }

    /// Whole bytes currently available, after refilling.
    pub fn available(&self) -> u64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        bucket.milli_tokens / 1000
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = self.clock.now_millis();
        let elapsed = now.saturating_sub(bucket.last_refill_ms);
        let added = elapsed.saturating_mul(self.rate);
        bucket.milli_tokens = bucket
            .milli_tokens
            .saturating_add(added)
            .min(self.capacity_milli);
        bucket.last_refill_ms = now;
    }
}
