//! Arrival-rate estimation.
//!
//! Tracks event arrivals in a ring of one-second buckets and reports an
//! events-per-second rate over the trailing window. Used once per backend
//! and once per metric name; the rebalancer only ever compares rates, so
//! relative magnitude matters more than precision.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Width of the trailing window in seconds.
const WINDOW_SECS: u64 = 60;

/// A thread-safe sliding-window rate estimator.
///
/// `arrived()` is cheap enough to sit on the per-request hot path. The
/// reported rate dips transiently as buckets age out of the window; callers
/// must not assume monotonicity.
pub struct ArrivalRate {
    started: Instant,
    /// Total arrivals since construction. Never decremented.
    total: AtomicU64,
    buckets: [Bucket; WINDOW_SECS as usize],
}

/// One second's worth of arrivals, tagged with the second it was filled in.
#[derive(Default)]
struct Bucket {
    second: AtomicU64,
    count: AtomicU64,
}

impl ArrivalRate {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            total: AtomicU64::new(0),
            buckets: std::array::from_fn(|_| Bucket::default()),
        }
    }

    /// Record one event at the current instant.
    pub fn arrived(&self) {
        let now = self.started.elapsed().as_secs();
        let bucket = &self.buckets[(now % WINDOW_SECS) as usize];

        // Reclaim the slot if it still holds a count from a previous lap of
        // the ring. Only one caller wins the exchange and zeroes the count;
        // an increment racing the reset may be dropped from the window, but
        // `total` never loses arrivals.
        let stamped = bucket.second.load(Ordering::Acquire);
        if stamped != now
            && bucket
                .second
                .compare_exchange(stamped, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            bucket.count.store(0, Ordering::Release);
        }

        bucket.count.fetch_add(1, Ordering::AcqRel);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Estimated arrivals per second over the trailing window.
    ///
    /// Returns 0.0 until the first `arrived()` call.
    pub fn rate(&self) -> f64 {
        let now = self.started.elapsed().as_secs();
        let mut events = 0u64;
        for bucket in &self.buckets {
            let stamped = bucket.second.load(Ordering::Acquire);
            if now.saturating_sub(stamped) < WINDOW_SECS {
                events += bucket.count.load(Ordering::Acquire);
            }
        }
        events as f64 / WINDOW_SECS as f64
    }

    /// Total arrivals since construction, regardless of window.
    pub fn total_arrivals(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl Default for ArrivalRate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ArrivalRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrivalRate")
            .field("rate", &self.rate())
            .field("total", &self.total_arrivals())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_zero_before_first_arrival() {
        let rate = ArrivalRate::new();
        assert_eq!(rate.rate(), 0.0);
        assert_eq!(rate.total_arrivals(), 0);
    }

    #[test]
    fn test_rate_reflects_arrivals() {
        let rate = ArrivalRate::new();
        for _ in 0..120 {
            rate.arrived();
        }

        // 120 events inside a 60 second window.
        assert!((rate.rate() - 2.0).abs() < f64::EPSILON);
        assert_eq!(rate.total_arrivals(), 120);
    }

    #[test]
    fn test_rate_is_finite_and_non_negative() {
        let rate = ArrivalRate::new();
        rate.arrived();
        let r = rate.rate();
        assert!(r.is_finite());
        assert!(r >= 0.0);
    }

    #[test]
    fn test_concurrent_arrivals_are_not_lost() {
        let rate = Arc::new(ArrivalRate::new());
        let threads = 8;
        let per_thread = 1000;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let rate = Arc::clone(&rate);
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        rate.arrived();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(rate.total_arrivals(), threads * per_thread);
        assert!(rate.rate() > 0.0);
    }
}
