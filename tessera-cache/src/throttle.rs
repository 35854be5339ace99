//! Minimum-spacing request throttler.
//!
//! Successive invocations start at least `min_spacing` apart. Spacing is a
//! GCRA quota of one cell per `min_spacing` from `governor`, read against the
//! tokio clock. Waiters queue on a fair async mutex in front of the limiter,
//! so they are admitted in arrival order and none is ever dropped.

use std::future::Future;
use std::time::Duration;

use governor::clock::Clock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::Mutex;

/// Clock following tokio's time, so paused test runtimes drive the limiter.
#[derive(Debug, Clone, Copy, Default)]
struct TokioClock;

impl Clock for TokioClock {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now().into_std()
    }
}

type SpacingLimiter =
    RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<std::time::Instant>>;

pub struct Throttler {
    name: &'static str,
    min_spacing: Duration,
    /// `None` when spacing is zero.
    limiter: Option<SpacingLimiter>,
    queue: Mutex<()>,
}

impl Throttler {
    pub fn new(name: &'static str, min_spacing: Duration) -> Self {
        let limiter = Quota::with_period(min_spacing)
            .map(|quota| RateLimiter::direct_with_clock(quota, TokioClock));
        Self {
            name,
            min_spacing,
            limiter,
            queue: Mutex::new(()),
        }
    }

    pub fn min_spacing(&self) -> Duration {
        self.min_spacing
    }

    /// Wait for admission, then run `f`.
    ///
    /// Only the start of `f` is spaced; calls may overlap once admitted.
    pub async fn run<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.admit().await;
        f().await
    }

    async fn admit(&self) {
        let Some(limiter) = &self.limiter else {
            return;
        };

        let _turn = self.queue.lock().await;
        while let Err(not_until) = limiter.check() {
            let wait = not_until.wait_time_from(TokioClock.now());
            tracing::trace!(
                throttle = self.name,
                wait_ms = wait.as_millis() as u64,
                "Throttling request"
            );
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_first_call_is_not_delayed() {
        let throttle = Throttler::new("test", Duration::from_millis(100));
        let before = Instant::now();
        throttle.run(|| async {}).await;
        assert_eq!(Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_are_spaced_and_fifo() {
        let throttle = Throttler::new("test", Duration::from_millis(100));
        let starts = StdMutex::new(Vec::new());
        let record = |n: usize| {
            let starts = &starts;
            async move {
                starts.lock().unwrap().push((n, Instant::now()));
            }
        };

        tokio::join!(
            throttle.run(|| record(0)),
            throttle.run(|| record(1)),
            throttle.run(|| record(2)),
            throttle.run(|| record(3)),
        );

        let starts = starts.into_inner().unwrap();
        let order: Vec<usize> = starts.iter().map(|(n, _)| *n).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        for pair in starts.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_wait_after_idle_period() {
        let throttle = Throttler::new("test", Duration::from_millis(100));
        throttle.run(|| async {}).await;
        tokio::time::sleep(Duration::from_millis(250)).await;

        let before = Instant::now();
        throttle.run(|| async {}).await;
        assert_eq!(Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_spacing_never_waits() {
        let throttle = Throttler::new("test", Duration::ZERO);
        let before = Instant::now();
        for _ in 0..5 {
            throttle.run(|| async {}).await;
        }
        assert_eq!(Instant::now(), before);
    }
}
