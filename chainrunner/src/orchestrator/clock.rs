// File: chainrunner/src/orchestrator/clock.rs
//
// Clock Abstraction
//
// Every wait point of the harness (run, stop and catch-up windows, query
// timeouts in the simulated network) goes through this trait so that the
// whole perturbation loop can run under tokio paused time in tests.

use std::future::Future;
use std::pin::Pin;
use tokio::time::{self, Duration, Instant};

/// Clock abstraction used by the driver and the simulated network
///
/// # Examples
///
/// ## Real waits (SystemClock)
///
/// ```rust
/// use std::sync::Arc;
/// use tokio::time::Duration;
/// use chainrunner::orchestrator::clock::{Clock, SystemClock};
///
/// #[tokio::main]
/// async fn main() {
///     let clock: Arc<dyn Clock> = Arc::new(SystemClock);
///     let start = clock.now();
///     clock.sleep(Duration::from_millis(10)).await;
///     assert!(clock.now() - start >= Duration::from_millis(10));
/// }
/// ```
///
/// ## Paused time (PausedClock)
///
/// ```rust
/// use std::sync::Arc;
/// use tokio::time::Duration;
/// use chainrunner::orchestrator::clock::{Clock, PausedClock};
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() {
///     let clock = Arc::new(PausedClock::new());
///     let start = clock.now();
///
///     // A 90 second run window completes without real delay
///     clock.advance(Duration::from_secs(90)).await;
///     assert_eq!(clock.now() - start, Duration::from_secs(90));
/// }
/// ```
pub trait Clock: Send + Sync {
    /// Returns the current instant in time
    ///
    /// SystemClock returns wall-clock time, PausedClock the simulated time
    /// of the tokio runtime.
    fn now(&self) -> Instant;

    /// Sleeps for the specified duration
    fn sleep(&self, d: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Wall-clock time, used when driving real node processes
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        time::Instant::now()
    }

    fn sleep(&self, d: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(time::sleep(d))
    }
}

/// Paused clock for tests
///
/// Works with tokio's `time::pause()`. With `#[tokio::test(start_paused = true)]`
/// the runtime auto-advances to the next pending timer whenever every task is
/// idle, so `sleep()` on this clock completes instantly while still moving the
/// simulated time forward by exactly the requested amount.
///
/// # Important Notes
///
/// 1. Requires a current-thread runtime (the default for `#[tokio::test]`)
/// 2. `new()` pauses time itself and panics if time is already paused;
///    under `start_paused = true` use `attach()` instead
pub struct PausedClock;

impl PausedClock {
    /// Creates a new PausedClock and pauses tokio time
    pub fn new() -> Self {
        time::pause();
        Self
    }

    /// Creates a PausedClock on a runtime whose time is already paused
    pub fn attach() -> Self {
        Self
    }

    /// Manually advance time by the specified duration
    ///
    /// Pending `sleep()` futures that expire during the advancement are woken.
    pub async fn advance(&self, d: Duration) {
        time::advance(d).await
    }
}

impl Clock for PausedClock {
    fn now(&self) -> Instant {
        time::Instant::now()
    }

    fn sleep(&self, d: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(time::sleep(d))
    }
}

impl Default for PausedClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_paused_clock_advancement() {
        let clock = Arc::new(PausedClock::new());
        let start = clock.now();

        clock.advance(Duration::from_secs(1)).await;
        assert_eq!(clock.now() - start, Duration::from_secs(1));

        clock.advance(Duration::from_secs(2)).await;
        assert_eq!(clock.now() - start, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_clock_under_start_paused() {
        let clock = PausedClock::attach();
        let start = clock.now();

        clock.sleep(Duration::from_secs(90)).await;
        assert_eq!(clock.now() - start, Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_paused_clock_sleep_completes_after_advance() {
        let clock = Arc::new(PausedClock::new());

        let sleeper = {
            let clock = clock.clone();
            tokio::spawn(async move {
                clock.sleep(Duration::from_secs(30)).await;
                "stop window elapsed"
            })
        };

        tokio::time::sleep(Duration::from_millis(1)).await;
        clock.advance(Duration::from_secs(31)).await;

        assert_eq!(sleeper.await.unwrap(), "stop window elapsed");
    }

    #[tokio::test]
    async fn test_system_clock_sleeps_for_real() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let start = clock.now();

        clock.sleep(Duration::from_millis(10)).await;

        assert!(clock.now() - start >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_clock_trait_objects() {
        let clocks: Vec<Arc<dyn Clock>> = vec![Arc::new(SystemClock), Arc::new(PausedClock::new())];
        for clock in clocks {
            let a = clock.now();
            let b = clock.now();
            assert!(b >= a);
        }
    }
}
