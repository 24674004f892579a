// File: chainrunner/src/orchestrator/mod.rs
//
// Orchestrator Module
//
// Time control shared by the driver, the scenario runner and the simulated
// network.

/// Clock abstractions for deterministic time control in tests
pub mod clock;

use log::info;
use std::sync::Arc;
use tokio::time::Duration;

pub use clock::{Clock, PausedClock, SystemClock};

/// Waits for one phase of a scenario, logging the phase boundary
///
/// Returns the measured elapsed time according to `clock`. It equals
/// `duration` when the runtime starts paused; otherwise timer granularity
/// can add about a millisecond, more on a real clock.
///
/// ```rust
/// use std::sync::Arc;
/// use tokio::time::Duration;
/// use chainrunner::orchestrator::{wait_phase, Clock, PausedClock};
///
/// #[tokio::main(flavor = "current_thread", start_paused = true)]
/// async fn main() {
///     let clock: Arc<dyn Clock> = Arc::new(PausedClock::attach());
///     let elapsed = wait_phase(&clock, "catch up", Duration::from_secs(45)).await;
///     assert_eq!(elapsed, Duration::from_secs(45));
/// }
/// ```
pub async fn wait_phase(clock: &Arc<dyn Clock>, label: &str, duration: Duration) -> Duration {
    info!("Waiting {}s ({})", duration.as_secs(), label);
    let start = clock.now();
    clock.sleep(duration).await;
    clock.now() - start
}
