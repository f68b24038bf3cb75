//! Bounded retry of writes that lose an optimistic-concurrency race
//!
//! Only [`Error::Conflict`] is retried. Anything else returns at once and is
//! left to the controller's requeue.
//!
//! ```ignore
//! use capi_cluster_controller::retry::{retry_on_conflict, Backoff};
//!
//! retry_on_conflict(&Backoff::conflicts(), "patch_cluster_status", || async {
//!     write_status().await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::Error;

/// Exponential backoff schedule with jitter
#[derive(Clone, Debug)]
pub struct Backoff {
    /// Total attempts including the first one
    pub attempts: u32,
    /// Delay before the second attempt
    pub initial: Duration,
    /// Upper bound on any single delay
    pub cap: Duration,
    /// Growth factor between consecutive delays
    pub factor: f64,
}

impl Backoff {
    /// Five attempts starting at 50ms, used for status conflicts within a pass
    pub fn conflicts() -> Self {
        Self {
            attempts: 5,
            initial: Duration::from_millis(50),
            cap: Duration::from_secs(1),
            factor: 2.0,
        }
    }

    /// Un-jittered delay before attempt `attempt + 1`, counting from zero
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let grown = self.initial.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(grown.min(self.cap.as_secs_f64()))
    }

    /// Delay scaled by a random factor in `[0.5, 1.5)`
    fn jittered(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(self.base_delay(attempt).as_secs_f64() * jitter)
    }
}

/// Run `operation` until it succeeds, fails with a non-conflict error, or the
/// backoff runs out of attempts. The last error is returned in the latter
/// two cases.
pub async fn retry_on_conflict<F, Fut, T>(
    backoff: &Backoff,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_conflict() => return Err(e),
            Err(e) => {
                attempt += 1;
                if attempt >= backoff.attempts {
                    warn!(operation = operation_name, attempts = attempt, error = %e, "giving up after repeated conflicts");
                    return Err(e);
                }
                let delay = backoff.jittered(attempt - 1);
                debug!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "write conflicted, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
