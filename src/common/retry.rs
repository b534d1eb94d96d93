//! Bounded retry with a fixed delay between attempts

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};

/// Retry strategy: up to `attempts` tries, sleeping `delay` after each failure.
#[derive(Debug, Clone, Copy)]
pub struct Timed {
    attempts: usize,
    delay: Duration,
}

/// Shorthand for `Timed::new(attempts, Duration::from_millis(delay_ms))`
pub fn timed(attempts: usize, delay_ms: u64) -> Timed {
    Timed::new(attempts, Duration::from_millis(delay_ms))
}

impl Timed {
    pub fn new(attempts: usize, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Run `op` until it succeeds or the attempts are exhausted.
    pub async fn on<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        for attempt in 1..=self.attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!("Retry: attempt {}/{} failed: {}", attempt, self.attempts, e);
                    if attempt < self.attempts {
                        tokio::time::sleep(self.delay).await;
                    }
                }
            }
        }
        Err(Error::RetryFailed(self.attempts))
    }
}
