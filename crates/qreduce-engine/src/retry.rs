//! Bounded retry of transient engine failures.

use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure.
    pub retries: u32,
    /// Sleep between attempts, doubled after each one.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff: Duration::from_millis(25),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            backoff: Duration::ZERO,
        }
    }

    /// Run `op`, retrying only while it reports a transient error.
    pub fn run<T>(
        &self,
        label: &str,
        mut op: impl FnMut() -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut attempt = 0u32;
        let mut delay = self.backoff;
        loop {
            match op() {
                Err(err) if err.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!(operation = label, attempt, error = %err, "transient engine error, retrying");
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    delay = delay.saturating_mul(2);
                }
                other => return other,
            }
        }
    }
}
