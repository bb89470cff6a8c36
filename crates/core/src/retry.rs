use std::fmt::Display;
use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_transient(&self) -> bool;

    /// Server-suggested wait, e.g. from a `Retry-After` header.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Exponential backoff with bounded attempts and proportional jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction (0..=1) by which a computed delay may be randomly shortened.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Retries without sleeping. Used by tests and offline providers.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: 0.0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let cap = Duration::from_millis(self.max_delay_ms);
        if let Some(wait) = retry_after {
            return wait.min(cap);
        }
        let shift = attempt.saturating_sub(1).min(20);
        let exp = self.base_delay_ms.saturating_mul(1u64 << shift);
        let capped = exp.min(self.max_delay_ms);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if capped == 0 || jitter == 0.0 {
            return Duration::from_millis(capped);
        }
        let factor = 1.0 - jitter * rand::thread_rng().gen::<f64>();
        Duration::from_millis((capped as f64 * factor).round() as u64)
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    /// The closure receives the 1-based attempt number.
    pub fn run<T, E, F>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let attempts = self.attempts();
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < attempts => {
                    let delay = self.delay_for(attempt, err.retry_after());
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
