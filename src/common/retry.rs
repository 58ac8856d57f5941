//! Bounded retry with backoff
//!
//! Every wait in helmsman (liveness polling, leader-change polling, volume
//! release) goes through a [`RetryPolicy`]: a maximum number of attempts,
//! a fixed or exponential delay between attempts, and an optional overall
//! deadline after which the operation fails with [`Error::Timeout`].

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    #[default]
    Exponential,
}

/// Retry policy shared by all bounded waits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first one)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Delay before the first retry (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for a single delay (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default)]
    pub backoff: Backoff,

    /// Overall deadline for the whole operation (unit: milliseconds)
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

fn default_max_attempts() -> usize {
    30
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff: Backoff::default(),
            deadline_ms: None,
        }
    }
}

impl RetryPolicy {
    /// Same delay between every attempt
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        let delay_ms = delay.as_millis() as u64;
        Self {
            max_attempts,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            backoff: Backoff::Fixed,
            deadline_ms: None,
        }
    }

    /// Doubling delay, capped at `max_delay`
    pub fn exponential(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            backoff: Backoff::Exponential,
            deadline_ms: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(deadline.as_millis() as u64);
        self
    }

    /// Replace the given fields and keep the rest. An interval without a
    /// maximum switches to fixed delays; a maximum switches to exponential.
    pub fn overridden(
        mut self,
        attempts: Option<usize>,
        interval: Option<Duration>,
        max_interval: Option<Duration>,
        deadline: Option<Duration>,
    ) -> Self {
        if let Some(attempts) = attempts {
            self.max_attempts = attempts;
        }
        if let Some(interval) = interval {
            self.base_delay_ms = interval.as_millis() as u64;
            if max_interval.is_none() {
                self.max_delay_ms = self.base_delay_ms;
                self.backoff = Backoff::Fixed;
            }
        }
        if let Some(max) = max_interval {
            self.max_delay_ms = (max.as_millis() as u64).max(self.base_delay_ms);
            self.backoff = Backoff::Exponential;
        }
        if let Some(deadline) = deadline {
            self = self.with_deadline(deadline);
        }
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "retry policy needs at least one attempt".into(),
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(Error::InvalidConfig(format!(
                "base delay {}ms exceeds max delay {}ms",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let ms = match self.backoff {
            Backoff::Fixed => self.base_delay_ms,
            Backoff::Exponential => {
                let shift = attempt.saturating_sub(1).min(32) as u32;
                self.base_delay_ms.saturating_mul(1u64 << shift)
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, runs out
    /// of attempts, or the deadline expires.
    ///
    /// On exhaustion the last error is returned unchanged so callers can map
    /// it; on deadline expiry the result is [`Error::Timeout`] carrying the
    /// last observed error.
    pub async fn run<F, Fut, T>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_observed = String::from("no attempt completed");

        let attempts = self.attempts(operation, &mut f, &mut last_observed);
        match self.deadline() {
            Some(deadline) => match tokio::time::timeout(deadline, attempts).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        operation,
                        deadline_ms = deadline.as_millis() as u64,
                        last_observed = %last_observed,
                        "Deadline exceeded"
                    );
                    Err(Error::Timeout {
                        operation: operation.to_string(),
                        last_observed,
                    })
                }
            },
            None => attempts.await,
        }
    }

    async fn attempts<F, Fut, T>(
        &self,
        operation: &str,
        f: &mut F,
        last_observed: &mut String,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    *last_observed = e.to_string();
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    *last_observed = e.to_string();
                    return Err(e);
                }
            }
        }

        Err(Error::Internal(format!(
            "{}: retry loop ended without an outcome",
            operation
        )))
    }
}
