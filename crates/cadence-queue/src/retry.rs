//! Retry and backoff policy
//!
//! Two independent concerns live here:
//! - [`RetryPolicy`] decides what happens to a job after its task failed
//!   (reschedule with a jittered exponential delay, or dead-letter once the
//!   kind's budget is spent).
//! - [`StoreRetry`] retries transient store failures at the lease-manager
//!   boundary so one flaky call does not stall a worker.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use crate::backend::QueueError;

/// What to do with a job whose latest attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Make the job visible again at this instant
    RetryAt(DateTime<Utc>),
    /// Budget exhausted
    DeadLetter,
}

/// Per-kind retry aggressiveness
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Upper bound for the un-jittered delay
    pub max_delay: Duration,
    /// Relative jitter in `[0, 1]`; 0.2 means ±20%
    pub jitter_pct: f64,
    /// Maximum number of lease/execute attempts
    pub budget: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            jitter_pct: 0.2,
            budget: 5,
        }
    }
}

impl RetryPolicy {
    /// Decide the fate of a job that has been attempted `attempts` times.
    pub fn next_attempt(&self, attempts: u32, now: DateTime<Utc>) -> Decision {
        let unit = rand::random::<f64>() * 2.0 - 1.0;
        self.next_attempt_with(attempts, now, unit)
    }

    /// Deterministic variant: `unit` in `[-1, 1]` selects where inside the
    /// jitter band the delay lands.
    pub fn next_attempt_with(&self, attempts: u32, now: DateTime<Utc>, unit: f64) -> Decision {
        if attempts >= self.budget {
            return Decision::DeadLetter;
        }
        let delay = jittered(
            backoff_delay(attempts, self.base_delay, self.max_delay),
            self.jitter_pct,
            unit,
        );
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        Decision::RetryAt(now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }
}

/// `base * 2^(attempts - 1)`, capped at `max`.
pub fn backoff_delay(attempts: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .unwrap_or(max)
        .min(max)
}

fn jittered(delay: Duration, jitter_pct: f64, unit: f64) -> Duration {
    let jitter_pct = jitter_pct.clamp(0.0, 1.0);
    let unit = unit.clamp(-1.0, 1.0);
    let millis = delay.as_millis() as f64 * (1.0 + unit * jitter_pct);
    Duration::from_millis(millis.max(0.0).round() as u64)
}

/// Retry policies keyed by job kind, with a fallback for unlisted kinds
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    default: RetryPolicy,
    by_kind: HashMap<String, RetryPolicy>,
}

impl PolicyRegistry {
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            by_kind: HashMap::new(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>, policy: RetryPolicy) -> Self {
        self.by_kind.insert(kind.into(), policy);
        self
    }

    pub fn insert(&mut self, kind: impl Into<String>, policy: RetryPolicy) {
        self.by_kind.insert(kind.into(), policy);
    }

    pub fn get(&self, kind: &str) -> &RetryPolicy {
        self.by_kind.get(kind).unwrap_or(&self.default)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.by_kind.contains_key(kind)
    }
}

/// Retry with exponential backoff for transient store errors
#[derive(Debug, Clone, Copy)]
pub struct StoreRetry {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for StoreRetry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl StoreRetry {
    /// Run `f`, retrying while it fails with a transient error.
    pub async fn execute<F, Fut, T>(&self, op: &str, mut f: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut delay = self.initial_delay;
        let mut attempts = 0;

        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    attempts += 1;
                    if attempts >= self.max_retries {
                        tracing::error!(op, attempts, error = %e, "Store retry exhausted");
                        return Err(e);
                    }

                    tracing::warn!(
                        op,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient store failure, retrying"
                    );

                    // ±10% jitter
                    let unit = rand::random::<f64>() * 2.0 - 1.0;
                    tokio::time::sleep(jittered(delay, 0.1, unit)).await;

                    delay = Duration::from_millis((delay.as_millis() as f64 * self.multiplier) as u64)
                        .min(self.max_delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
