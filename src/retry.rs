// src/retry.rs
use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use serde::Deserialize;

/// Bounded exponential backoff, parameterized per call site.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RetryPolicy {
    /// Total tries including the first one.
    #[serde(default = "d_attempts")]   pub max_attempts: usize,
    #[serde(default = "d_base_ms")]    pub base_delay_ms: u64,
    #[serde(default = "d_multiplier")] pub multiplier: f32,
    #[serde(default = "d_cap_ms")]     pub max_delay_ms: u64,
}
fn d_attempts() -> usize { 3 }
fn d_base_ms() -> u64 { 200 }
fn d_multiplier() -> f32 { 2.0 }
fn d_cap_ms() -> u64 { 2_000 }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: d_attempts(),
            base_delay_ms: d_base_ms(),
            multiplier: d_multiplier(),
            max_delay_ms: d_cap_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base: Duration, multiplier: f32, cap: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base.as_millis() as u64,
            multiplier,
            max_delay_ms: cap.as_millis() as u64,
        }
    }

    /// Used for RPC reads and sends that fail on transport errors.
    pub fn network() -> Self {
        Self::new(5, Duration::from_millis(500), 2.0, Duration::from_secs(10))
    }

    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)))
            .with_factor(self.multiplier.max(1.0))
            .with_max_times(self.max_attempts.saturating_sub(1))
    }

    /// Run `op` until it succeeds, returns a non-transient error, or the policy is spent.
    pub async fn run<T, E, F, Fut, P>(&self, label: &str, op: F, transient: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&E) -> bool,
        E: std::fmt::Display,
    {
        op.retry(self.backoff())
            .when(transient)
            .notify(|err: &E, dur: Duration| {
                tracing::debug!(op = label, delay_ms = dur.as_millis() as u64, "retrying after error: {err}");
            })
            .await
    }
}
