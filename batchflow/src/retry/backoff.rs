//! Backoff policies with configurable jitter.
//!
//! Backoff state lives in the [`RetryContext`](super::RetryContext), so a
//! stateful retry that resumes after a rollback keeps growing its delay
//! instead of starting over.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(initial, prev * 3))
    Decorrelated,
}

/// Per-operation backoff state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackOffContext {
    /// Number of backoffs taken so far.
    pub attempt: u32,
    /// The last delay, for decorrelated jitter.
    pub previous_delay_ms: Option<u64>,
}

/// Computes the pause between two attempts.
pub trait BackOffPolicy: Send + Sync + Debug {
    /// Returns the next delay and advances the state.
    fn next_delay(&self, ctx: &mut BackOffContext) -> Duration;
}

/// Retries immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackOffPolicy;

impl BackOffPolicy for NoBackOffPolicy {
    fn next_delay(&self, ctx: &mut BackOffContext) -> Duration {
        ctx.attempt += 1;
        Duration::ZERO
    }
}

/// Waits the same period before every retry.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackOffPolicy {
    period: Duration,
}

impl FixedBackOffPolicy {
    /// Creates a policy with the given period.
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl BackOffPolicy for FixedBackOffPolicy {
    fn next_delay(&self, ctx: &mut BackOffContext) -> Duration {
        ctx.attempt += 1;
        self.period
    }
}

/// Grows the delay geometrically up to a cap.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackOffPolicy {
    initial_interval_ms: u64,
    multiplier: f64,
    max_interval_ms: u64,
    jitter: JitterStrategy,
}

impl Default for ExponentialBackOffPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: 100,
            multiplier: 2.0,
            max_interval_ms: 30_000,
            jitter: JitterStrategy::None,
        }
    }
}

impl ExponentialBackOffPolicy {
    /// Creates a policy with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the first delay.
    #[must_use]
    pub fn with_initial_interval_ms(mut self, interval: u64) -> Self {
        self.initial_interval_ms = interval;
        self
    }

    /// Sets the growth factor (values below 1.0 are treated as 1.0).
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_interval_ms(mut self, interval: u64) -> Self {
        self.max_interval_ms = interval;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    fn base_delay(&self, attempt: u32) -> u64 {
        let factor = self.multiplier.powi(attempt as i32);
        let delay = (self.initial_interval_ms as f64 * factor).min(self.max_interval_ms as f64);
        delay as u64
    }
}

impl BackOffPolicy for ExponentialBackOffPolicy {
    fn next_delay(&self, ctx: &mut BackOffContext) -> Duration {
        let base = self.initial_interval_ms.min(self.max_interval_ms);
        let delay = self.base_delay(ctx.attempt);

        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = ctx.previous_delay_ms.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(self.max_interval_ms);
                if upper <= base {
                    base
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                }
            }
        };

        ctx.attempt += 1;
        ctx.previous_delay_ms = Some(jittered);
        Duration::from_millis(jittered)
    }
}
