//! Retry policies and the shared retry loop.
//!
//! A policy is stateless: after each failed attempt the loop asks it whether
//! to try again and how long to wait first. Three policies are provided:
//! - **FixedDelay**: constant wait between attempts.
//! - **ErrorKindFilter**: constant wait, but only for allow-listed error kinds.
//! - **ExponentialBackoff**: wait doubles every attempt, optionally capped.
//!
//! `max_retries` counts total attempts, so `max_retries = 3` means the step
//! body runs at most three times. Cancelled attempts are never retried, and
//! the inter-attempt wait is abandoned as soon as the token fires.

use std::sync::Arc;
use std::time::Duration;

use conveyor_types::config::{RetryConfig, RetryStrategy};
use conveyor_types::error::StepError;
use tokio_util::sync::CancellationToken;

use super::context::WorkflowContext;
use super::step::{Step, StepOutput};

// ---------------------------------------------------------------------------
// RetryPolicy trait
// ---------------------------------------------------------------------------

/// Decides whether a failed attempt is retried.
pub trait RetryPolicy: Send + Sync {
    /// Delay before the next attempt, or `None` to give up.
    ///
    /// `attempt` is 1-based: it is the number of attempts made so far.
    fn next_delay(&self, attempt: u32, error: &StepError) -> Option<Duration>;
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Retry any failure after a constant delay.
#[derive(Debug, Clone)]
pub struct FixedDelay {
    pub max_retries: u32,
    pub delay: Duration,
}

impl FixedDelay {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }
}

impl RetryPolicy for FixedDelay {
    fn next_delay(&self, attempt: u32, _error: &StepError) -> Option<Duration> {
        (attempt < self.max_retries).then_some(self.delay)
    }
}

/// Retry only failures whose [`StepError::kind`] is allow-listed; anything
/// else propagates after the first attempt.
#[derive(Debug, Clone)]
pub struct ErrorKindFilter {
    pub max_retries: u32,
    pub delay: Duration,
    pub kinds: Vec<String>,
}

impl ErrorKindFilter {
    pub fn new<I, K>(max_retries: u32, delay: Duration, kinds: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            max_retries,
            delay,
            kinds: kinds.into_iter().map(Into::into).collect(),
        }
    }
}

impl RetryPolicy for ErrorKindFilter {
    fn next_delay(&self, attempt: u32, error: &StepError) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let kind = error.kind();
        self.kinds.iter().any(|k| k == kind).then_some(self.delay)
    }
}

/// Retry with a delay of `initial * 2^(attempt - 1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub max_retries: u32,
    pub initial: Duration,
    pub max_delay: Option<Duration>,
}

impl ExponentialBackoff {
    pub fn new(max_retries: u32, initial: Duration) -> Self {
        Self {
            max_retries,
            initial,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.initial.saturating_mul(factor);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32, _error: &StepError) -> Option<Duration> {
        (attempt < self.max_retries).then(|| self.delay_for(attempt))
    }
}

/// Build the configured default policy, if retries are enabled at all.
pub fn policy_from_config(config: &RetryConfig) -> Option<Arc<dyn RetryPolicy>> {
    if config.max_retries <= 1 {
        return None;
    }
    let delay = Duration::from_millis(config.delay_ms);
    match config.strategy {
        RetryStrategy::None => None,
        RetryStrategy::Fixed => Some(Arc::new(FixedDelay::new(config.max_retries, delay))),
        RetryStrategy::Exponential => {
            let mut policy = ExponentialBackoff::new(config.max_retries, delay);
            if let Some(max) = config.max_delay_ms {
                policy = policy.with_max_delay(Duration::from_millis(max));
            }
            Some(Arc::new(policy))
        }
    }
}

// ---------------------------------------------------------------------------
// Retry loop
// ---------------------------------------------------------------------------

/// Execute `step`, retrying per `policy` until it succeeds or gives up.
///
/// Without a policy the step runs exactly once. The last failure is returned
/// once the policy declines another attempt.
pub async fn execute_with_retry<S: Step>(
    step: &mut S,
    policy: Option<&dyn RetryPolicy>,
    ctx: &mut WorkflowContext,
    cancel: &CancellationToken,
) -> Result<StepOutput, StepError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match step.execute(ctx, cancel).await {
            Ok(output) => return Ok(output),
            Err(err) => err,
        };

        if err.is_cancelled() || cancel.is_cancelled() {
            return Err(err);
        }
        let Some(delay) = policy.and_then(|p| p.next_delay(attempt, &err)) else {
            return Err(err);
        };

        tracing::warn!(
            step = step.name(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Step attempt failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(StepError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
