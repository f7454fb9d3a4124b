//! Retry policy and error classification for relay submissions and polls
//!
//! Provides exponential backoff bounded by attempt count, deadline and
//! cancellation, plus the classifier deciding what is worth retrying.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::Cancellation;
use crate::error::RelayError;

/// Rejection reasons that mean the instruction was already executed.
///
/// The EVM reason is compared verbatim; Terra wraps contract errors inside the
/// tx raw log, so the Terra reasons are looked up inside the reason text.
pub const EVM_ALREADY_PROCESSED: &str = "execution reverted: transfer info already processed";
pub const TERRA_ALREADY_PROCESSED: &[&str] = &["instruction already completed", "VaaAlreadyExecuted"];

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt; `None` means only
    /// the deadline bounds the loop
    pub max_retries: Option<u32>,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Some(5),
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Fixed-interval polling with no retry cap; pair with a deadline
    pub fn fixed_interval(interval: Duration) -> Self {
        Self {
            max_retries: None,
            initial_backoff: interval,
            max_backoff: interval,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs = self.initial_backoff.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.max_retries {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

/// Classifies errors for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Temporary failure - retry (network, timeout, not found yet)
    Transient,
    /// Idempotent duplicate - treat as success
    AlreadyApplied,
    /// Permanent failure - surface to the caller
    Fatal,
}

/// Classify an error for retry decisions
pub fn classify(error: &RelayError) -> ErrorClass {
    match error {
        RelayError::Transport(_) => ErrorClass::Transient,
        RelayError::Rejected { reason } if is_already_processed(reason) => {
            ErrorClass::AlreadyApplied
        }
        _ => ErrorClass::Fatal,
    }
}

/// Whether a destination rejection reason marks an already executed instruction
pub fn is_already_processed(reason: &str) -> bool {
    reason.trim() == EVM_ALREADY_PROCESSED
        || TERRA_ALREADY_PROCESSED
            .iter()
            .any(|known| reason.contains(known))
}

/// Sleep for `wait`, cut short by the deadline; fails on cancellation
pub async fn pause(
    wait: Duration,
    deadline: Option<Instant>,
    cancel: &Cancellation,
) -> Result<(), RelayError> {
    let wake = match deadline {
        Some(deadline) => (Instant::now() + wait).min(deadline),
        None => Instant::now() + wait,
    };
    tokio::select! {
        _ = cancel.cancelled() => Err(RelayError::Cancelled),
        _ = tokio::time::sleep_until(wake) => Ok(()),
    }
}

/// Execute `operation`, retrying only Transient failures.
///
/// Stops on success, on any non-transient error, when the policy's retry cap
/// is reached, when the deadline passes, or on cancellation. The last error is
/// returned as-is so the caller can still classify it.
pub async fn with_retry<F, T, Fut>(
    policy: &RetryPolicy,
    deadline: Option<Instant>,
    cancel: &Cancellation,
    mut operation: F,
) -> Result<T, RelayError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RelayError>>,
{
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }

        let error = match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if classify(&error) != ErrorClass::Transient {
            debug!(attempt, error = %error, "Not retrying non-transient error");
            return Err(error);
        }
        if !policy.should_retry(attempt) {
            warn!(attempt, error = %error, "Retry budget exhausted");
            return Err(error);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            warn!(attempt, error = %error, "Deadline reached while retrying");
            return Err(error);
        }

        let backoff = policy.backoff_for_attempt(attempt);
        warn!(
            attempt = attempt + 1,
            max = ?policy.max_retries,
            ?backoff,
            error = %error,
            "Retrying after backoff"
        );
        pause(backoff, deadline, cancel).await?;
        attempt += 1;
    }
}
