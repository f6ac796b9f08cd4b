//! Exponential backoff with retry-forever semantics.
//!
//! Every operation that opens an external resource (serial device, TCP
//! listener) runs through [`BackoffPolicy::retry_forever`]. Failures the caller
//! marks as retryable are retried indefinitely with a delay of
//! `min(cap, 2^attempt * base)`; anything else is handed straight back.
//! Waits race against the [`Shutdown`] signal so stopping the process never
//! has to sit out a full delay.

use std::future::Future;
use std::time::Duration;

use crate::core::shutdown::Shutdown;
use crate::domain::config::BackoffConfig;

/// Delay schedule shared by all retry loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

/// Per-call retry bookkeeping, handed to the failure observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Zero-based number of the attempt that just failed
    pub attempt: u32,
    /// How long the loop will wait before the next attempt
    pub delay: Duration,
}

/// Why a retry loop gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Shutdown was signalled before the operation succeeded
    Cancelled,
    /// The operation failed with an error the caller does not retry
    Permanent(E),
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryError::Cancelled => write!(f, "retry cancelled by shutdown"),
            RetryError::Permanent(error) => write!(f, "{}", error),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Permanent(error) => Some(error),
        }
    }
}

impl BackoffPolicy {
    pub const DEFAULT_BASE: Duration = Duration::from_millis(500);
    pub const DEFAULT_CAP: Duration = Duration::from_millis(5000);

    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// Delay to wait after the given zero-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Run `operation` until it succeeds.
    ///
    /// Errors for which `is_retryable` returns `true` are reported to
    /// `on_failure` and retried after the backoff delay. Other errors are
    /// returned as [`RetryError::Permanent`] without retrying. The loop ends
    /// with [`RetryError::Cancelled`] as soon as `shutdown` fires, including
    /// in the middle of a wait.
    pub async fn retry_forever<T, E, Op, Fut, R, F>(
        &self,
        shutdown: &Shutdown,
        mut operation: Op,
        is_retryable: R,
        mut on_failure: F,
    ) -> Result<T, RetryError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        F: FnMut(&E, RetryState),
    {
        let mut attempt: u32 = 0;

        loop {
            if shutdown.is_triggered() {
                return Err(RetryError::Cancelled);
            }

            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if is_retryable(&error) => error,
                Err(error) => return Err(RetryError::Permanent(error)),
            };

            let state = RetryState {
                attempt,
                delay: self.delay_for(attempt),
            };
            on_failure(&error, state);

            if !Self::pause(shutdown, state.delay).await {
                return Err(RetryError::Cancelled);
            }

            attempt = attempt.saturating_add(1);
        }
    }
}

impl BackoffPolicy {
    /// Sleep for `delay` unless shutdown fires first. Returns `false` when
    /// the wait was cut short.
    pub async fn pause(shutdown: &Shutdown, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.cancelled() => false,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE, Self::DEFAULT_CAP)
    }
}
