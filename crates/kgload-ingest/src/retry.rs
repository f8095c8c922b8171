//! Retry-with-backoff combinator
//!
//! [`RetryPolicy::run`] drives any idempotent async operation: transient
//! errors are retried after an exponentially growing, capped delay; permanent
//! errors stop immediately. The backoff sleep observes cancellation.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors that know whether repeating the operation can help
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Exponential backoff with a retry budget.
///
/// The first attempt runs immediately. Retry `n` (1-based) waits
/// `base_delay * 2^(n - 1)`, capped at `max_delay`, so with a 2s base the
/// waits are 2s, 4s, 8s. An operation gets at most `max_retries + 1` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Successful result plus the number of retries it took
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub retries: u32,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    #[error("gave up after {retries} retries: {last}")]
    Exhausted { retries: u32, last: E },

    #[error("permanent failure after {retries} retries: {error}")]
    Permanent { retries: u32, error: E },

    #[error("cancelled after {retries} retries")]
    Cancelled { retries: u32 },
}

impl<E> RetryError<E> {
    pub fn retries(&self) -> u32 {
        match self {
            RetryError::Exhausted { retries, .. }
            | RetryError::Permanent { retries, .. }
            | RetryError::Cancelled { retries } => *retries,
        }
    }

    /// The store error behind a failure, if there was one
    pub fn into_error(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Permanent { error, .. } => Some(error),
            RetryError::Cancelled { .. } => None,
        }
    }
}

/// Passed to the `on_retry` hook before each backoff sleep
#[derive(Debug)]
pub struct RetryEvent<'a, E> {
    /// 1-based retry about to be made
    pub retry: u32,
    pub max_retries: u32,
    pub delay: Duration,
    pub error: &'a E,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Delay before the `retry`-th retry: `base * 2^(retry - 1)`, capped
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        2u32.checked_pow(retry - 1)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Run `op` until it succeeds, fails permanently, exhausts the retry budget
    /// or `cancel` fires.
    ///
    /// `op` receives the retry number (0 for the first attempt) so it can
    /// recreate connections before resubmitting.
    pub async fn run<T, E, F, Fut, R>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
        mut on_retry: R,
    ) -> Result<Retried<T>, RetryError<E>>
    where
        E: Retryable,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnMut(&RetryEvent<'_, E>),
    {
        let mut retries = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { retries });
            }

            let error = match op(retries).await {
                Ok(value) => return Ok(Retried { value, retries }),
                Err(error) => error,
            };
            if !error.is_transient() {
                return Err(RetryError::Permanent { retries, error });
            }
            if retries >= self.max_retries {
                return Err(RetryError::Exhausted {
                    retries,
                    last: error,
                });
            }

            retries += 1;
            let delay = self.delay_for(retries);
            on_retry(&RetryEvent {
                retry: retries,
                max_retries: self.max_retries,
                delay,
                error: &error,
            });

            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { retries }),
                _ = tokio::time::sleep(delay) => {},
            }
        }
    }
}
