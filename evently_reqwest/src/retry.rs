//! Wrappers that turn failed API calls into fallback values
//!
//! Presentation code often has nothing better to do with a failure than to
//! show an empty state. These wrappers let it treat "unavailable" the same as
//! "empty" by resolving to a fallback instead of an error.

use std::{future::Future, time::Duration};

use crate::ApiError;

/// How many times, and how patiently, to retry transient failures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    /// Default retry policy
    ///
    /// Retries up to 3 times, waiting 1 s, then 2 s, then 3 s.
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Constructs a new retry policy
    ///
    /// After the `n`th failed attempt, the call is retried after waiting
    /// `base_delay * n`, for at most `max_retries` retries.
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// The maximum number of retries after the first attempt
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// The delay before retrying after the `attempt`th failure
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Calls `call` until it succeeds, retrying transient failures under `policy`
///
/// A failure the server actually answered is not retried. Once retries are
/// exhausted, or on any other failure, `fallback` is returned.
pub async fn retry_api_call<T, F, Fut>(mut call: F, fallback: T, policy: RetryPolicy) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;

        let error = match call().await {
            Ok(value) => return value,
            Err(error) => error,
        };

        if !error.is_transient() {
            tracing::warn!(
                attempt,
                error = (&error as &dyn std::error::Error),
                "API call rejected, using fallback"
            );
            return fallback;
        }

        if attempt > policy.max_retries {
            tracing::warn!(
                attempt,
                error = (&error as &dyn std::error::Error),
                "API call failed after exhausting retries, using fallback"
            );
            return fallback;
        }

        let delay = policy.delay_after(attempt);
        tracing::debug!(
            attempt,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = (&error as &dyn std::error::Error),
            "transient API failure, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Like [`retry_api_call()`], falling back to the type's default value
pub async fn retry_api_call_or_default<T, F, Fut>(call: F, policy: RetryPolicy) -> T
where
    T: Default,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    retry_api_call(call, T::default(), policy).await
}

/// Awaits a single API call, returning `fallback` if it fails
///
/// Never retries.
pub async fn safe_api_call<T>(call: impl Future<Output = Result<T, ApiError>>, fallback: T) -> T {
    match call.await {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(
                error = (&error as &dyn std::error::Error),
                "API call failed, using fallback"
            );
            fallback
        }
    }
}

/// Like [`safe_api_call()`], falling back to the type's default value
pub async fn safe_api_call_or_default<T: Default>(
    call: impl Future<Output = Result<T, ApiError>>,
) -> T {
    safe_api_call(call, T::default()).await
}
