//! Async retry loops over `BackoffPolicy`.
//!
//! Two independent layers exist: throttle retry around a single directive,
//! and stage retry around a whole stage invocation. Each only re-invokes on
//! the error kind it owns.

use std::future::Future;

use tracing::warn;
use xacct_transfer_core::backoff::BackoffPolicy;
use xacct_transfer_core::error::{ErrorKind, ServiceError};

/// Re-invokes `call` while it fails with `Throttled`, up to the policy's
/// attempt budget. Any other kind is returned on first occurrence.
pub async fn retry_throttled<T, F, Fut>(
    policy: &BackoffPolicy,
    operation: &str,
    call: F,
) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    retry_when(policy, operation, call, ErrorKind::is_throttle_retryable).await
}

/// Re-invokes `call` while it fails with `ServiceFault`.
pub async fn retry_stage<T, F, Fut>(
    policy: &BackoffPolicy,
    operation: &str,
    call: F,
) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    retry_when(policy, operation, call, ErrorKind::is_stage_retryable).await
}

/// Generic form used when the failure is carried in something other than a
/// `ServiceError`, e.g. a transfer result.
pub async fn retry_with<T, F, Fut>(
    policy: &BackoffPolicy,
    operation: &str,
    mut call: F,
    retryable: impl Fn(&T) -> bool,
) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
{
    let mut attempts = 0u32;
    loop {
        let outcome = call().await;
        attempts += 1;
        if !retryable(&outcome) || !policy.allows_another(attempts) {
            return outcome;
        }
        let delay = next_delay(policy, attempts);
        warn!(
            component = "retry",
            event = "retry_scheduled",
            operation,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            "retrying after transient failure"
        );
        tokio::time::sleep(delay).await;
    }
}

async fn retry_when<T, F, Fut>(
    policy: &BackoffPolicy,
    operation: &str,
    mut call: F,
    retryable: fn(ErrorKind) -> bool,
) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut attempts = 0u32;
    loop {
        let error = match call().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        attempts += 1;

        if !retryable(error.kind) {
            return Err(error);
        }
        if !policy.allows_another(attempts) {
            warn!(
                component = "retry",
                event = "retry_exhausted",
                operation,
                attempts,
                error_kind = %error.kind,
                "retry budget exhausted"
            );
            return Err(error);
        }

        let delay = next_delay(policy, attempts);
        warn!(
            component = "retry",
            event = "retry_scheduled",
            operation,
            attempt = attempts,
            error_kind = %error.kind,
            delay_ms = delay.as_millis() as u64,
            "retrying after {}",
            error.message
        );
        tokio::time::sleep(delay).await;
    }
}

fn next_delay(policy: &BackoffPolicy, attempts_made: u32) -> std::time::Duration {
    let mut rng = rand::thread_rng();
    policy.delay(attempts_made.saturating_sub(1), &mut rng)
}
