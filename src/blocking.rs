// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Interval-based retry for allocations that cannot be granted yet.
//!
//! Each attempt runs to completion under the manager lock and either
//! commits or leaves nothing behind, so cancelling between attempts is
//! always clean. The lock is never held across the sleep.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{ResourceError, ResourceResult};

/// Upper bound of the retry interval, in microseconds.
pub const MAX_RETRY_INTERVAL_US: u64 = 1_000_000;

/// Reject intervals outside `0..=MAX_RETRY_INTERVAL_US`.
pub fn validate_interval(interval_us: u64) -> ResourceResult<Duration> {
    if interval_us > MAX_RETRY_INTERVAL_US {
        return Err(ResourceError::InvalidArgument(format!(
            "retry interval {}us exceeds {}us",
            interval_us, MAX_RETRY_INTERVAL_US
        )));
    }
    Ok(Duration::from_micros(interval_us))
}

/// Call `attempt` until it succeeds, fails with something other than
/// insufficient resources, or `cancel` fires.
///
/// `on_retry` runs after every retryable failure, before the sleep.
pub async fn retry_until_granted<T, F, R>(
    interval_us: u64,
    cancel: &CancellationToken,
    mut attempt: F,
    mut on_retry: R,
) -> ResourceResult<T>
where
    F: FnMut() -> ResourceResult<T>,
    R: FnMut(&ResourceError),
{
    let interval = validate_interval(interval_us)?;
    loop {
        if cancel.is_cancelled() {
            return Err(ResourceError::Cancelled);
        }
        match attempt() {
            Ok(granted) => return Ok(granted),
            Err(e) if e.is_insufficient_resources() => on_retry(&e),
            Err(e) => return Err(e),
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(ResourceError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
        // A zero interval still yields so other tasks can release.
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn exhausted() -> ResourceError {
        ResourceError::CapacityExceeded { requested: 10, available: 0 }
    }

    #[tokio::test]
    async fn out_of_range_interval_fails_before_first_attempt() {
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let result: ResourceResult<()> = retry_until_granted(
            MAX_RETRY_INTERVAL_US + 1,
            &cancel,
            || {
                calls += 1;
                Ok(())
            },
            |_| {},
        )
        .await;
        assert!(matches!(result, Err(ResourceError::InvalidArgument(_))));
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let mut retries = 0;
        let start = Instant::now();
        let result = retry_until_granted(
            10_000,
            &cancel,
            || {
                calls += 1;
                if calls < 3 {
                    Err(exhausted())
                } else {
                    Ok(calls)
                }
            },
            |_| retries += 1,
        )
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(retries, 2);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn non_retryable_errors_return_immediately() {
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let result: ResourceResult<()> = retry_until_granted(
            0,
            &cancel,
            || {
                calls += 1;
                Err(ResourceError::ExclusivityConflict(0))
            },
            |_| {},
        )
        .await;
        assert_eq!(result, Err(ResourceError::ExclusivityConflict(0)));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });
        let result: ResourceResult<()> =
            retry_until_granted(1_000, &cancel, || Err(exhausted()), |_| {}).await;
        assert_eq!(result, Err(ResourceError::Cancelled));
    }
}
