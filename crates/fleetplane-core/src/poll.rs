// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fixed-interval polling for steps that wait on asynchronous external work.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::pipeline::StepError;

/// How long a step may wait for an external resource to become ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitBudget {
    /// Pause between checks.
    pub interval: Duration,
    /// Total number of checks before giving up.
    pub max_attempts: u32,
}

impl WaitBudget {
    /// Create a budget.
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Upper bound on the time spent sleeping.
    pub fn total(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

impl Default for WaitBudget {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 60,
        }
    }
}

/// Poll `check` until it yields a value or the budget runs out.
///
/// `check` returns `Ok(Some(v))` when ready, `Ok(None)` when not yet ready
/// and `Err` on failure. Transient check errors count as "not yet"; any other
/// error aborts the wait. Running out of attempts is a [`StepError::Timeout`].
pub async fn wait_until<T, F, Fut>(
    budget: WaitBudget,
    what: &str,
    mut check: F,
) -> Result<T, StepError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, StepError>>,
{
    for attempt in 1..=budget.max_attempts {
        match check().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => debug!(what, attempt, "Not ready yet"),
            Err(StepError::Transient(message)) => {
                warn!(what, attempt, error = %message, "Transient error while waiting")
            }
            Err(e) => return Err(e),
        }

        if attempt < budget.max_attempts {
            tokio::time::sleep(budget.interval).await;
        }
    }

    Err(StepError::Timeout(format!(
        "{} not ready after {} attempts",
        what, budget.max_attempts
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> WaitBudget {
        WaitBudget::new(Duration::from_millis(1), max_attempts)
    }

    #[tokio::test]
    async fn test_ready_on_third_attempt() {
        let attempts = AtomicU32::new(0);

        let value = wait_until(fast(5), "subnet", || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            Ok((n == 3).then_some(n))
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_exceeded_is_timeout() {
        let attempts = AtomicU32::new(0);

        let err = wait_until(fast(4), "image", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Ok::<Option<()>, StepError>(None)
        })
        .await
        .unwrap_err();

        assert!(matches!(err, StepError::Timeout(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_transient_errors_keep_waiting() {
        let attempts = AtomicU32::new(0);

        let value = wait_until(fast(3), "instance", || async {
            match attempts.fetch_add(1, Ordering::SeqCst) {
                0 => Err(StepError::Transient("connection reset".into())),
                _ => Ok(Some("running")),
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "running");
    }

    #[tokio::test]
    async fn test_terminal_error_aborts() {
        let err = wait_until(fast(10), "image", || async {
            Err::<Option<()>, _>(StepError::Terminal("image build failed".into()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, StepError::Terminal(_)));
    }
}
