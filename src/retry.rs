use std::{
    future::Future,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use backoff::{Error as BackoffError, ExponentialBackoff, ExponentialBackoffBuilder, future::retry_notify};

use crate::{error::DownloadError, prelude::*};

/// Bounded exponential backoff for transient fetch failures.
///
/// The sleep intervals live here rather than in the call sites so that tests
/// can run with a zero-delay policy.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Policy that never sleeps between attempts.
    #[must_use]
    pub const fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_multiplier(2.0)
            .with_randomization_factor(0.2)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Runs `operation` until it succeeds, fails terminally, or the attempt
    /// ceiling is reached. Only [`DownloadError::is_transient`] failures are
    /// retried.
    pub async fn run<T, Op, Fut>(&self, operation: Op) -> Result<T, DownloadError>
    where
        Op: Fn() -> Fut,
        Fut: Future<Output = Result<T, DownloadError>>,
    {
        let attempts = AtomicU32::new(0);
        retry_notify(
            self.backoff(),
            || async {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                operation().await.map_err(|error| {
                    if error.is_transient() && attempt < self.max_attempts {
                        BackoffError::transient(error)
                    } else {
                        BackoffError::permanent(error)
                    }
                })
            },
            |error: DownloadError, delay: Duration| {
                warn!(?delay, %error, "transient failure, will retry");
            },
        )
        .await
    }
}
