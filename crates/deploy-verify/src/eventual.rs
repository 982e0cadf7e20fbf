//! Eventual consistency helpers for conditions that converge asynchronously.
//!
//! This module provides a bounded retry with a fixed polling interval and a
//! wall-clock deadline. Certificate issuance, DNS propagation and service
//! readiness are all polled through [`retry_with_timeout`].
//!
//! The deadline is checked only between attempts. A single slow attempt is not
//! interrupted, so total elapsed time can exceed the configured timeout by up to
//! one attempt's latency plus one interval.

use crate::classifier::ErrorClassifier;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Categories of eventual consistency with documented SLAs.
///
/// Each category carries the timeout and polling interval used while waiting
/// for the platform to converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyCategory {
    /// Managed certificate issuance plus load balancer readiness (5 min, polled every 30s)
    CertificateProvisioning,

    /// Public DNS propagation of the service record (5 min, polled every 10s)
    DnsPropagation,
}

impl ConsistencyCategory {
    /// Get the maximum timeout for this consistency category.
    pub fn timeout(&self) -> Duration {
        match self {
            ConsistencyCategory::CertificateProvisioning => Duration::from_secs(300),
            ConsistencyCategory::DnsPropagation => Duration::from_secs(300),
        }
    }

    /// Get the fixed polling interval for this consistency category.
    pub fn interval(&self) -> Duration {
        match self {
            ConsistencyCategory::CertificateProvisioning => Duration::from_secs(30),
            ConsistencyCategory::DnsPropagation => Duration::from_secs(10),
        }
    }

    /// Build a retry policy that retries every failure until the deadline.
    pub fn policy<E>(&self) -> RetryPolicy<E> {
        RetryPolicy::new(self.timeout(), self.interval())
    }
}

/// Bounds for a polling loop.
pub struct RetryPolicy<E> {
    pub timeout: Duration,
    pub interval: Duration,
    classifier: Option<Arc<dyn ErrorClassifier<E>>>,
}

impl<E> RetryPolicy<E> {
    /// Create a policy that retries every failure until the deadline.
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            classifier: None,
        }
    }

    /// Stop polling as soon as `classifier` reports an error as not transient.
    pub fn with_classifier(mut self, classifier: impl ErrorClassifier<E> + 'static) -> Self {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    fn should_retry(&self, error: &E) -> bool {
        self.classifier
            .as_ref()
            .map_or(true, |classifier| classifier.is_transient(error))
    }
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            timeout: self.timeout,
            interval: self.interval,
            classifier: self.classifier.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("timeout", &self.timeout)
            .field("interval", &self.interval)
            .field("classifier", &self.classifier.is_some())
            .finish()
    }
}

/// A successful value together with how long it took to obtain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Why a polling loop stopped without success.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("operation timed out after {elapsed:?} ({attempts} attempts): {last_error}")]
    TimedOut {
        last_error: E,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("operation failed with a non-transient error after {attempts} attempts: {error}")]
    NonTransient {
        error: E,
        attempts: u32,
        elapsed: Duration,
    },
}

impl<E> RetryError<E> {
    /// The error returned by the final attempt.
    pub fn last_error(&self) -> &E {
        match self {
            RetryError::TimedOut { last_error, .. } => last_error,
            RetryError::NonTransient { error, .. } => error,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::TimedOut { attempts, .. } | RetryError::NonTransient { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            RetryError::TimedOut { elapsed, .. } | RetryError::NonTransient { elapsed, .. } => {
                *elapsed
            }
        }
    }

    pub fn into_last_error(self) -> E {
        match self {
            RetryError::TimedOut { last_error, .. } => last_error,
            RetryError::NonTransient { error, .. } => error,
        }
    }
}

/// Poll `operation` until it succeeds or the policy's deadline passes.
///
/// Strategy:
/// - Attempt 1 runs immediately, whatever the policy's bounds
/// - After a failure, sleep exactly `interval` if the deadline has not passed
/// - Stop with [`RetryError::TimedOut`] when the deadline has passed before the next attempt
/// - Stop with [`RetryError::NonTransient`] when the policy's classifier rejects an error
///
/// # Example
///
/// ```no_run
/// use deploy_verify::eventual::{retry_with_timeout, ConsistencyCategory};
///
/// # async fn example() {
/// let policy = ConsistencyCategory::DnsPropagation.policy::<String>();
/// let result = retry_with_timeout(&policy, || async {
///     // Check whether the record has propagated
///     Err::<(), _>("not yet".to_string())
/// })
/// .await;
/// assert!(result.is_err());
/// # }
/// ```
pub async fn retry_with_timeout<T, E, F, Fut>(
    policy: &RetryPolicy<E>,
    mut operation: F,
) -> Result<Attempted<T>, RetryError<E>>
where
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    // `None` when the timeout is too large to represent: no deadline at all
    let deadline = start.checked_add(policy.timeout);
    let deadline_passed = || deadline.is_some_and(|d| Instant::now() >= d);
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;

        let error = match operation().await {
            Ok(value) => {
                debug!(
                    target: "deploy_verify.eventual",
                    attempts,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Operation succeeded"
                );
                return Ok(Attempted {
                    value,
                    attempts,
                    elapsed: start.elapsed(),
                });
            }
            Err(e) => e,
        };

        if !policy.should_retry(&error) {
            return Err(RetryError::NonTransient {
                error,
                attempts,
                elapsed: start.elapsed(),
            });
        }

        if deadline_passed() {
            return Err(RetryError::TimedOut {
                last_error: error,
                attempts,
                elapsed: start.elapsed(),
            });
        }

        warn!(
            target: "deploy_verify.eventual",
            attempt = attempts,
            error = %error,
            retry_in = ?policy.interval,
            "Attempt failed, retrying"
        );

        sleep(policy.interval).await;

        if deadline_passed() {
            return Err(RetryError::TimedOut {
                last_error: error,
                attempts,
                elapsed: start.elapsed(),
            });
        }
    }
}
