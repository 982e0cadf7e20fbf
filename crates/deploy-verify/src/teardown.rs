//! Best-effort teardown with escalating backoff.
//!
//! Deleting a Cloud Run service with Direct VPC egress leaves a
//! `serverless-ipv4` address behind for several minutes, and the VPC cannot be
//! deleted until it is released. The orchestrator retries destroy while the
//! error matches that known condition and gives up with cleanup instructions
//! once attempts run out.
//!
//! State machine:
//!
//! ```text
//! Idle -> Attempting -> Succeeded
//!             |  ^
//!             v  |
//!           Retrying
//!             |
//!             v
//!          GivenUp
//! ```
//!
//! A teardown outcome never fails a verification run.

use crate::classifier::{ErrorClassifier, SubstringClassifier};
use crate::fixtures::provisioner::{Provisioner, ProvisionerError};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Default number of destroy attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default backoff unit; attempt `n` waits `n * unit` before the next one.
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(60);

/// Default delay before the first attempt, covering address release latency.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(30);

/// Retry bounds for teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownPolicy {
    pub max_attempts: u32,
    pub backoff_unit: Duration,
    pub initial_delay: Duration,
}

impl Default for TeardownPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_unit: DEFAULT_BACKOFF_UNIT,
            initial_delay: DEFAULT_INITIAL_DELAY,
        }
    }
}

impl TeardownPolicy {
    /// Wait after failed attempt `attempt` (1-based), saturating at `Duration::MAX`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_unit
            .checked_mul(attempt)
            .unwrap_or(Duration::MAX)
    }
}

/// Why teardown stopped without succeeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// Every attempt hit a known-transient error.
    TransientExhausted,
    /// An error outside the known-transient set.
    Permanent,
}

/// Teardown state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownState {
    Idle,
    Attempting { attempt: u32 },
    Retrying { attempt: u32, wait: Duration },
    Succeeded,
    GivenUp(GiveUpReason),
}

/// One destroy attempt in the audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownAttempt {
    pub index: u32,
    pub error: Option<String>,
    pub transient: bool,
    pub wait_before_next: Option<Duration>,
}

/// Result of a teardown run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// Final state: `Succeeded` or `GivenUp`.
    pub state: TeardownState,
    pub attempts: Vec<TeardownAttempt>,
    /// Manual cleanup instructions; empty when teardown succeeded.
    pub remediation: Vec<String>,
}

impl TeardownReport {
    pub fn succeeded(&self) -> bool {
        self.state == TeardownState::Succeeded
    }

    /// Backoff waits taken between attempts, in order.
    pub fn waits(&self) -> Vec<Duration> {
        self.attempts
            .iter()
            .filter_map(|a| a.wait_before_next)
            .collect()
    }
}

/// Names used in manual cleanup instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemediationContext {
    pub project_id: String,
    pub service_name: String,
    /// Directory holding the provisioner module and its cleanup script.
    pub module_dir: String,
}

/// Manual cleanup instructions for a VPC stuck on a serverless-ipv4 address.
pub fn remediation_guidance(context: &RemediationContext, attempts: u32) -> Vec<String> {
    vec![
        format!(
            "VPC deletion failed after {attempts} attempts: serverless-ipv4 addresses are \
             released 5-10 minutes after the Cloud Run service is deleted (VPC <- subnet <- serverless-ipv4)"
        ),
        format!(
            "Option 1: run the cleanup script: cd {} && ./scripts/cleanup.sh {} {}",
            context.module_dir, context.project_id, context.service_name
        ),
        format!(
            "Option 2: wait 5-10 minutes, then: cd {} && terraform destroy -auto-approve",
            context.module_dir
        ),
        format!(
            "Option 3: delete VPC {}-vpc at https://console.cloud.google.com/networking/networks?project={}",
            context.service_name, context.project_id
        ),
        "Option 4: leave the resources in place; VPC, subnet and serverless-ipv4 addresses \
         are free and later runs use unique names"
            .to_string(),
    ]
}

/// Drives destroy attempts until success or give-up.
pub struct TeardownOrchestrator {
    policy: TeardownPolicy,
    classifier: Box<dyn ErrorClassifier<ProvisionerError>>,
    context: RemediationContext,
}

impl TeardownOrchestrator {
    /// Create an orchestrator with the default policy and the serverless-ipv4 classifier.
    pub fn new(context: RemediationContext) -> Self {
        Self {
            policy: TeardownPolicy::default(),
            classifier: Box::new(SubstringClassifier::serverless_ipv4_release()),
            context,
        }
    }

    pub fn with_policy(mut self, policy: TeardownPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_classifier(
        mut self,
        classifier: impl ErrorClassifier<ProvisionerError> + 'static,
    ) -> Self {
        self.classifier = Box::new(classifier);
        self
    }

    pub fn policy(&self) -> &TeardownPolicy {
        &self.policy
    }

    fn transition(state: &mut TeardownState, next: TeardownState) {
        debug!(
            target: "deploy_verify.teardown",
            from = ?state,
            to = ?next,
            "Teardown state transition"
        );
        *state = next;
    }

    /// Run teardown against `provisioner`. Never returns an error.
    pub async fn run(&self, provisioner: &dyn Provisioner) -> TeardownReport {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut state = TeardownState::Idle;
        let mut attempts: Vec<TeardownAttempt> = Vec::new();

        info!(
            target: "deploy_verify.teardown",
            service_name = %self.context.service_name,
            initial_delay = ?self.policy.initial_delay,
            "Waiting for the platform to release serverless-ipv4 addresses before destroy"
        );
        sleep(self.policy.initial_delay).await;

        for attempt in 1..=max_attempts {
            Self::transition(&mut state, TeardownState::Attempting { attempt });
            info!(
                target: "deploy_verify.teardown",
                attempt,
                max_attempts,
                "Destroy attempt"
            );

            let error = match provisioner.destroy().await {
                Ok(()) => {
                    attempts.push(TeardownAttempt {
                        index: attempt,
                        error: None,
                        transient: false,
                        wait_before_next: None,
                    });
                    Self::transition(&mut state, TeardownState::Succeeded);
                    info!(target: "deploy_verify.teardown", attempt, "Destroy completed successfully");
                    break;
                }
                Err(e) => e,
            };

            let transient = self.classifier.is_transient(&error);
            if transient && attempt < max_attempts {
                let wait = self.policy.backoff_for(attempt);
                warn!(
                    target: "deploy_verify.teardown",
                    attempt,
                    error = %error,
                    retry_in = ?wait,
                    "Destroy hit a known-transient error, retrying"
                );
                attempts.push(TeardownAttempt {
                    index: attempt,
                    error: Some(error.to_string()),
                    transient,
                    wait_before_next: Some(wait),
                });
                Self::transition(&mut state, TeardownState::Retrying { attempt, wait });
                sleep(wait).await;
                continue;
            }

            attempts.push(TeardownAttempt {
                index: attempt,
                error: Some(error.to_string()),
                transient,
                wait_before_next: None,
            });
            let reason = if transient {
                GiveUpReason::TransientExhausted
            } else {
                GiveUpReason::Permanent
            };
            Self::transition(&mut state, TeardownState::GivenUp(reason));
            break;
        }

        let remediation = match state {
            TeardownState::GivenUp(GiveUpReason::TransientExhausted) => {
                let guidance = remediation_guidance(&self.context, max_attempts);
                for line in &guidance {
                    warn!(target: "deploy_verify.teardown", "{}", line);
                }
                guidance
            }
            TeardownState::GivenUp(GiveUpReason::Permanent) => {
                let last_error = attempts
                    .last()
                    .and_then(|a| a.error.clone())
                    .unwrap_or_default();
                warn!(
                    target: "deploy_verify.teardown",
                    error = %last_error,
                    "Destroy failed with an unclassified error"
                );
                let hint = format!(
                    "Destroy failed with an unclassified error; manual cleanup may be required \
                     via the cloud console or ./scripts/cleanup.sh {} {}",
                    self.context.project_id, self.context.service_name
                );
                warn!(target: "deploy_verify.teardown", "{}", hint);
                vec![hint]
            }
            _ => Vec::new(),
        };

        TeardownReport {
            state,
            attempts,
            remediation,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::fixtures::provisioner::mock::MockProvisioner;
    use tokio::time::Instant;

    const TRANSIENT: &str = "Error deleting subnetwork: serverless-ipv4 address is in use";

    fn context() -> RemediationContext {
        RemediationContext {
            project_id: "proj".to_string(),
            service_name: "bridge-test-abc".to_string(),
            module_dir: "terraform/gcp-cloud-run".to_string(),
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = TeardownPolicy::default();

        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_unit, Duration::from_secs(60));
        assert_eq!(policy.initial_delay, Duration::from_secs(30));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(120));
    }

    #[test]
    fn test_backoff_saturates_instead_of_overflowing() {
        let policy = TeardownPolicy {
            backoff_unit: Duration::MAX,
            ..TeardownPolicy::default()
        };

        assert_eq!(policy.backoff_for(1), Duration::MAX);
        assert_eq!(policy.backoff_for(3), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_attempts_still_destroys_once() {
        let provisioner =
            MockProvisioner::new().with_destroy_results(vec![Err(TRANSIENT.to_string()), Ok(())]);
        let orchestrator = TeardownOrchestrator::new(context()).with_policy(TeardownPolicy {
            max_attempts: 0,
            ..TeardownPolicy::default()
        });

        let report = orchestrator.run(&provisioner).await;

        assert_eq!(provisioner.destroy_calls(), 1);
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(
            report.state,
            TeardownState::GivenUp(GiveUpReason::TransientExhausted)
        );
        assert!(report.waits().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_twice_then_success_escalates_backoff() {
        let provisioner = MockProvisioner::new().with_destroy_results(vec![
            Err(TRANSIENT.to_string()),
            Err(TRANSIENT.to_string()),
            Ok(()),
        ]);
        let start = Instant::now();

        let report = TeardownOrchestrator::new(context()).run(&provisioner).await;

        assert_eq!(report.state, TeardownState::Succeeded);
        assert!(report.succeeded());
        assert_eq!(
            report.waits(),
            vec![Duration::from_secs(60), Duration::from_secs(120)]
        );
        assert_eq!(report.attempts.len(), 3);
        assert!(report.attempts[0].transient);
        assert_eq!(report.attempts[2].error, None);
        assert!(report.remediation.is_empty());
        assert_eq!(provisioner.destroy_calls(), 3);
        // 30s initial delay + 60s + 120s
        assert_eq!(start.elapsed(), Duration::from_secs(210));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhausted_gives_up_with_guidance() {
        let provisioner = MockProvisioner::new().with_destroy_results(vec![
            Err(TRANSIENT.to_string()),
            Err("subnetwork is already being used by addresses/x".to_string()),
            Err("servicenetworking connection still present".to_string()),
        ]);

        let report = TeardownOrchestrator::new(context()).run(&provisioner).await;

        assert_eq!(
            report.state,
            TeardownState::GivenUp(GiveUpReason::TransientExhausted)
        );
        assert_eq!(provisioner.destroy_calls(), 3);
        assert_eq!(report.attempts[2].wait_before_next, None);
        assert!(report.attempts.iter().all(|a| a.transient));
        assert_eq!(report.remediation.len(), 5);
        assert!(report
            .remediation
            .iter()
            .any(|line| line.contains("./scripts/cleanup.sh proj bridge-test-abc")));
        assert!(report
            .remediation
            .iter()
            .any(|line| line.contains("bridge-test-abc-vpc")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_gives_up_immediately() {
        let provisioner = MockProvisioner::new().with_destroy_results(vec![
            Err("Error 403: caller lacks permission".to_string()),
            Ok(()),
        ]);
        let start = Instant::now();

        let report = TeardownOrchestrator::new(context()).run(&provisioner).await;

        assert_eq!(report.state, TeardownState::GivenUp(GiveUpReason::Permanent));
        assert_eq!(provisioner.destroy_calls(), 1);
        assert_eq!(report.attempts.len(), 1);
        assert!(!report.attempts[0].transient);
        assert!(report.waits().is_empty());
        assert_eq!(report.remediation.len(), 1);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_success_still_waits_initial_delay() {
        let provisioner = MockProvisioner::new();
        let start = Instant::now();

        let report = TeardownOrchestrator::new(context()).run(&provisioner).await;

        assert!(report.succeeded());
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(start.elapsed(), DEFAULT_INITIAL_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_classifier_and_policy() {
        let provisioner = MockProvisioner::new().with_destroy_results(vec![
            Err("resourceInUseByAnotherResource".to_string()),
            Ok(()),
        ]);
        let orchestrator = TeardownOrchestrator::new(context())
            .with_policy(TeardownPolicy {
                max_attempts: 2,
                backoff_unit: Duration::from_secs(5),
                initial_delay: Duration::ZERO,
            })
            .with_classifier(|e: &ProvisionerError| {
                e.to_string().contains("resourceInUseByAnotherResource")
            });

        let report = orchestrator.run(&provisioner).await;

        assert!(report.succeeded());
        assert_eq!(report.waits(), vec![Duration::from_secs(5)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_classifier_treats_everything_as_permanent() {
        let provisioner =
            MockProvisioner::new().with_destroy_results(vec![Err(TRANSIENT.to_string()), Ok(())]);
        let orchestrator = TeardownOrchestrator::new(context())
            .with_classifier(SubstringClassifier::new(Vec::<String>::new()));

        let report = orchestrator.run(&provisioner).await;

        assert_eq!(report.state, TeardownState::GivenUp(GiveUpReason::Permanent));
        assert_eq!(provisioner.destroy_calls(), 1);
    }
}
