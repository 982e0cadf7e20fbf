//! Infrastructure provisioner fixture.
//!
//! The [`Provisioner`] trait is the black-box seam to whatever creates and
//! destroys the service under test. [`TerraformProvisioner`] drives the
//! `terraform` CLI; [`mock::MockProvisioner`] scripts results for tests.

use crate::classifier::RegexClassifier;
use common::types::RunId;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Terraform binary looked up in PATH.
const TERRAFORM_BIN: &str = "terraform";

/// Attempts for `init` and `apply` when the failure is known-retryable.
pub const DEFAULT_APPLY_ATTEMPTS: u32 = 3;

/// Wait between retryable `init` / `apply` attempts.
pub const DEFAULT_APPLY_RETRY_WAIT: Duration = Duration::from_secs(5);

/// Provisioner errors.
#[derive(Debug, Error)]
pub enum ProvisionerError {
    #[error("Failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with status {status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Failed to write variable file {path}: {source}")]
    VarFile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize provisioner variables: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid retryable error pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Provisioner error: {0}")]
    Other(String),
}

/// Variables handed to the provisioner on apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionVars {
    pub project_id: String,
    pub region: String,
    pub service_name: String,
    pub tenant_id: String,

    // Bridge configuration
    pub fetch_interval: String,
    pub fetch_timeout: String,
    pub port: u16,

    // Resource configuration
    pub cpu: String,
    pub memory: String,
    pub min_instances: u32,
    pub max_instances: u32,

    /// Empty string disables the custom domain.
    pub domain_name: String,
    pub dns_zone_name: String,

    /// Edge security policy allow list. `*` allows every source.
    pub allowed_ip_ranges: Vec<String>,

    pub database_name: String,
    pub database_user: String,
}

/// Trait for provisioner operations (enables mocking).
#[async_trait::async_trait]
pub trait Provisioner: Send + Sync {
    /// Prepare the working directory (download providers, configure backend).
    async fn init(&self) -> Result<(), ProvisionerError>;

    /// Create or update every resource.
    async fn apply(&self, vars: &ProvisionVars) -> Result<(), ProvisionerError>;

    /// Read one named output of the last apply.
    async fn output(&self, key: &str) -> Result<String, ProvisionerError>;

    /// Delete every resource created by apply.
    async fn destroy(&self) -> Result<(), ProvisionerError>;
}

/// Provisioner backed by the `terraform` CLI.
///
/// Variables are written to a per-run `*.tfvars.json` file inside the module
/// directory so that `destroy` sees exactly what `apply` used.
pub struct TerraformProvisioner {
    working_dir: PathBuf,
    var_file_name: String,
    retryable: RegexClassifier,
    max_attempts: u32,
    retry_wait: Duration,
}

impl TerraformProvisioner {
    /// Create a provisioner for the module in `working_dir`.
    pub fn new(working_dir: impl Into<PathBuf>, run_id: &RunId) -> Result<Self, ProvisionerError> {
        Ok(Self {
            working_dir: working_dir.into(),
            var_file_name: format!("deploy-verify-{}.tfvars.json", run_id),
            retryable: RegexClassifier::terraform_retryable()?,
            max_attempts: DEFAULT_APPLY_ATTEMPTS,
            retry_wait: DEFAULT_APPLY_RETRY_WAIT,
        })
    }

    /// Override how `init` / `apply` retry known-transient failures.
    pub fn with_retries(mut self, max_attempts: u32, retry_wait: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_wait = retry_wait;
        self
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Path of the variable file written by apply.
    pub fn var_file_path(&self) -> PathBuf {
        self.working_dir.join(&self.var_file_name)
    }

    fn var_file_arg(&self) -> String {
        format!("-var-file={}", self.var_file_name)
    }

    /// Run terraform once and return its stdout.
    async fn terraform(&self, args: &[&str]) -> Result<String, ProvisionerError> {
        let command = format!("{} {}", TERRAFORM_BIN, args.join(" "));
        debug!(target: "deploy_verify.provisioner", command = %command, "Running terraform");

        let output = Command::new(TERRAFORM_BIN)
            .args(args)
            .current_dir(&self.working_dir)
            .env("TF_IN_AUTOMATION", "1")
            .output()
            .await
            .map_err(|source| ProvisionerError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProvisionerError::CommandFailed {
                command,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run terraform, retrying failures that match a known-retryable pattern.
    async fn terraform_with_retries(&self, args: &[&str]) -> Result<String, ProvisionerError> {
        let mut attempt = 1;
        loop {
            match self.terraform(args).await {
                Ok(stdout) => return Ok(stdout),
                Err(e) if attempt < self.max_attempts && self.retryable.matches(&e.to_string()) => {
                    warn!(
                        target: "deploy_verify.provisioner",
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        retry_in = ?self.retry_wait,
                        "Retryable terraform error"
                    );
                    tokio::time::sleep(self.retry_wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait::async_trait]
impl Provisioner for TerraformProvisioner {
    async fn init(&self) -> Result<(), ProvisionerError> {
        info!(
            target: "deploy_verify.provisioner",
            working_dir = %self.working_dir.display(),
            "Running terraform init"
        );
        self.terraform_with_retries(&["init", "-input=false", "-no-color"])
            .await?;
        Ok(())
    }

    async fn apply(&self, vars: &ProvisionVars) -> Result<(), ProvisionerError> {
        let path = self.var_file_path();
        let contents = serde_json::to_vec_pretty(vars)?;
        tokio::fs::write(&path, contents)
            .await
            .map_err(|source| ProvisionerError::VarFile {
                path: path.display().to_string(),
                source,
            })?;

        info!(
            target: "deploy_verify.provisioner",
            service_name = %vars.service_name,
            var_file = %path.display(),
            "Running terraform apply"
        );
        let var_file = self.var_file_arg();
        self.terraform_with_retries(&[
            "apply",
            "-auto-approve",
            "-input=false",
            "-no-color",
            &var_file,
        ])
        .await?;
        Ok(())
    }

    async fn output(&self, key: &str) -> Result<String, ProvisionerError> {
        let stdout = self
            .terraform(&["output", "-no-color", "-raw", key])
            .await?;
        Ok(stdout.trim().to_string())
    }

    async fn destroy(&self) -> Result<(), ProvisionerError> {
        let path = self.var_file_path();
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            info!(
                target: "deploy_verify.provisioner",
                var_file = %path.display(),
                "No variable file, apply never ran; nothing to destroy"
            );
            return Ok(());
        }

        let var_file = self.var_file_arg();
        self.terraform(&[
            "destroy",
            "-auto-approve",
            "-input=false",
            "-no-color",
            &var_file,
        ])
        .await?;

        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(
                target: "deploy_verify.provisioner",
                var_file = %path.display(),
                error = %e,
                "Failed to remove variable file after destroy"
            );
        }
        Ok(())
    }
}

/// Mock provisioner module for testing.
///
/// This module provides a scripted provisioner for session and teardown tests.
pub mod mock {

    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// Scripted provisioner.
    ///
    /// `destroy` pops results from a queue and succeeds once the queue is empty.
    #[derive(Default)]
    pub struct MockProvisioner {
        apply_error: Option<String>,
        outputs: HashMap<String, String>,
        destroy_results: Mutex<VecDeque<Result<(), String>>>,
        applied_vars: Mutex<Option<ProvisionVars>>,
        init_calls: AtomicUsize,
        apply_calls: AtomicUsize,
        destroy_calls: AtomicUsize,
    }

    impl MockProvisioner {
        /// Create a mock whose operations all succeed.
        pub fn new() -> Self {
            Self::default()
        }

        /// Make apply fail with `message`.
        pub fn with_apply_error(mut self, message: impl Into<String>) -> Self {
            self.apply_error = Some(message.into());
            self
        }

        /// Serve `value` for output `key`.
        pub fn with_output(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
            self.outputs.insert(key.into(), value.into());
            self
        }

        /// Results returned by successive destroy calls (`Err` carries the message).
        pub fn with_destroy_results(mut self, results: Vec<Result<(), String>>) -> Self {
            self.destroy_results = Mutex::new(results.into());
            self
        }

        pub fn init_calls(&self) -> usize {
            self.init_calls.load(Ordering::SeqCst)
        }

        pub fn apply_calls(&self) -> usize {
            self.apply_calls.load(Ordering::SeqCst)
        }

        pub fn destroy_calls(&self) -> usize {
            self.destroy_calls.load(Ordering::SeqCst)
        }

        /// Variables passed to the most recent apply.
        pub async fn applied_vars(&self) -> Option<ProvisionVars> {
            self.applied_vars.lock().await.clone()
        }
    }

    #[async_trait::async_trait]
    impl Provisioner for MockProvisioner {
        async fn init(&self) -> Result<(), ProvisionerError> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn apply(&self, vars: &ProvisionVars) -> Result<(), ProvisionerError> {
            self.apply_calls.fetch_add(1, Ordering::SeqCst);
            *self.applied_vars.lock().await = Some(vars.clone());

            match &self.apply_error {
                Some(message) => Err(ProvisionerError::Other(message.clone())),
                None => Ok(()),
            }
        }

        async fn output(&self, key: &str) -> Result<String, ProvisionerError> {
            self.outputs
                .get(key)
                .cloned()
                .ok_or_else(|| ProvisionerError::Other(format!("output {key} not found")))
        }

        async fn destroy(&self) -> Result<(), ProvisionerError> {
            self.destroy_calls.fetch_add(1, Ordering::SeqCst);

            match self.destroy_results.lock().await.pop_front() {
                Some(Err(message)) => Err(ProvisionerError::Other(message)),
                Some(Ok(())) | None => Ok(()),
            }
        }
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used, clippy::expect_used)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_mock_destroy_script() {
            let mock = MockProvisioner::new()
                .with_destroy_results(vec![Err("serverless-ipv4 in use".to_string()), Ok(())]);

            assert!(mock.destroy().await.is_err());
            assert!(mock.destroy().await.is_ok());
            assert!(mock.destroy().await.is_ok());
            assert_eq!(mock.destroy_calls(), 3);
        }

        #[tokio::test]
        async fn test_mock_outputs() {
            let mock = MockProvisioner::new().with_output("bridge_load_balancer_ip", "203.0.113.7");

            assert_eq!(
                mock.output("bridge_load_balancer_ip").await.unwrap(),
                "203.0.113.7"
            );
            assert!(mock.output("database_name").await.is_err());
        }
    }
}
