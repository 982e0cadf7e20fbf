//! Verification run configuration.
//!
//! Configuration is loaded from environment variables. The API access token
//! is redacted in Debug output.

use crate::fixtures::cloud_run::DEFAULT_CLOUD_RUN_API_URL;
use crate::model::ServicePath;
use common::config::ObservabilityConfig;
use common::secret::SecretString;
use common::types::RunId;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Default deployment region.
pub const DEFAULT_REGION: &str = "asia-northeast1";

/// Default Terraform module directory, relative to the working directory.
pub const DEFAULT_TERRAFORM_DIR: &str = "terraform/gcp-cloud-run";

/// Prefix of every provisioned service name.
pub const SERVICE_NAME_PREFIX: &str = "bridge-test";

/// Longest run ID that still keeps derived resource names within
/// Cloud Run's 49-character service name limit.
const MAX_RUN_ID_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid run ID configuration: {0}")]
    InvalidRunId(String),
}

/// Verification run configuration.
#[derive(Clone)]
pub struct Config {
    /// GCP project that hosts the test deployment.
    pub project_id: String,

    /// Deployment region (default: "asia-northeast1").
    pub region: String,

    /// Tenant identifier injected into the service environment.
    pub tenant_id: String,

    /// Custom domain; the HTTPS health check is skipped when unset.
    pub domain_name: Option<String>,

    /// Managed DNS zone; the DNS/load-balancer check needs both this and a domain.
    pub dns_zone_name: Option<String>,

    /// Terraform module directory.
    pub terraform_dir: PathBuf,

    /// Unique identifier embedded in resource names.
    pub run_id: RunId,

    /// OAuth access token for the Cloud Run Admin API.
    pub access_token: SecretString,

    /// Cloud Run Admin API base URL.
    pub cloud_run_api_url: String,

    pub observability: ObservabilityConfig,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("project_id", &self.project_id)
            .field("region", &self.region)
            .field("tenant_id", &self.tenant_id)
            .field("domain_name", &self.domain_name)
            .field("dns_zone_name", &self.dns_zone_name)
            .field("terraform_dir", &self.terraform_dir)
            .field("run_id", &self.run_id)
            .field("access_token", &"[REDACTED]")
            .field("cloud_run_api_url", &self.cloud_run_api_url)
            .field("observability", &self.observability)
            .finish()
    }
}

/// Non-empty, trimmed value of `key`.
fn non_empty(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn required(vars: &HashMap<String, String>, key: &str) -> Result<String, ConfigError> {
    non_empty(vars, key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let project_id = required(vars, "TEST_GCP_PROJECT_ID")?;
        let tenant_id = required(vars, "TEST_TENANT_ID")?;
        let access_token = SecretString::from(required(vars, "GOOGLE_OAUTH_ACCESS_TOKEN")?);

        let region =
            non_empty(vars, "TEST_GCP_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string());

        let domain_name = non_empty(vars, "TEST_DOMAIN_NAME");
        let dns_zone_name = non_empty(vars, "TEST_DNS_ZONE_NAME");

        let terraform_dir = non_empty(vars, "TEST_TERRAFORM_DIR")
            .map_or_else(|| PathBuf::from(DEFAULT_TERRAFORM_DIR), PathBuf::from);

        // Run IDs end up in resource names: lowercase letters, digits and inner hyphens only
        let run_id = match non_empty(vars, "TEST_RUN_ID") {
            Some(value) => {
                let run_id = RunId::from_supplied(&value);
                let valid_chars = run_id
                    .as_str()
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
                let hyphen_at_edge =
                    run_id.as_str().starts_with('-') || run_id.as_str().ends_with('-');
                if !valid_chars || hyphen_at_edge {
                    return Err(ConfigError::InvalidRunId(format!(
                        "TEST_RUN_ID must contain only letters, digits and inner hyphens, got '{value}'"
                    )));
                }
                if run_id.as_str().len() > MAX_RUN_ID_LEN {
                    return Err(ConfigError::InvalidRunId(format!(
                        "TEST_RUN_ID must be at most {MAX_RUN_ID_LEN} characters, got {}",
                        run_id.as_str().len()
                    )));
                }
                run_id
            }
            None => RunId::new(),
        };

        let cloud_run_api_url = non_empty(vars, "CLOUD_RUN_API_URL")
            .unwrap_or_else(|| DEFAULT_CLOUD_RUN_API_URL.to_string());

        Ok(Config {
            project_id,
            region,
            tenant_id,
            domain_name,
            dns_zone_name,
            terraform_dir,
            run_id,
            access_token,
            cloud_run_api_url,
            observability: ObservabilityConfig::from_vars(vars),
        })
    }

    /// Name of the service provisioned for this run.
    pub fn service_name(&self) -> String {
        self.run_id.resource_name(SERVICE_NAME_PREFIX)
    }

    pub fn service_path(&self) -> ServicePath {
        ServicePath::new(&self.project_id, &self.region, self.service_name())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            ("TEST_GCP_PROJECT_ID".to_string(), "bridge-ci".to_string()),
            ("TEST_TENANT_ID".to_string(), "tenant-1".to_string()),
            (
                "GOOGLE_OAUTH_ACCESS_TOKEN".to_string(),
                "ya29.secret-token".to_string(),
            ),
        ])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(config.project_id, "bridge-ci");
        assert_eq!(config.region, DEFAULT_REGION);
        assert_eq!(config.tenant_id, "tenant-1");
        assert_eq!(config.domain_name, None);
        assert_eq!(config.dns_zone_name, None);
        assert_eq!(config.terraform_dir, PathBuf::from(DEFAULT_TERRAFORM_DIR));
        assert_eq!(config.cloud_run_api_url, DEFAULT_CLOUD_RUN_API_URL);
        assert_eq!(config.access_token.expose_secret(), "ya29.secret-token");
        assert!(!config.observability.json_logs);
        assert_eq!(config.run_id.as_str().len(), common::types::RUN_ID_LEN);
    }

    #[test]
    fn test_from_vars_custom_values() {
        let mut vars = base_vars();
        vars.insert("TEST_GCP_REGION".to_string(), "us-central1".to_string());
        vars.insert("TEST_DOMAIN_NAME".to_string(), "bridge.example.com".to_string());
        vars.insert("TEST_DNS_ZONE_NAME".to_string(), "example-zone".to_string());
        vars.insert("TEST_TERRAFORM_DIR".to_string(), "/tmp/module".to_string());
        vars.insert("TEST_RUN_ID".to_string(), "CI-42".to_string());
        vars.insert("CLOUD_RUN_API_URL".to_string(), "http://localhost:9000".to_string());
        vars.insert("LOG_JSON".to_string(), "true".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.region, "us-central1");
        assert_eq!(config.domain_name.as_deref(), Some("bridge.example.com"));
        assert_eq!(config.dns_zone_name.as_deref(), Some("example-zone"));
        assert_eq!(config.terraform_dir, PathBuf::from("/tmp/module"));
        assert_eq!(config.run_id.as_str(), "ci-42");
        assert_eq!(config.service_name(), "bridge-test-ci-42");
        assert_eq!(
            config.service_path().to_string(),
            "projects/bridge-ci/locations/us-central1/services/bridge-test-ci-42"
        );
        assert_eq!(config.cloud_run_api_url, "http://localhost:9000");
        assert!(config.observability.json_logs);
    }

    #[test]
    fn test_from_vars_missing_required() {
        for key in [
            "TEST_GCP_PROJECT_ID",
            "TEST_TENANT_ID",
            "GOOGLE_OAUTH_ACCESS_TOKEN",
        ] {
            let mut vars = base_vars();
            vars.remove(key);

            let result = Config::from_vars(&vars);
            assert!(
                matches!(result, Err(ConfigError::MissingEnvVar(ref k)) if k == key),
                "expected MissingEnvVar({key}), got {result:?}"
            );
        }
    }

    #[test]
    fn test_blank_values_count_as_unset() {
        let mut vars = base_vars();
        vars.insert("TEST_TENANT_ID".to_string(), "   ".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::MissingEnvVar(_))
        ));

        let mut vars = base_vars();
        vars.insert("TEST_DOMAIN_NAME".to_string(), String::new());
        let config = Config::from_vars(&vars).unwrap();
        assert_eq!(config.domain_name, None);
    }

    #[test]
    fn test_invalid_run_id_rejected() {
        let mut vars = base_vars();
        vars.insert("TEST_RUN_ID".to_string(), "run_42".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidRunId(_))
        ));

        for value in ["-run42", "run42-"] {
            let mut vars = base_vars();
            vars.insert("TEST_RUN_ID".to_string(), value.to_string());
            assert!(
                matches!(Config::from_vars(&vars), Err(ConfigError::InvalidRunId(_))),
                "{value} should be rejected"
            );
        }

        let mut vars = base_vars();
        vars.insert("TEST_RUN_ID".to_string(), "a".repeat(MAX_RUN_ID_LEN + 1));
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidRunId(_))
        ));
    }

    #[test]
    fn test_debug_redacts_access_token() {
        let config = Config::from_vars(&base_vars()).unwrap();
        let debug_output = format!("{config:?}");

        assert!(!debug_output.contains("ya29.secret-token"));
        assert!(debug_output.contains("[REDACTED]"));
        assert!(debug_output.contains("bridge-ci"));
    }
}
