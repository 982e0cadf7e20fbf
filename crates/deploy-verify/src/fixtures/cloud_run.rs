//! Cloud Run Admin API client fixture.
//!
//! Reads a deployed service through the v2 REST API and flattens it into a
//! [`ResourceDescriptor`]. Only the first container of the revision template
//! is inspected; the bridge service runs a single container.

use crate::model::{IngressMode, ModelError, ResourceDescriptor, ServicePath};
use common::secret::{ExposeSecret, SecretString};
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Public Cloud Run Admin API endpoint.
pub const DEFAULT_CLOUD_RUN_API_URL: &str = "https://run.googleapis.com";

/// Maximum length for error body in error messages.
const MAX_ERROR_BODY_LEN: usize = 256;

/// Environment variable carrying the tenant identifier inside the container.
const TENANT_ENV_KEY: &str = "TENANT_ID";

/// Truncate an error response body for inclusion in error messages.
fn truncate_error_body(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY_LEN) {
        Some((cut, _)) => format!("{}...[truncated]", body.get(..cut).unwrap_or(body)),
        None => body.to_string(),
    }
}

/// Resource reader errors.
#[derive(Debug, Error)]
pub enum ResourceReaderError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Request failed with status {status}: {body}")]
    RequestFailed { status: u16, body: String },

    #[error("Malformed service resource: {0}")]
    MalformedService(String),

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Trait for reading provisioned services (enables mocking).
#[async_trait::async_trait]
pub trait ResourceReader: Send + Sync {
    /// Fetch the current configuration of the service at `path`.
    async fn get_service(&self, path: &ServicePath)
        -> Result<ResourceDescriptor, ResourceReaderError>;
}

/// `Service` resource, reduced to the fields that are validated.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResource {
    pub name: String,
    #[serde(default)]
    pub ingress: Option<String>,
    #[serde(default)]
    pub template: Option<RevisionTemplate>,
}

#[derive(Debug, Deserialize)]
pub struct RevisionTemplate {
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Deserialize)]
pub struct Container {
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
}

#[derive(Debug, Deserialize)]
pub struct EnvVar {
    pub name: String,
    /// Absent when the value comes from a secret reference.
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    #[serde(default)]
    pub container_port: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

impl ServiceResource {
    /// Flatten the API resource into a descriptor for `path`.
    pub fn into_descriptor(self, path: &ServicePath) -> Result<ResourceDescriptor, ResourceReaderError> {
        let ingress: IngressMode = self
            .ingress
            .as_deref()
            .ok_or_else(|| ResourceReaderError::MalformedService("ingress not set".to_string()))?
            .parse()?;

        let container = self
            .template
            .and_then(|t| t.containers.into_iter().next())
            .ok_or_else(|| {
                ResourceReaderError::MalformedService("template has no containers".to_string())
            })?;

        let raw_port = container
            .ports
            .first()
            .and_then(|p| p.container_port)
            .ok_or_else(|| {
                ResourceReaderError::MalformedService("container declares no port".to_string())
            })?;
        let container_port = u16::try_from(raw_port).map_err(|_| {
            ResourceReaderError::MalformedService(format!("container port {raw_port} out of range"))
        })?;

        let env: BTreeMap<String, String> = container
            .env
            .into_iter()
            .map(|e| (e.name, e.value.unwrap_or_default()))
            .collect();
        let tenant_id = env.get(TENANT_ENV_KEY).cloned().unwrap_or_default();

        let limits = container.resources.map(|r| r.limits).unwrap_or_default();

        Ok(ResourceDescriptor {
            project_id: path.project_id.clone(),
            region: path.region.clone(),
            service_name: path.service_name.clone(),
            tenant_id,
            env,
            container_port,
            limits,
            ingress,
        })
    }
}

/// Client for the Cloud Run Admin API v2.
pub struct CloudRunClient {
    base_url: String,
    access_token: SecretString,
    http_client: Client,
}

impl CloudRunClient {
    /// Create a new Cloud Run client.
    pub fn new(
        base_url: impl Into<String>,
        access_token: SecretString,
    ) -> Result<Self, ResourceReaderError> {
        let http_client = Client::builder().timeout(Duration::from_secs(10)).build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token,
            http_client,
        })
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait::async_trait]
impl ResourceReader for CloudRunClient {
    async fn get_service(
        &self,
        path: &ServicePath,
    ) -> Result<ResourceDescriptor, ResourceReaderError> {
        let url = format!("{}/v2/{}", self.base_url, path);

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(self.access_token.expose_secret())
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ResourceReaderError::RequestFailed {
                status: status.as_u16(),
                body: truncate_error_body(&body),
            });
        }

        let resource: ServiceResource = response.json().await?;
        tracing::info!(
            target: "deploy_verify.cloud_run",
            service = %resource.name,
            "Cloud Run service found"
        );

        resource.into_descriptor(path)
    }
}

/// Mock resource reader module for testing.
pub mod mock {

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Resource reader returning a fixed descriptor or a fixed error.
    pub struct MockResourceReader {
        descriptor: Option<ResourceDescriptor>,
        call_count: AtomicUsize,
    }

    impl MockResourceReader {
        /// Create a mock that always returns `descriptor`.
        pub fn returning(descriptor: ResourceDescriptor) -> Self {
            Self {
                descriptor: Some(descriptor),
                call_count: AtomicUsize::new(0),
            }
        }

        /// Create a mock that always answers 404.
        pub fn not_found() -> Self {
            Self {
                descriptor: None,
                call_count: AtomicUsize::new(0),
            }
        }

        /// Get the number of calls made.
        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl ResourceReader for MockResourceReader {
        async fn get_service(
            &self,
            path: &ServicePath,
        ) -> Result<ResourceDescriptor, ResourceReaderError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);

            self.descriptor
                .clone()
                .ok_or_else(|| ResourceReaderError::RequestFailed {
                    status: 404,
                    body: format!("Resource '{path}' was not found"),
                })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn path() -> ServicePath {
        ServicePath::new("proj", "asia-northeast1", "bridge-test-abc")
    }

    const SERVICE_JSON: &str = r#"{
        "name": "projects/proj/locations/asia-northeast1/services/bridge-test-abc",
        "ingress": "INGRESS_TRAFFIC_INTERNAL_LOAD_BALANCER",
        "template": {
            "containers": [{
                "image": "asia-docker.pkg.dev/proj/bridge/bridge:latest",
                "env": [
                    {"name": "FETCH_INTERVAL", "value": "1h"},
                    {"name": "FETCH_TIMEOUT", "value": "10s"},
                    {"name": "TENANT_ID", "value": "tenant-1"},
                    {"name": "DB_PASSWORD", "valueSource": {"secretKeyRef": {"secret": "db"}}}
                ],
                "ports": [{"name": "http1", "containerPort": 8080}],
                "resources": {"limits": {"cpu": "1", "memory": "512Mi"}}
            }]
        }
    }"#;

    #[test]
    fn test_service_resource_into_descriptor() {
        let resource: ServiceResource = serde_json::from_str(SERVICE_JSON).unwrap();
        let descriptor = resource.into_descriptor(&path()).unwrap();

        assert_eq!(descriptor.project_id, "proj");
        assert_eq!(descriptor.service_name, "bridge-test-abc");
        assert_eq!(descriptor.tenant_id, "tenant-1");
        assert_eq!(descriptor.env.get("FETCH_INTERVAL").unwrap(), "1h");
        assert_eq!(descriptor.env.get("DB_PASSWORD").unwrap(), "");
        assert_eq!(descriptor.container_port, 8080);
        assert_eq!(descriptor.limits.get("memory").unwrap(), "512Mi");
        assert_eq!(descriptor.ingress, IngressMode::InternalLoadBalancer);
    }

    #[test]
    fn test_service_without_containers_is_malformed() {
        let json = r#"{"name": "x", "ingress": "INGRESS_TRAFFIC_ALL", "template": {"containers": []}}"#;
        let resource: ServiceResource = serde_json::from_str(json).unwrap();

        assert!(matches!(
            resource.into_descriptor(&path()),
            Err(ResourceReaderError::MalformedService(_))
        ));
    }

    #[test]
    fn test_unknown_ingress_is_rejected() {
        let json = r#"{"name": "x", "ingress": "INGRESS_TRAFFIC_UNSPECIFIED"}"#;
        let resource: ServiceResource = serde_json::from_str(json).unwrap();

        assert!(matches!(
            resource.into_descriptor(&path()),
            Err(ResourceReaderError::Model(ModelError::UnknownIngress(_)))
        ));
    }

    #[test]
    fn test_truncate_error_body() {
        let long = "e".repeat(MAX_ERROR_BODY_LEN + 10);
        let truncated = truncate_error_body(&long);

        assert!(truncated.ends_with("...[truncated]"));
        assert!(truncated.starts_with(&"e".repeat(MAX_ERROR_BODY_LEN)));
        assert_eq!(truncate_error_body("short"), "short");
    }
}
