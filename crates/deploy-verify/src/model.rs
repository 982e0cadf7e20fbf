//! Resource descriptors and expected configuration state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised when parsing model values from their wire form.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("Invalid service path '{0}', expected projects/{{project}}/locations/{{region}}/services/{{name}}")]
    InvalidServicePath(String),

    #[error("Unknown ingress setting '{0}'")]
    UnknownIngress(String),
}

/// Declared reachability scope of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IngressMode {
    /// Reachable from the internet.
    Public,
    /// Reachable only through an internal or cloud load balancer.
    InternalLoadBalancer,
    /// Reachable only from inside the VPC.
    InternalOnly,
}

impl IngressMode {
    /// Cloud Run Admin API v2 enum name.
    pub fn api_name(&self) -> &'static str {
        match self {
            IngressMode::Public => "INGRESS_TRAFFIC_ALL",
            IngressMode::InternalLoadBalancer => "INGRESS_TRAFFIC_INTERNAL_LOAD_BALANCER",
            IngressMode::InternalOnly => "INGRESS_TRAFFIC_INTERNAL_ONLY",
        }
    }
}

impl fmt::Display for IngressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IngressMode::Public => "public",
            IngressMode::InternalLoadBalancer => "internal-load-balancer",
            IngressMode::InternalOnly => "internal-only",
        };
        f.write_str(name)
    }
}

impl FromStr for IngressMode {
    type Err = ModelError;

    /// Accepts both the API enum names and the short display names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INGRESS_TRAFFIC_ALL" | "public" => Ok(IngressMode::Public),
            "INGRESS_TRAFFIC_INTERNAL_LOAD_BALANCER" | "internal-load-balancer" => {
                Ok(IngressMode::InternalLoadBalancer)
            }
            "INGRESS_TRAFFIC_INTERNAL_ONLY" | "internal-only" => Ok(IngressMode::InternalOnly),
            other => Err(ModelError::UnknownIngress(other.to_string())),
        }
    }
}

/// Fully-qualified Cloud Run service name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePath {
    pub project_id: String,
    pub region: String,
    pub service_name: String,
}

impl ServicePath {
    pub fn new(
        project_id: impl Into<String>,
        region: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            region: region.into(),
            service_name: service_name.into(),
        }
    }
}

impl fmt::Display for ServicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/locations/{}/services/{}",
            self.project_id, self.region, self.service_name
        )
    }
}

impl FromStr for ServicePath {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            ["projects", project, "locations", region, "services", name]
                if !project.is_empty() && !region.is_empty() && !name.is_empty() =>
            {
                Ok(ServicePath::new(*project, *region, *name))
            }
            _ => Err(ModelError::InvalidServicePath(s.to_string())),
        }
    }
}

/// Observed configuration of a provisioned service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub project_id: String,
    pub region: String,
    pub service_name: String,
    pub tenant_id: String,
    pub env: BTreeMap<String, String>,
    pub container_port: u16,
    pub limits: BTreeMap<String, String>,
    pub ingress: IngressMode,
}

impl ResourceDescriptor {
    /// The service path this descriptor was read from.
    pub fn service_path(&self) -> ServicePath {
        ServicePath::new(&self.project_id, &self.region, &self.service_name)
    }
}

/// Configuration a provisioned service is expected to have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedState {
    pub env: BTreeMap<String, String>,
    pub container_port: u16,
    pub limits: BTreeMap<String, String>,
    pub ingress: IngressMode,
}
