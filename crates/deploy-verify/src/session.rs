//! One provision → validate → probe → teardown run.
//!
//! [`ValidationSession`] exposes each lifecycle step as a method returning an
//! explicit value, and [`ValidationSession::run`] composes them. Checks after
//! provisioning are independent: a failed check is recorded and the next one
//! still runs. Teardown always runs and never changes the verdict.

use crate::config::Config;
use crate::dns::{self, DnsError};
use crate::errors::{CheckFailure, SessionError};
use crate::eventual::{retry_with_timeout, ConsistencyCategory, RetryPolicy};
use crate::fixtures::cloud_run::ResourceReader;
use crate::fixtures::provisioner::{ProvisionVars, Provisioner};
use crate::model::{ExpectedState, IngressMode, ServicePath};
use crate::probe::{
    HealthProbe, ProbeFailure, ProbeResult, ProbeStatus, ProbeTarget, ResponseDiagnostics,
    DEFAULT_REQUEST_TIMEOUT,
};
use crate::teardown::{RemediationContext, TeardownOrchestrator, TeardownPolicy, TeardownReport};
use crate::validator;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Path of the service readiness endpoint.
pub const HEALTH_PATH: &str = "/ok";

/// Body served by a ready service.
pub const EXPECTED_HEALTH_BODY: &str = "bridge is ready";

/// Output holding the external load balancer address.
pub const OUTPUT_LOAD_BALANCER_IP: &str = "bridge_load_balancer_ip";

/// Outputs logged at the end of a run.
pub const LOGGED_OUTPUTS: [&str; 6] = [
    "bridge_service_url",
    "bridge_service_name",
    OUTPUT_LOAD_BALANCER_IP,
    "cloud_sql_connection_name",
    "cloud_sql_private_ip",
    "database_name",
];

// Deployed service settings
const FETCH_INTERVAL: &str = "1h";
const FETCH_TIMEOUT: &str = "10s";
const CONTAINER_PORT: u16 = 8080;
const CPU_LIMIT: &str = "1";
const MEMORY_LIMIT: &str = "512Mi";
const MIN_INSTANCES: u32 = 0;
const MAX_INSTANCES: u32 = 10;
const DATABASE_NAME: &str = "testdb";
const DATABASE_USER: &str = "testuser";

/// `*` admits every source address through the edge security policy.
const ALLOW_ALL_SOURCES: &str = "*";

/// Named checks reported by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckName {
    ServiceConfiguration,
    HttpsHealth,
    DnsLoadBalancer,
    Outputs,
}

impl fmt::Display for CheckName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckName::ServiceConfiguration => "service-configuration",
            CheckName::HttpsHealth => "https-health-check",
            CheckName::DnsLoadBalancer => "dns-load-balancer",
            CheckName::Outputs => "outputs",
        };
        f.write_str(name)
    }
}

/// Result of one named check.
#[derive(Debug)]
pub enum CheckOutcome {
    Passed,
    Failed(CheckFailure),
    Skipped(String),
}

impl CheckOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, CheckOutcome::Failed(_))
    }
}

/// HTTPS health check outcome plus the probe's diagnostics, when it ran.
#[derive(Debug)]
pub struct HealthCheck {
    pub outcome: CheckOutcome,
    pub result: Option<ProbeResult>,
}

/// How the HTTPS health check reaches the service.
#[derive(Debug, Clone)]
pub struct HealthCheckPlan {
    pub url: String,
    pub expected_body: String,
    pub request_timeout: Duration,
    pub policy: RetryPolicy<ProbeFailure>,
}

/// How the DNS/load-balancer check runs.
#[derive(Debug, Clone)]
pub struct DnsCheckPlan {
    /// Hostname that must resolve to the load balancer address.
    pub host: String,
    /// URL requested once DNS converges, to confirm the edge policy admits us.
    pub edge_url: String,
    pub policy: RetryPolicy<DnsError>,
}

/// Everything a session needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub service_path: ServicePath,
    pub provision_vars: ProvisionVars,
    pub expected: ExpectedState,
    /// `None` skips the HTTPS health check.
    pub health: Option<HealthCheckPlan>,
    /// `None` skips the DNS/load-balancer check.
    pub dns: Option<DnsCheckPlan>,
    pub teardown_policy: TeardownPolicy,
    pub remediation: RemediationContext,
}

impl SessionPlan {
    /// Build the plan for the bridge deployment described by `config`.
    pub fn from_config(config: &Config) -> Self {
        let service_name = config.service_name();
        let health_url = config
            .domain_name
            .as_ref()
            .map(|domain| format!("https://{domain}{HEALTH_PATH}"));

        let provision_vars = ProvisionVars {
            project_id: config.project_id.clone(),
            region: config.region.clone(),
            service_name: service_name.clone(),
            tenant_id: config.tenant_id.clone(),
            fetch_interval: FETCH_INTERVAL.to_string(),
            fetch_timeout: FETCH_TIMEOUT.to_string(),
            port: CONTAINER_PORT,
            cpu: CPU_LIMIT.to_string(),
            memory: MEMORY_LIMIT.to_string(),
            min_instances: MIN_INSTANCES,
            max_instances: MAX_INSTANCES,
            domain_name: config.domain_name.clone().unwrap_or_default(),
            dns_zone_name: config.dns_zone_name.clone().unwrap_or_default(),
            allowed_ip_ranges: vec![ALLOW_ALL_SOURCES.to_string()],
            database_name: DATABASE_NAME.to_string(),
            database_user: DATABASE_USER.to_string(),
        };

        let expected = ExpectedState {
            env: BTreeMap::from([
                ("FETCH_INTERVAL".to_string(), FETCH_INTERVAL.to_string()),
                ("FETCH_TIMEOUT".to_string(), FETCH_TIMEOUT.to_string()),
                ("TENANT_ID".to_string(), config.tenant_id.clone()),
            ]),
            container_port: CONTAINER_PORT,
            limits: BTreeMap::from([
                ("cpu".to_string(), CPU_LIMIT.to_string()),
                ("memory".to_string(), MEMORY_LIMIT.to_string()),
            ]),
            ingress: IngressMode::InternalLoadBalancer,
        };

        let health = health_url.clone().map(|url| HealthCheckPlan {
            url,
            expected_body: EXPECTED_HEALTH_BODY.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            policy: ConsistencyCategory::CertificateProvisioning.policy(),
        });

        let dns = match (&config.domain_name, &config.dns_zone_name, health_url) {
            (Some(domain), Some(_), Some(edge_url)) => Some(DnsCheckPlan {
                host: domain.clone(),
                edge_url,
                policy: ConsistencyCategory::DnsPropagation.policy(),
            }),
            _ => None,
        };

        Self {
            service_path: config.service_path(),
            provision_vars,
            expected,
            health,
            dns,
            teardown_policy: TeardownPolicy::default(),
            remediation: RemediationContext {
                project_id: config.project_id.clone(),
                service_name,
                module_dir: config.terraform_dir.display().to_string(),
            },
        }
    }
}

/// Outcome of a whole session.
#[derive(Debug)]
pub struct SessionReport {
    /// Set when provisioning failed and no check ran.
    pub setup_error: Option<SessionError>,
    pub checks: Vec<(CheckName, CheckOutcome)>,
    pub health: Option<ProbeResult>,
    pub teardown: TeardownReport,
}

impl SessionReport {
    /// True when provisioning succeeded and no check failed. Teardown is ignored.
    pub fn passed(&self) -> bool {
        self.setup_error.is_none() && !self.checks.iter().any(|(_, outcome)| outcome.is_failed())
    }

    pub fn outcome(&self, name: CheckName) -> Option<&CheckOutcome> {
        self.checks
            .iter()
            .find(|(check, _)| *check == name)
            .map(|(_, outcome)| outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = (CheckName, &CheckFailure)> {
        self.checks.iter().filter_map(|(name, outcome)| match outcome {
            CheckOutcome::Failed(failure) => Some((*name, failure)),
            _ => None,
        })
    }
}

/// Verification run over one provisioned service instance.
pub struct ValidationSession {
    plan: SessionPlan,
    provisioner: Arc<dyn Provisioner>,
    reader: Arc<dyn ResourceReader>,
    probe: HealthProbe,
    teardown: TeardownOrchestrator,
}

impl ValidationSession {
    pub fn new(
        plan: SessionPlan,
        provisioner: Arc<dyn Provisioner>,
        reader: Arc<dyn ResourceReader>,
        probe: HealthProbe,
    ) -> Self {
        let teardown = TeardownOrchestrator::new(plan.remediation.clone())
            .with_policy(plan.teardown_policy);

        Self {
            plan,
            provisioner,
            reader,
            probe,
            teardown,
        }
    }

    pub fn plan(&self) -> &SessionPlan {
        &self.plan
    }

    /// Initialize the provisioner and create every resource.
    pub async fn setup(&self) -> Result<(), SessionError> {
        info!(
            target: "deploy_verify.session",
            service = %self.plan.service_path,
            "Provisioning service"
        );

        self.provisioner
            .init()
            .await
            .map_err(SessionError::Provisioning)?;
        self.provisioner
            .apply(&self.plan.provision_vars)
            .await
            .map_err(SessionError::Provisioning)?;

        info!(target: "deploy_verify.session", "Provisioning completed");
        Ok(())
    }

    /// Read the deployed service once and compare it with the expected state.
    pub async fn validate_config(&self) -> CheckOutcome {
        let actual = match self.reader.get_service(&self.plan.service_path).await {
            Ok(descriptor) => descriptor,
            Err(e) => return CheckOutcome::Failed(CheckFailure::ResourceRead(e)),
        };

        let report = validator::validate(&actual, &self.plan.expected);
        if report.is_empty() {
            info!(
                target: "deploy_verify.session",
                service = %actual.service_name,
                ingress = %actual.ingress,
                "Service configuration matches"
            );
            return CheckOutcome::Passed;
        }

        for mismatch in report.entries() {
            warn!(
                target: "deploy_verify.session",
                field = %mismatch.field,
                expected = %mismatch.expected,
                actual = %mismatch.actual,
                "Configuration mismatch"
            );
        }
        CheckOutcome::Failed(CheckFailure::ValidationMismatch(report))
    }

    /// Load balancer address from the provisioner outputs.
    async fn load_balancer_ip(&self) -> Result<IpAddr, String> {
        let raw = self
            .provisioner
            .output(OUTPUT_LOAD_BALANCER_IP)
            .await
            .map_err(|e| e.to_string())?;
        raw.parse::<IpAddr>()
            .map_err(|e| format!("{OUTPUT_LOAD_BALANCER_IP} is not an IP address ('{raw}'): {e}"))
    }

    /// Poll the HTTPS health endpoint until it serves the ready body.
    pub async fn probe_health(&self) -> HealthCheck {
        let Some(plan) = &self.plan.health else {
            return HealthCheck {
                outcome: CheckOutcome::Skipped("no domain configured".to_string()),
                result: None,
            };
        };

        // Only feeds DNS diagnostics; a missing address does not fail the probe
        let expected_ip = match self.load_balancer_ip().await {
            Ok(ip) => Some(ip),
            Err(reason) => {
                warn!(target: "deploy_verify.session", reason = %reason, "Load balancer IP unavailable for DNS diagnostics");
                None
            }
        };

        let target = ProbeTarget::new(&plan.url, &plan.expected_body)
            .with_expected_ip(expected_ip)
            .with_request_timeout(plan.request_timeout);

        match self.probe.probe(&target, &plan.policy).await {
            Ok(result) if result.is_success() => {
                let outcome = match require_tls(&result.response) {
                    Ok(()) => CheckOutcome::Passed,
                    Err(failure) => {
                        warn!(
                            target: "deploy_verify.session",
                            url = %plan.url,
                            tls_established = result.response.tls_established,
                            "Health body matched but the response carried no TLS certificate"
                        );
                        CheckOutcome::Failed(failure)
                    }
                };
                HealthCheck {
                    outcome,
                    result: Some(result),
                }
            }
            Ok(result) => {
                let reason = match &result.status {
                    ProbeStatus::Failed { reason } => reason.clone(),
                    ProbeStatus::Success => String::new(),
                };
                HealthCheck {
                    outcome: CheckOutcome::Failed(CheckFailure::ProbeTimeout {
                        attempts: result.attempts,
                        elapsed: result.elapsed,
                        reason,
                    }),
                    result: Some(result),
                }
            }
            Err(e) => HealthCheck {
                outcome: CheckOutcome::Failed(CheckFailure::Probe(e)),
                result: None,
            },
        }
    }

    /// Wait for the domain to resolve to the load balancer, then confirm the
    /// edge security policy admits this client.
    pub async fn check_dns(&self) -> CheckOutcome {
        let Some(plan) = &self.plan.dns else {
            return CheckOutcome::Skipped("domain or DNS zone not configured".to_string());
        };

        let lb_ip = match self.load_balancer_ip().await {
            Ok(ip) => ip,
            Err(reason) => {
                return CheckOutcome::Failed(CheckFailure::MissingLoadBalancerIp(reason));
            }
        };

        info!(
            target: "deploy_verify.session",
            host = %plan.host,
            expected_ip = %lb_ip,
            timeout = ?plan.policy.timeout,
            interval = ?plan.policy.interval,
            "Waiting for DNS propagation"
        );

        match retry_with_timeout(&plan.policy, || dns::expect_resolves_to(&plan.host, lb_ip)).await
        {
            Ok(attempted) => info!(
                target: "deploy_verify.session",
                host = %plan.host,
                resolved = ?attempted.value,
                attempts = attempted.attempts,
                "DNS resolution verified"
            ),
            Err(e) => {
                return CheckOutcome::Failed(CheckFailure::DnsTimeout {
                    attempts: e.attempts(),
                    source: e.into_last_error(),
                });
            }
        }

        match self.probe.fetch_status(&plan.edge_url).await {
            Ok(200) => {
                info!(target: "deploy_verify.session", url = %plan.edge_url, "Edge access policy admitted request");
                CheckOutcome::Passed
            }
            Ok(status) => CheckOutcome::Failed(CheckFailure::EdgeAccessDenied { status }),
            Err(e) => {
                // Runner may sit outside the allow list
                warn!(
                    target: "deploy_verify.session",
                    url = %plan.edge_url,
                    error = %e,
                    "Edge access policy cannot be verified from this host"
                );
                CheckOutcome::Passed
            }
        }
    }

    /// Log every known provisioner output; unreadable outputs are skipped.
    pub async fn log_outputs(&self) -> CheckOutcome {
        let mut readable = 0usize;

        for key in LOGGED_OUTPUTS {
            match self.provisioner.output(key).await {
                Ok(value) => {
                    readable += 1;
                    info!(target: "deploy_verify.session", output = key, value = %value, "Provisioner output");
                }
                Err(e) => warn!(
                    target: "deploy_verify.session",
                    output = key,
                    error = %e,
                    "Provisioner output unavailable"
                ),
            }
        }

        if readable == 0 {
            CheckOutcome::Skipped("no outputs readable".to_string())
        } else {
            CheckOutcome::Passed
        }
    }

    /// Destroy every resource; never fails.
    pub async fn teardown(&self) -> TeardownReport {
        self.teardown.run(self.provisioner.as_ref()).await
    }

    /// Run every step in order. Teardown runs even when provisioning fails.
    pub async fn run(&self) -> SessionReport {
        let mut checks = Vec::new();
        let mut health = None;

        let setup_error = match self.setup().await {
            Ok(()) => {
                let outcome = self.validate_config().await;
                log_outcome(CheckName::ServiceConfiguration, &outcome);
                checks.push((CheckName::ServiceConfiguration, outcome));

                let health_check = self.probe_health().await;
                log_outcome(CheckName::HttpsHealth, &health_check.outcome);
                checks.push((CheckName::HttpsHealth, health_check.outcome));
                health = health_check.result;

                let outcome = self.check_dns().await;
                log_outcome(CheckName::DnsLoadBalancer, &outcome);
                checks.push((CheckName::DnsLoadBalancer, outcome));

                let outcome = self.log_outputs().await;
                log_outcome(CheckName::Outputs, &outcome);
                checks.push((CheckName::Outputs, outcome));

                None
            }
            Err(e) => {
                error!(target: "deploy_verify.session", error = %e, "Provisioning failed, skipping checks");
                Some(e)
            }
        };

        let teardown = self.teardown().await;

        SessionReport {
            setup_error,
            checks,
            health,
            teardown,
        }
    }
}

/// A matching body only counts when it came over TLS with a peer certificate.
fn require_tls(response: &ResponseDiagnostics) -> Result<(), CheckFailure> {
    if response.tls_established && response.certificate.is_some() {
        Ok(())
    } else {
        Err(CheckFailure::TlsNotEstablished)
    }
}

fn log_outcome(name: CheckName, outcome: &CheckOutcome) {
    match outcome {
        CheckOutcome::Passed => info!(target: "deploy_verify.session", check = %name, "PASS"),
        CheckOutcome::Failed(failure) => {
            error!(target: "deploy_verify.session", check = %name, error = %failure, "FAIL");
        }
        CheckOutcome::Skipped(reason) => {
            info!(target: "deploy_verify.session", check = %name, reason = %reason, "SKIP");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::probe::CertificateInfo;
    use std::collections::HashMap;

    fn config(domain: Option<&str>, zone: Option<&str>) -> Config {
        let mut vars = HashMap::from([
            ("TEST_GCP_PROJECT_ID".to_string(), "bridge-ci".to_string()),
            ("TEST_TENANT_ID".to_string(), "tenant-1".to_string()),
            ("GOOGLE_OAUTH_ACCESS_TOKEN".to_string(), "token".to_string()),
            ("TEST_RUN_ID".to_string(), "abc123".to_string()),
        ]);
        if let Some(domain) = domain {
            vars.insert("TEST_DOMAIN_NAME".to_string(), domain.to_string());
        }
        if let Some(zone) = zone {
            vars.insert("TEST_DNS_ZONE_NAME".to_string(), zone.to_string());
        }
        Config::from_vars(&vars).unwrap()
    }

    #[test]
    fn test_plan_from_config_without_domain() {
        let plan = SessionPlan::from_config(&config(None, None));

        assert_eq!(plan.provision_vars.service_name, "bridge-test-abc123");
        assert_eq!(plan.provision_vars.domain_name, "");
        assert_eq!(plan.provision_vars.allowed_ip_ranges, vec!["*".to_string()]);
        assert_eq!(plan.expected.env.get("TENANT_ID").unwrap(), "tenant-1");
        assert_eq!(plan.expected.limits.get("memory").unwrap(), "512Mi");
        assert_eq!(plan.expected.ingress, IngressMode::InternalLoadBalancer);
        assert!(plan.health.is_none());
        assert!(plan.dns.is_none());
        assert_eq!(plan.remediation.service_name, "bridge-test-abc123");
    }

    #[test]
    fn test_plan_domain_without_zone_enables_only_health() {
        let plan = SessionPlan::from_config(&config(Some("bridge.example.com"), None));

        let health = plan.health.unwrap();
        assert_eq!(health.url, "https://bridge.example.com/ok");
        assert_eq!(health.expected_body, EXPECTED_HEALTH_BODY);
        assert_eq!(health.policy.timeout, Duration::from_secs(300));
        assert_eq!(health.policy.interval, Duration::from_secs(30));
        assert!(plan.dns.is_none());
    }

    #[test]
    fn test_plan_domain_and_zone_enable_dns() {
        let plan = SessionPlan::from_config(&config(Some("bridge.example.com"), Some("zone")));

        let dns = plan.dns.unwrap();
        assert_eq!(dns.host, "bridge.example.com");
        assert_eq!(dns.edge_url, "https://bridge.example.com/ok");
        assert_eq!(dns.policy.interval, Duration::from_secs(10));
        assert_eq!(plan.provision_vars.dns_zone_name, "zone");
    }

    #[test]
    fn test_require_tls_needs_handshake_and_certificate() {
        let plain_http = ResponseDiagnostics {
            status_code: Some(200),
            body_preview: Some(EXPECTED_HEALTH_BODY.to_string()),
            ..ResponseDiagnostics::default()
        };
        assert!(matches!(
            require_tls(&plain_http),
            Err(CheckFailure::TlsNotEstablished)
        ));

        let handshake_without_certificate = ResponseDiagnostics {
            tls_established: true,
            ..plain_http.clone()
        };
        assert!(matches!(
            require_tls(&handshake_without_certificate),
            Err(CheckFailure::TlsNotEstablished)
        ));

        let https = ResponseDiagnostics {
            tls_established: true,
            certificate: Some(CertificateInfo {
                common_name: Some("bridge.example.com".to_string()),
                ..CertificateInfo::default()
            }),
            ..plain_http
        };
        assert!(require_tls(&https).is_ok());
    }

    #[test]
    fn test_check_name_display() {
        assert_eq!(CheckName::ServiceConfiguration.to_string(), "service-configuration");
        assert_eq!(CheckName::DnsLoadBalancer.to_string(), "dns-load-balancer");
    }
}
