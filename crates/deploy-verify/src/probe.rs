//! Multi-stage HTTPS health probe.
//!
//! A probe runs the soft DNS stage once, then polls an attempt made of three
//! stages until it passes or the retry policy gives up:
//!
//! 1. Transport: GET the target URL with a per-request timeout
//! 2. Status: the response must be `200 OK`
//! 3. Body: the trimmed, lowercased body must equal the expected literal
//!
//! Every response also records TLS details (session established, leaf
//! certificate subject, issuer and validity window). These are diagnostics only
//! and never decide pass or fail.

use crate::dns::{self, DnsDiagnostics};
use crate::eventual::{retry_with_timeout, RetryPolicy};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Maximum number of characters of a response body kept for diagnostics.
pub const MAX_BODY_PREVIEW_CHARS: usize = 500;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Health probe construction errors.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Failed to create HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    #[error("Invalid probe URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Why a single probe attempt failed.
#[derive(Debug, Error)]
pub enum ProbeFailure {
    #[error("HTTP request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("expected status 200, got {status}")]
    UnexpectedStatus {
        status: u16,
        diagnostics: ResponseDiagnostics,
    },

    #[error("failed to read response body: {source}")]
    BodyRead {
        #[source]
        source: reqwest::Error,
        diagnostics: ResponseDiagnostics,
    },

    #[error("expected response body '{expected}', got '{actual}'")]
    BodyMismatch {
        expected: String,
        actual: String,
        diagnostics: ResponseDiagnostics,
    },
}

impl ProbeFailure {
    /// Response details captured before the attempt failed, if a response arrived.
    pub fn diagnostics(&self) -> Option<&ResponseDiagnostics> {
        match self {
            ProbeFailure::Transport(_) => None,
            ProbeFailure::UnexpectedStatus { diagnostics, .. }
            | ProbeFailure::BodyRead { diagnostics, .. }
            | ProbeFailure::BodyMismatch { diagnostics, .. } => Some(diagnostics),
        }
    }
}

/// Leaf certificate details presented by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateInfo {
    pub common_name: Option<String>,
    pub issuer_common_name: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
}

impl CertificateInfo {
    /// Parse a DER-encoded X.509 certificate.
    ///
    /// Returns `None` if the bytes are not a certificate.
    pub fn from_der(der: &[u8]) -> Option<Self> {
        let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);
        let issuer_common_name = cert
            .issuer()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);
        let validity = cert.validity();

        Some(Self {
            common_name,
            issuer_common_name,
            not_before: DateTime::from_timestamp(validity.not_before.timestamp(), 0),
            not_after: DateTime::from_timestamp(validity.not_after.timestamp(), 0),
        })
    }
}

/// What one HTTP response looked like.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseDiagnostics {
    pub status_code: Option<u16>,
    pub tls_established: bool,
    pub certificate: Option<CertificateInfo>,
    pub body_preview: Option<String>,
}

/// Final status of a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStatus {
    Success,
    Failed { reason: String },
}

/// Everything learned from one probe invocation.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub attempts: u32,
    pub elapsed: Duration,
    pub status: ProbeStatus,
    pub dns: DnsDiagnostics,
    pub response: ResponseDiagnostics,
}

impl ProbeResult {
    pub fn is_success(&self) -> bool {
        self.status == ProbeStatus::Success
    }
}

/// What to probe and what to expect back.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub url: String,
    pub expected_body: String,
    /// Address the host is expected to resolve to (recorded, never enforced).
    pub expected_ip: Option<IpAddr>,
    pub request_timeout: Duration,
}

impl ProbeTarget {
    pub fn new(url: impl Into<String>, expected_body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            expected_body: expected_body.into(),
            expected_ip: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_expected_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.expected_ip = ip;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Normalize a body for comparison: trim surrounding whitespace, lowercase.
pub fn normalize_body(body: &str) -> String {
    body.trim().to_lowercase()
}

/// Truncate a body to [`MAX_BODY_PREVIEW_CHARS`] characters, marking the cut.
pub fn body_preview(body: &str) -> String {
    let mut chars = body.char_indices();
    match chars.nth(MAX_BODY_PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", body.get(..cut).unwrap_or(body)),
        None => body.to_string(),
    }
}

/// HTTP(S) health probe.
pub struct HealthProbe {
    http_client: Client,
}

impl HealthProbe {
    /// Create a probe with its own HTTP client.
    ///
    /// The client records TLS session details on every response so that
    /// certificate diagnostics are available.
    pub fn new() -> Result<Self, ProbeError> {
        let http_client = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .tls_info(true)
            .build()
            .map_err(ProbeError::ClientBuild)?;

        Ok(Self { http_client })
    }

    /// Get the HTTP client for custom requests.
    pub fn http_client(&self) -> &Client {
        &self.http_client
    }

    /// Run the DNS stage once, then poll [`HealthProbe::check_once`] under `policy`.
    pub async fn probe(
        &self,
        target: &ProbeTarget,
        policy: &RetryPolicy<ProbeFailure>,
    ) -> Result<ProbeResult, ProbeError> {
        let url = Url::parse(&target.url).map_err(|e| ProbeError::InvalidUrl {
            url: target.url.clone(),
            reason: e.to_string(),
        })?;
        let host = url.host_str().ok_or_else(|| ProbeError::InvalidUrl {
            url: target.url.clone(),
            reason: "URL has no host".to_string(),
        })?;

        info!(
            target: "deploy_verify.probe",
            url = %target.url,
            expected_ip = ?target.expected_ip,
            timeout = ?policy.timeout,
            interval = ?policy.interval,
            "Starting health probe"
        );

        let dns = dns::diagnose(host, target.expected_ip).await;

        let result = match retry_with_timeout(policy, || self.check_once(target)).await {
            Ok(attempted) => {
                info!(
                    target: "deploy_verify.probe",
                    url = %target.url,
                    attempts = attempted.attempts,
                    elapsed = ?attempted.elapsed,
                    "Health check succeeded"
                );
                ProbeResult {
                    attempts: attempted.attempts,
                    elapsed: attempted.elapsed,
                    status: ProbeStatus::Success,
                    dns,
                    response: attempted.value,
                }
            }
            Err(e) => {
                warn!(
                    target: "deploy_verify.probe",
                    url = %target.url,
                    attempts = e.attempts(),
                    elapsed = ?e.elapsed(),
                    error = %e.last_error(),
                    "Health check did not succeed"
                );
                ProbeResult {
                    attempts: e.attempts(),
                    elapsed: e.elapsed(),
                    status: ProbeStatus::Failed {
                        reason: e.to_string(),
                    },
                    dns,
                    response: e.last_error().diagnostics().cloned().unwrap_or_default(),
                }
            }
        };

        Ok(result)
    }

    /// One pass through the transport, status and body stages.
    pub async fn check_once(
        &self,
        target: &ProbeTarget,
    ) -> Result<ResponseDiagnostics, ProbeFailure> {
        let response = self
            .http_client
            .get(&target.url)
            .timeout(target.request_timeout)
            .send()
            .await
            .map_err(ProbeFailure::Transport)?;

        let status = response.status();
        let mut diagnostics = ResponseDiagnostics {
            status_code: Some(status.as_u16()),
            ..Default::default()
        };

        if let Some(tls) = response.extensions().get::<reqwest::tls::TlsInfo>() {
            diagnostics.tls_established = true;
            diagnostics.certificate = tls.peer_certificate().and_then(CertificateInfo::from_der);
        }

        info!(
            target: "deploy_verify.probe",
            status = status.as_u16(),
            tls = diagnostics.tls_established,
            certificate_cn = ?diagnostics.certificate.as_ref().and_then(|c| c.common_name.as_deref()),
            issuer = ?diagnostics.certificate.as_ref().and_then(|c| c.issuer_common_name.as_deref()),
            "Received response"
        );

        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            diagnostics.body_preview = Some(body_preview(&body));
            return Err(ProbeFailure::UnexpectedStatus {
                status: status.as_u16(),
                diagnostics,
            });
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(source) => {
                return Err(ProbeFailure::BodyRead {
                    source,
                    diagnostics,
                })
            }
        };
        diagnostics.body_preview = Some(body_preview(&body));

        let actual = normalize_body(&body);
        let expected = normalize_body(&target.expected_body);
        if actual != expected {
            return Err(ProbeFailure::BodyMismatch {
                expected,
                actual,
                diagnostics,
            });
        }

        Ok(diagnostics)
    }

    /// Single GET returning only the status code.
    pub async fn fetch_status(&self, url: &str) -> Result<u16, reqwest::Error> {
        let response = self.http_client.get(url).send().await?;
        Ok(response.status().as_u16())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_body_trims_and_lowercases() {
        assert_eq!(normalize_body(" Bridge Is Ready \n"), "bridge is ready");
        assert_eq!(normalize_body("\tOK\r\n"), "ok");
        assert_eq!(normalize_body(""), "");
    }

    #[test]
    fn test_body_preview_short_body_unchanged() {
        assert_eq!(body_preview("service unavailable"), "service unavailable");
    }

    #[test]
    fn test_body_preview_truncates_long_body() {
        let body = "x".repeat(MAX_BODY_PREVIEW_CHARS + 20);
        let preview = body_preview(&body);

        assert_eq!(preview.len(), MAX_BODY_PREVIEW_CHARS + 3);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn test_body_preview_exact_limit_not_marked() {
        let body = "y".repeat(MAX_BODY_PREVIEW_CHARS);
        assert_eq!(body_preview(&body), body);
    }

    #[test]
    fn test_body_preview_respects_char_boundaries() {
        let body = "é".repeat(MAX_BODY_PREVIEW_CHARS + 1);
        let preview = body_preview(&body);

        assert_eq!(preview.chars().count(), MAX_BODY_PREVIEW_CHARS + 3);
    }

    #[test]
    fn test_certificate_info_rejects_garbage() {
        assert_eq!(CertificateInfo::from_der(b"not a certificate"), None);
    }

    #[test]
    fn test_probe_target_defaults() {
        let target = ProbeTarget::new("https://bridge.example.com/ok", "bridge is ready");

        assert_eq!(target.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(target.expected_ip, None);
    }

    #[tokio::test]
    async fn test_probe_rejects_url_without_host() {
        let probe = HealthProbe::new().unwrap();
        let target = ProbeTarget::new("not a url", "ok");
        let policy = RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(5));

        let err = probe.probe(&target, &policy).await.unwrap_err();
        assert!(matches!(err, ProbeError::InvalidUrl { .. }));
    }
}
