//! Session-level error types.
//!
//! [`SessionError`] aborts a run before any check executes. [`CheckFailure`]
//! fails one named check and the session carries on with the next.

use crate::config::ConfigError;
use crate::dns::DnsError;
use crate::fixtures::cloud_run::ResourceReaderError;
use crate::fixtures::provisioner::ProvisionerError;
use crate::probe::ProbeError;
use crate::validator::MismatchReport;
use std::time::Duration;
use thiserror::Error;

/// Errors that stop a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Resources may be partially created; teardown still runs.
    #[error("Provisioning failed: {0}")]
    Provisioning(#[source] ProvisionerError),

    #[error("Failed to initialize client: {0}")]
    ClientSetup(String),
}

/// Why a single check failed.
#[derive(Debug, Error)]
pub enum CheckFailure {
    #[error("Configuration mismatch: {0}")]
    ValidationMismatch(MismatchReport),

    #[error("Failed to read service: {0}")]
    ResourceRead(#[from] ResourceReaderError),

    #[error("Health check did not pass after {attempts} attempts in {elapsed:?}: {reason}")]
    ProbeTimeout {
        attempts: u32,
        elapsed: Duration,
        reason: String,
    },

    #[error("Health probe could not start: {0}")]
    Probe(#[from] ProbeError),

    #[error("DNS did not converge after {attempts} attempts: {source}")]
    DnsTimeout {
        attempts: u32,
        #[source]
        source: DnsError,
    },

    #[error("Load balancer IP unavailable: {0}")]
    MissingLoadBalancerIp(String),

    #[error("Edge access policy rejected the request with status {status}")]
    EdgeAccessDenied { status: u16 },

    #[error("Health endpoint answered without TLS and a peer certificate")]
    TlsNotEstablished,
}
