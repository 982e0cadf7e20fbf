//! Deployment Verification Suite
//!
//! This crate validates that an asynchronously provisioned Cloud Run service
//! reaches its declared target state, then tears its resources down again.
//! DNS propagation, certificate issuance and service readiness all converge
//! eventually, so every remote condition is polled with a bounded retry rather
//! than checked once.
//!
//! # Components
//!
//! - [`eventual`]: bounded-retry scheduler with a fixed interval and deadline
//! - [`classifier`]: transient-vs-fatal error classification
//! - [`dns`] and [`probe`]: DNS → TLS/HTTP → body health probe with diagnostics
//! - [`validator`]: actual-vs-expected configuration comparison
//! - [`teardown`]: best-effort destroy with escalating backoff
//! - [`session`]: one provision → validate → probe → teardown run
//! - [`fixtures`]: provisioner and resource reader collaborators
//!
//! # Prerequisites
//!
//! 1. `terraform` in PATH and the module directory in `TEST_TERRAFORM_DIR`
//! 2. `TEST_GCP_PROJECT_ID`, `TEST_TENANT_ID` and `GOOGLE_OAUTH_ACCESS_TOKEN` set
//! 3. Optional `TEST_DOMAIN_NAME` / `TEST_DNS_ZONE_NAME` to enable HTTPS and DNS checks
//!
//! # Usage
//!
//! ```bash
//! # Hermetic tests only
//! cargo test -p deploy-verify
//!
//! # Full run against a real project
//! cargo run -p deploy-verify
//!
//! # Same run as a test (provisions real resources)
//! cargo test -p deploy-verify --features live
//! ```

pub mod classifier;
pub mod config;
pub mod dns;
pub mod errors;
pub mod eventual;
pub mod fixtures;
pub mod model;
pub mod probe;
pub mod session;
pub mod teardown;
pub mod validator;
