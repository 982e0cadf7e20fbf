//! deploy-verify
//!
//! Provisions the bridge Cloud Run deployment, verifies it converges to the
//! declared state, and tears it down again. Exits non-zero when provisioning
//! or any check fails; teardown problems are reported but never fail the run.

use common::config::{ObservabilityConfig, DEFAULT_LOG_FILTER};
use deploy_verify::config::Config;
use deploy_verify::errors::SessionError;
use deploy_verify::fixtures::{CloudRunClient, TerraformProvisioner};
use deploy_verify::probe::HealthProbe;
use deploy_verify::session::{SessionPlan, ValidationSession};
use std::env;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(observability: &ObservabilityConfig) {
    let filter = EnvFilter::try_new(&observability.log_level)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = observability.json_logs;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logging comes up before the rest of the configuration so load errors are visible
    init_tracing(&ObservabilityConfig::from_vars(&env::vars().collect()));

    info!("Starting deploy-verify");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        SessionError::from(e)
    })?;

    info!(
        project_id = %config.project_id,
        region = %config.region,
        run_id = %config.run_id,
        service_name = %config.service_name(),
        https_check = config.domain_name.is_some(),
        dns_check = config.domain_name.is_some() && config.dns_zone_name.is_some(),
        "Configuration loaded successfully"
    );

    let provisioner = TerraformProvisioner::new(&config.terraform_dir, &config.run_id)
        .map_err(|e| SessionError::ClientSetup(e.to_string()))?;
    let reader = CloudRunClient::new(&config.cloud_run_api_url, config.access_token.clone())
        .map_err(|e| SessionError::ClientSetup(e.to_string()))?;
    let probe = HealthProbe::new().map_err(|e| SessionError::ClientSetup(e.to_string()))?;

    let session = ValidationSession::new(
        SessionPlan::from_config(&config),
        Arc::new(provisioner),
        Arc::new(reader),
        probe,
    );

    let report = session.run().await;

    if !report.teardown.succeeded() {
        warn!(
            attempts = report.teardown.attempts.len(),
            state = ?report.teardown.state,
            "Teardown did not complete; see remediation guidance above"
        );
    }

    if let Some(e) = &report.setup_error {
        error!("Verification aborted: {}", e);
        return Err(format!("verification aborted: {e}").into());
    }

    let failed: Vec<String> = report
        .failures()
        .map(|(name, failure)| format!("{name}: {failure}"))
        .collect();

    if !failed.is_empty() {
        error!(failed_checks = failed.len(), "Verification failed");
        return Err(failed.join("\n").into());
    }

    info!(run_id = %config.run_id, "Verification passed");
    Ok(())
}
