// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! motiv8 daily batch run
//!
//! Started by the instance's boot service. Exits zero unless the run
//! aborted; the instance schedules its own shutdown either way.

use motiv8_batch::{
    config::Config,
    services::{
        secrets::SecretManagerSource, Collaborators, ExecRelauncher, GcpPipelineFactory,
        GcsStorage, InstanceAttributeLatch, MetadataClient, RunLifecycleController,
        SecretMaterializer, SystemShutdown, VersionSynchronizer,
    },
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize structured JSON logging for GCP
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let metadata = MetadataClient::new();
    let run = match metadata.load_run_config().await {
        Ok(run) => run.with_relaunched(config.relaunched),
        Err(e) => {
            tracing::error!(error = %e, "Failed to read run configuration from instance metadata");
            return ExitCode::FAILURE;
        }
    };

    let releases = GcsStorage::new(&config.release_bucket, metadata.clone());
    let version = VersionSynchronizer::new(
        Arc::new(releases),
        config.app_root.clone(),
        config.app_entrypoint.clone(),
        config.preserved_dirs.clone(),
    );

    let secret_source = SecretManagerSource::new(
        &config.gcp_project_id,
        &config.config_secret_name,
        metadata.clone(),
    );
    let secrets = SecretMaterializer::new(Arc::new(secret_source), config.secrets_env_path.clone());

    let controller = RunLifecycleController::new(
        &config,
        run,
        Collaborators {
            version,
            latch: Arc::new(InstanceAttributeLatch::new(metadata.clone())),
            secrets,
            pipeline: Arc::new(GcpPipelineFactory::new(config.clone(), metadata)),
            shutdown: Arc::new(SystemShutdown::new(config.shutdown_on_exit)),
            relauncher: Arc::new(ExecRelauncher),
        },
    );

    let outcome = controller.run().await;
    ExitCode::from(outcome.exit_code())
}

/// Initialize structured JSON logging (GCP-compliant).
fn init_logging() {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("motiv8_batch=debug,info"));

    tracing_subscriber::registry().with(filter).with(format).init();
}
