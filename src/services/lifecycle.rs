// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Run envelope for the daily batch instance.
//!
//! The instance boots, runs this once and retires itself:
//! 1. Bring code to the target version; relaunch once if it changed
//! 2. Check the authorization latch; unauthorized boots exit quietly
//! 3. Arm a shutdown watchdog for the whole run budget
//! 4. Materialize secrets, build the pipeline, process users, all under a
//!    timeout
//! 5. Clear the latch after processing (partial failures included)
//! 6. Schedule shutdown after a grace period
//!
//! Fatal errors skip step 5 so the same run can be retried, but still
//! retire an authorized instance.

use crate::config::{Config, RunConfig, RuntimeSettings, RELAUNCH_ENV};
use crate::db::FirestoreDb;
use crate::error::{AppError, Result, RunError};
use crate::services::gate::{AuthorizationLatch, GateDecision, RunGate};
use crate::services::inference::HttpInferenceClient;
use crate::services::mail::HttpMailer;
use crate::services::metadata::MetadataClient;
use crate::services::pipeline::{PipelineDeps, RunSummary, UserPipeline};
use crate::services::secrets::{SecretMaterializer, SecretSnapshot};
use crate::services::storage::GcsStorage;
use crate::services::version::{SyncOutcome, VersionSynchronizer};
use crate::time_utils::run_date;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// Schedules the instance to power off.
#[async_trait]
pub trait Shutdown: Send + Sync {
    /// Power off after `delay`; a later call replaces an earlier schedule.
    async fn schedule(&self, delay: Duration) -> Result<()>;
}

/// `shutdown -h +N` on the host.
#[derive(Debug, Clone)]
pub struct SystemShutdown {
    enabled: bool,
}

impl SystemShutdown {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

/// `shutdown` takes whole minutes; round up so the grace period is honored.
fn shutdown_minutes(delay: Duration) -> u64 {
    delay.as_secs().div_ceil(60)
}

#[async_trait]
impl Shutdown for SystemShutdown {
    async fn schedule(&self, delay: Duration) -> Result<()> {
        let minutes = shutdown_minutes(delay);
        if !self.enabled {
            tracing::info!(minutes, "Shutdown disabled, leaving instance running");
            return Ok(());
        }

        let output = tokio::process::Command::new("shutdown")
            .arg("-h")
            .arg(format!("+{}", minutes))
            .output()
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("spawn shutdown: {}", e)))?;

        if !output.status.success() {
            return Err(AppError::Internal(anyhow::anyhow!(
                "shutdown exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        tracing::info!(minutes, "Instance shutdown scheduled");
        Ok(())
    }
}

/// Restarts the process from freshly swapped code.
pub trait Relauncher: Send + Sync {
    /// Only returns if the relaunch could not happen.
    fn relaunch(&self, entrypoint: &Path) -> Result<()>;
}

/// Replaces the current process image with the new entrypoint, passing the
/// same arguments and marking the environment so a second swap is refused.
#[derive(Debug, Clone, Default)]
pub struct ExecRelauncher;

impl Relauncher for ExecRelauncher {
    fn relaunch(&self, entrypoint: &Path) -> Result<()> {
        use std::os::unix::process::CommandExt;

        tracing::info!(entrypoint = %entrypoint.display(), "Relaunching from updated code");
        let error = std::process::Command::new(entrypoint)
            .args(std::env::args_os().skip(1))
            .env(RELAUNCH_ENV, "1")
            .exec();

        Err(AppError::Internal(anyhow::anyhow!(
            "exec {}: {}",
            entrypoint.display(),
            error
        )))
    }
}

/// Builds the user pipeline once secrets are available.
#[async_trait]
pub trait PipelineFactory: Send + Sync {
    async fn build(&self, secrets: &SecretSnapshot) -> std::result::Result<UserPipeline, RunError>;
}

/// Production wiring: Firestore, Cloud Storage, the inference sidecar and
/// the mail API.
pub struct GcpPipelineFactory {
    config: Config,
    metadata: MetadataClient,
}

impl GcpPipelineFactory {
    pub fn new(config: Config, metadata: MetadataClient) -> Self {
        Self { config, metadata }
    }
}

#[async_trait]
impl PipelineFactory for GcpPipelineFactory {
    async fn build(&self, secrets: &SecretSnapshot) -> std::result::Result<UserPipeline, RunError> {
        let settings = RuntimeSettings::from_snapshot(secrets.values(), &self.config.gcp_project_id)?;
        if settings.mail.is_none() {
            tracing::warn!("Mail API not configured, deliveries will fail");
        }

        let db = FirestoreDb::new(&settings.firestore_project_id).await?;
        let storage = GcsStorage::new(&settings.storage_bucket, self.metadata.clone());
        let inference = Arc::new(HttpInferenceClient::new(&self.config.inference_url));

        tracing::info!(
            firestore_project = %settings.firestore_project_id,
            bucket = %settings.storage_bucket,
            inference_url = %self.config.inference_url,
            "Pipeline collaborators initialized"
        );

        Ok(UserPipeline::new(
            PipelineDeps {
                users: Arc::new(db),
                objects: Arc::new(storage),
                extractor: inference.clone(),
                generator: inference,
                mailer: Arc::new(HttpMailer::new(settings.mail)),
            },
            self.config.user_concurrency,
            self.config.generation_concurrency,
        ))
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(RunSummary),
    /// Not authorized; nothing was done
    Skipped,
    /// Code was swapped and the process replaced (only seen when the
    /// relauncher returns instead of exec'ing, as in tests)
    Relaunched,
    Fatal(RunError),
}

impl RunOutcome {
    /// Process exit status. Partial user failures still exit zero.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Completed(_) | RunOutcome::Skipped | RunOutcome::Relaunched => 0,
            RunOutcome::Fatal(_) => 1,
        }
    }
}

/// External collaborators of the controller.
pub struct Collaborators {
    pub version: VersionSynchronizer,
    pub latch: Arc<dyn AuthorizationLatch>,
    pub secrets: SecretMaterializer,
    pub pipeline: Arc<dyn PipelineFactory>,
    pub shutdown: Arc<dyn Shutdown>,
    pub relauncher: Arc<dyn Relauncher>,
}

pub struct RunLifecycleController {
    run: RunConfig,
    gate: RunGate,
    version: VersionSynchronizer,
    secrets: SecretMaterializer,
    pipeline: Arc<dyn PipelineFactory>,
    shutdown: Arc<dyn Shutdown>,
    relauncher: Arc<dyn Relauncher>,
    max_runtime: Duration,
    grace: Duration,
    utc_offset_minutes: i32,
    run_date: Option<NaiveDate>,
}

impl RunLifecycleController {
    pub fn new(config: &Config, run: RunConfig, parts: Collaborators) -> Self {
        Self {
            gate: RunGate::new(run.clone(), parts.latch),
            run,
            version: parts.version,
            secrets: parts.secrets,
            pipeline: parts.pipeline,
            shutdown: parts.shutdown,
            relauncher: parts.relauncher,
            max_runtime: config.max_runtime(),
            grace: Duration::from_secs(config.shutdown_grace_minutes * 60),
            utc_offset_minutes: config.utc_offset_minutes,
            run_date: None,
        }
    }

    /// Process a fixed date instead of today's.
    pub fn with_run_date(mut self, date: NaiveDate) -> Self {
        self.run_date = Some(date);
        self
    }

    pub fn with_max_runtime(mut self, max_runtime: Duration) -> Self {
        self.max_runtime = max_runtime;
        self
    }

    pub async fn run(&self) -> RunOutcome {
        tracing::info!(
            authorized = self.run.authorized,
            target_version = ?self.run.target_version,
            relaunched = self.run.relaunched,
            "Batch run starting"
        );

        match self
            .version
            .ensure_current_version(self.run.target_version.as_deref())
            .await
        {
            Ok(SyncOutcome::UpToDate { .. }) => {}
            Ok(SyncOutcome::Swapped {
                version,
                entrypoint,
                ..
            }) => {
                if self.run.relaunched {
                    return self.fatal(RunError::RelaunchLoop(version)).await;
                }
                return match self.relauncher.relaunch(&entrypoint) {
                    Ok(()) => RunOutcome::Relaunched,
                    Err(e) => self.fatal(RunError::Relaunch(e.to_string())).await,
                };
            }
            Err(e) => return self.fatal(e.into()).await,
        }

        let scope_filter = match self.gate.authorize() {
            GateDecision::NotAuthorized => return RunOutcome::Skipped,
            GateDecision::Authorized { scope_filter } => scope_filter,
        };

        // Backstop in case the process hangs past its own timeout
        self.schedule_shutdown(self.max_runtime + self.grace, "watchdog")
            .await;

        let date = self
            .run_date
            .unwrap_or_else(|| run_date(Utc::now(), self.utc_offset_minutes));
        let span = tracing::info_span!("run", %date);

        let result = tokio::time::timeout(
            self.max_runtime,
            self.process(date, scope_filter.as_deref()),
        )
        .instrument(span)
        .await;

        let outcome = match result {
            Ok(Ok(summary)) => {
                self.gate.release().await;
                tracing::info!(
                    eligible = summary.eligible,
                    delivered = summary.delivered,
                    failed = summary.failed(),
                    "Batch run complete"
                );
                RunOutcome::Completed(summary)
            }
            Ok(Err(e)) => return self.fatal(e).await,
            Err(_) => return self.fatal(RunError::Timeout(self.max_runtime)).await,
        };

        self.retire().await;
        outcome
    }

    async fn process(
        &self,
        date: NaiveDate,
        scope_filter: Option<&str>,
    ) -> std::result::Result<RunSummary, RunError> {
        let secrets = self.secrets.materialize().await?;
        let pipeline = self.pipeline.build(&secrets).await?;
        pipeline
            .process_users(date, scope_filter)
            .await
            .map_err(RunError::Users)
    }

    async fn fatal(&self, error: RunError) -> RunOutcome {
        tracing::error!(error = %error, "Batch run aborted");
        if self.run.authorized {
            self.retire().await;
        }
        RunOutcome::Fatal(error)
    }

    async fn retire(&self) {
        self.schedule_shutdown(self.grace, "retire").await;
    }

    async fn schedule_shutdown(&self, delay: Duration, reason: &str) {
        if let Err(e) = self.shutdown.schedule(delay).await {
            tracing::error!(reason, error = %e, "Failed to schedule shutdown");
        }
    }
}
