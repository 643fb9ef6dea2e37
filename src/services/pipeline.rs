// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Per-user pipeline: extraction, generation, delivery.
//!
//! Each eligible user advances from their stored stage:
//!
//! ```text
//! NoSelfie            -> skipped
//! PendingExtraction   -> extract -> Extracted
//! Extracted           -> generate -> Generated(date) -> deliver -> Delivered(date)
//! ```
//!
//! Progress is persisted after every step, so a failed or interrupted run
//! resumes from the last completed stage on the next workout day. An
//! existing artifact for (user, date) short-circuits generation and
//! delivery, which makes re-running a date harmless.
//!
//! Every user runs inside its own failure boundary: errors and panics are
//! recorded in the [`RunSummary`] and never affect other users.

use crate::db::UserStore;
use crate::error::{AppError, Result};
use crate::models::{DailyArtifact, Embedding, User, UserStage};
use crate::services::gate::in_scope;
use crate::services::inference::{
    extract_single_face, FaceExtractor, GenerationRequest, ImageGenerator,
};
use crate::services::mail::{Mailer, MotivationEmail};
use crate::services::prompt::prompt_for;
use crate::services::storage::{embedding_key, generated_key, ObjectStore};
use crate::time_utils::{file_timestamp, format_utc_rfc3339};
use chrono::{Datelike, NaiveDate, Utc};
use futures_util::{stream, FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::Instrument;

/// Pipeline step a user was in when something went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extraction,
    Generation,
    Delivery,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::Generation => "generation",
            Stage::Delivery => "delivery",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserFailure {
    pub user_id: String,
    pub email: String,
    pub stage: Stage,
    pub error: String,
}

/// Outcome of processing all eligible users for one date.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Users whose workout day it is (and who match the scope filter)
    pub eligible: u32,
    pub extracted: u32,
    pub generated: u32,
    pub delivered: u32,
    /// Users whose artifact for the date already existed
    pub skipped_existing: u32,
    pub skipped_no_selfie: u32,
    pub failures: Vec<UserFailure>,
}

impl RunSummary {
    pub fn failed(&self) -> u32 {
        self.failures.len() as u32
    }

    pub fn succeeded(&self) -> u32 {
        self.eligible.saturating_sub(self.failed())
    }

    pub fn is_complete_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn is_complete_failure(&self) -> bool {
        self.succeeded() == 0 && self.failed() > 0
    }

    pub fn is_partial_failure(&self) -> bool {
        self.succeeded() > 0 && self.failed() > 0
    }

    fn record(&mut self, progress: &UserProgress) {
        self.extracted += progress.extracted as u32;
        self.generated += progress.generated as u32;
        self.delivered += progress.delivered as u32;
        self.skipped_existing += progress.skipped_existing as u32;
        self.skipped_no_selfie += progress.skipped_no_selfie as u32;
    }
}

/// What happened to one user; survives a failure part way through.
#[derive(Debug)]
struct UserProgress {
    stage: Stage,
    extracted: bool,
    generated: bool,
    delivered: bool,
    skipped_existing: bool,
    skipped_no_selfie: bool,
}

impl Default for UserProgress {
    fn default() -> Self {
        Self {
            stage: Stage::Extraction,
            extracted: false,
            generated: false,
            delivered: false,
            skipped_existing: false,
            skipped_no_selfie: false,
        }
    }
}

/// Collaborators the pipeline drives.
#[derive(Clone)]
pub struct PipelineDeps {
    pub users: Arc<dyn UserStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub extractor: Arc<dyn FaceExtractor>,
    pub generator: Arc<dyn ImageGenerator>,
    pub mailer: Arc<dyn Mailer>,
}

pub struct UserPipeline {
    deps: PipelineDeps,
    user_concurrency: usize,
    /// Global cap on concurrent generation jobs (GPU memory)
    generation: Arc<Semaphore>,
}

impl UserPipeline {
    pub fn new(deps: PipelineDeps, user_concurrency: usize, generation_concurrency: usize) -> Self {
        Self {
            deps,
            user_concurrency: user_concurrency.max(1),
            generation: Arc::new(Semaphore::new(generation_concurrency.max(1))),
        }
    }

    /// Process every eligible user for `date`.
    ///
    /// Only a failure to list users is returned as an error; everything
    /// per-user ends up in the summary.
    pub async fn process_users(
        &self,
        date: NaiveDate,
        scope_filter: Option<&str>,
    ) -> Result<RunSummary> {
        let weekday = date.weekday();
        let users = self.deps.users.list_users().await?;
        let total = users.len();

        let eligible: Vec<User> = users
            .into_iter()
            .filter(|u| u.workout_days.is_workout_day(weekday) && in_scope(u, scope_filter))
            .collect();

        tracing::info!(
            %date,
            weekday = %weekday,
            total_users = total,
            eligible = eligible.len(),
            scope = ?scope_filter,
            "Processing eligible users"
        );

        let summary = Mutex::new(RunSummary {
            eligible: eligible.len() as u32,
            ..RunSummary::default()
        });

        stream::iter(eligible)
            .for_each_concurrent(self.user_concurrency, |user| {
                let summary = &summary;
                let span = tracing::info_span!("user", user_id = %user.id);
                async move {
                    let mut progress = UserProgress::default();
                    let result = AssertUnwindSafe(self.process_user(&user, date, &mut progress))
                        .catch_unwind()
                        .await;

                    let error = match result {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(e.to_string()),
                        Err(panic) => Some(format!("panic: {}", panic_message(panic.as_ref()))),
                    };

                    let mut summary = summary.lock().await;
                    summary.record(&progress);
                    if let Some(error) = error {
                        tracing::error!(
                            user_id = %user.id,
                            email = %user.email,
                            stage = %progress.stage,
                            error = %error,
                            "User pipeline failed"
                        );
                        summary.failures.push(UserFailure {
                            user_id: user.id.clone(),
                            email: user.email.clone(),
                            stage: progress.stage,
                            error,
                        });
                    }
                }
                .instrument(span)
            })
            .await;

        let summary = summary.into_inner();
        tracing::info!(
            eligible = summary.eligible,
            extracted = summary.extracted,
            generated = summary.generated,
            delivered = summary.delivered,
            skipped_existing = summary.skipped_existing,
            skipped_no_selfie = summary.skipped_no_selfie,
            failed = summary.failed(),
            "User processing complete"
        );

        Ok(summary)
    }

    async fn process_user(
        &self,
        user: &User,
        date: NaiveDate,
        progress: &mut UserProgress,
    ) -> Result<()> {
        progress.stage = Stage::Extraction;
        let (selfie_key, embedding_key) = match user.stage() {
            UserStage::NoSelfie => {
                tracing::info!("No selfie uploaded, skipping");
                progress.skipped_no_selfie = true;
                return Ok(());
            }
            UserStage::PendingExtraction { selfie_key } => {
                let embedding_key = self.extract(user, &selfie_key).await?;
                progress.extracted = true;
                (selfie_key, embedding_key)
            }
            UserStage::Extracted {
                selfie_key,
                embedding_key,
            } => (selfie_key, embedding_key),
        };

        progress.stage = Stage::Generation;
        if self.deps.users.get_artifact(&user.id, date).await?.is_some() {
            tracing::info!(%date, "Image already generated for date, skipping");
            progress.skipped_existing = true;
            return Ok(());
        }

        let Some((artifact, image)) = self.generate(user, &selfie_key, &embedding_key, date).await?
        else {
            progress.skipped_existing = true;
            return Ok(());
        };
        progress.generated = true;

        progress.stage = Stage::Delivery;
        self.deliver(user, artifact, image).await?;
        progress.delivered = true;

        Ok(())
    }

    /// PendingExtraction -> Extracted. Returns the new embedding key.
    async fn extract(&self, user: &User, selfie_key: &str) -> Result<String> {
        let image = self.deps.objects.get(selfie_key).await?;
        let embedding = extract_single_face(self.deps.extractor.as_ref(), &image).await?;

        let key = embedding_key(selfie_key, &file_timestamp(Utc::now()));
        let json = serde_json::to_vec(&embedding)
            .map_err(|e| AppError::InvalidData(format!("embedding serialization: {}", e)))?;
        self.deps.objects.put(&key, json, "application/json").await?;

        if !self
            .deps
            .users
            .set_embedding_key(&user.id, selfie_key, &key)
            .await?
        {
            return Err(AppError::InvalidData(
                "selfie replaced during extraction".to_string(),
            ));
        }

        tracing::info!(
            selfie_key,
            embedding_key = %key,
            dims = embedding.values.len(),
            "Extracted face embedding"
        );
        Ok(key)
    }

    /// Extracted -> Generated(date). `None` if another writer created the
    /// artifact first.
    async fn generate(
        &self,
        user: &User,
        selfie_key: &str,
        embedding_key: &str,
        date: NaiveDate,
    ) -> Result<Option<(DailyArtifact, Vec<u8>)>> {
        let raw = self.deps.objects.get(embedding_key).await?;
        let embedding: Embedding = serde_json::from_slice(&raw)
            .map_err(|e| AppError::InvalidData(format!("embedding {}: {}", embedding_key, e)))?;

        let selfie = match self.deps.objects.get(selfie_key).await {
            Ok(bytes) => Some(bytes),
            Err(AppError::NotFound(_)) => {
                tracing::warn!(selfie_key, "Selfie missing, generating from embedding only");
                None
            }
            Err(e) => return Err(e),
        };

        let prompt = prompt_for(user, date);
        let mut request =
            GenerationRequest::new(prompt.prompt, prompt.negative_prompt, embedding.values);
        if let Some(selfie) = &selfie {
            request = request.with_face_image(selfie);
        }

        let image = {
            let _permit = self
                .generation
                .acquire()
                .await
                .map_err(|e| AppError::Internal(anyhow::anyhow!("generation semaphore: {}", e)))?;
            tracing::info!(mode = ?user.mode(), gender = ?user.gender(), "Generating image");
            self.deps.generator.generate(&request).await?
        };

        let key = generated_key(&user.id, date);
        self.deps.objects.put(&key, image.clone(), "image/png").await?;

        let artifact = DailyArtifact {
            user_id: user.id.clone(),
            date,
            object_key: key,
            generated_at: format_utc_rfc3339(Utc::now()),
            delivered_at: None,
            delivery_error: None,
        };

        if !self.deps.users.insert_artifact(&artifact).await? {
            tracing::warn!(%date, "Artifact created concurrently, not delivering");
            return Ok(None);
        }

        tracing::info!(object_key = %artifact.object_key, size = image.len(), "Generated image");
        Ok(Some((artifact, image)))
    }

    /// Generated(date) -> Delivered(date). The artifact is kept on failure
    /// and never resent.
    async fn deliver(&self, user: &User, mut artifact: DailyArtifact, image: Vec<u8>) -> Result<()> {
        let filename = format!("motivation_{}.png", artifact.date.format("%Y-%m-%d"));
        let email = MotivationEmail::new(&user.email, image, &filename);

        match self.deps.mailer.send(&email).await {
            Ok(()) => {
                artifact.delivered_at = Some(format_utc_rfc3339(Utc::now()));
                if let Err(e) = self.deps.users.update_artifact(&artifact).await {
                    tracing::warn!(error = %e, "Email sent but failed to record delivery");
                }
                Ok(())
            }
            Err(e) => {
                artifact.delivery_error = Some(e.to_string());
                if let Err(update) = self.deps.users.update_artifact(&artifact).await {
                    tracing::warn!(error = %update, "Failed to record delivery error");
                }
                Err(e)
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
