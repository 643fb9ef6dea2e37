// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::NaiveDate;
use dashmap::DashMap;
use motiv8_batch::db::{FirestoreDb, MemoryDb};
use motiv8_batch::error::{AppError, Result, RunError};
use motiv8_batch::models::{User, WorkoutDays};
use motiv8_batch::services::inference::{DetectedFace, GenerationRequest};
use motiv8_batch::services::secrets::SecretError;
use motiv8_batch::services::{
    AuthorizationLatch, FaceExtractor, ImageGenerator, Mailer, MemoryStorage, MotivationEmail,
    PipelineDeps, PipelineFactory, Relauncher, SecretSnapshot, SecretSource, Shutdown,
    UserPipeline,
};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Check if emulator is available via environment variable.
#[allow(dead_code)]
pub fn emulator_available() -> bool {
    std::env::var("FIRESTORE_EMULATOR_HOST").is_ok()
}

/// Skip test with message if emulator not available.
#[macro_export]
macro_rules! require_emulator {
    () => {
        if !crate::common::emulator_available() {
            eprintln!("⚠️  Skipping: FIRESTORE_EMULATOR_HOST not set");
            return;
        }
    };
}

/// Create a test database connection.
#[allow(dead_code)]
pub async fn test_db() -> FirestoreDb {
    FirestoreDb::new("test-project")
        .await
        .expect("Failed to connect to Firestore emulator")
}

/// Raw emulator client for writing documents the typed API cannot.
#[allow(dead_code)]
pub async fn raw_emulator_client() -> firestore::FirestoreDb {
    let token_source = gcloud_sdk::ExternalJwtFunctionSource::new(|| async {
        Ok(gcloud_sdk::Token {
            token_type: "Bearer".to_string(),
            token: gcloud_sdk::SecretValue::new(
                "eyJhbGciOiJub25lIn0.eyJ1aWQiOiJ0ZXN0In0."
                    .to_string()
                    .into(),
            ),
            expiry: chrono::Utc::now() + chrono::Duration::hours(1),
        })
    });

    firestore::FirestoreDb::with_options_token_source(
        firestore::FirestoreDbOptions::new("test-project".to_string()),
        gcloud_sdk::GCP_DEFAULT_SCOPES.clone(),
        gcloud_sdk::TokenSourceType::ExternalSource(Box::new(token_source)),
    )
    .await
    .expect("Failed to connect to Firestore emulator")
}

/// Monday 2 March 2026.
#[allow(dead_code)]
pub fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
}

#[allow(dead_code)]
pub fn test_user(id: &str, workout_days: WorkoutDays, selfie: Option<&str>) -> User {
    User {
        id: id.to_string(),
        email: format!("{}@example.com", id),
        selfie_object_key: selfie.map(str::to_string),
        embedding_object_key: None,
        gender: Some("female".to_string()),
        workout_days,
        mode: Some("toned".to_string()),
        anti_motivation_mode: None,
    }
}

// ─── Fakes ──────────────────────────────────────────────────────

/// One face per image unless overridden by image content.
#[derive(Default)]
pub struct FakeExtractor {
    pub calls: AtomicUsize,
    faces_by_image: DashMap<Vec<u8>, usize>,
    failing: DashMap<Vec<u8>, String>,
}

#[allow(dead_code)]
impl FakeExtractor {
    pub fn set_faces(&self, image: &[u8], faces: usize) {
        self.faces_by_image.insert(image.to_vec(), faces);
    }

    /// Make detection on `image` return an inference error.
    pub fn fail_for(&self, image: &[u8], message: &str) {
        self.failing.insert(image.to_vec(), message.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FaceExtractor for FakeExtractor {
    async fn detect_faces(&self, image: &[u8]) -> Result<Vec<DetectedFace>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.failing.get(image) {
            return Err(AppError::Inference(message.clone()));
        }
        let count = self
            .faces_by_image
            .get(image)
            .map(|c| *c)
            .unwrap_or(1);
        Ok((0..count)
            .map(|i| DetectedFace {
                embedding: vec![0.1 * (i + 1) as f32; 8],
                bbox: [10.0, 10.0, 90.0, 120.0],
            })
            .collect())
    }
}

/// Returns a fixed PNG-ish payload; can panic for a given selfie.
/// Tracks the peak number of overlapping calls.
#[derive(Default)]
pub struct FakeGenerator {
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<GenerationRequest>>,
    panic_on_selfie: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

#[allow(dead_code)]
impl FakeGenerator {
    pub fn panic_for_selfie(&self, selfie: &[u8]) {
        *self.panic_on_selfie.lock().unwrap() = Some(BASE64.encode(selfie));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Hold each call open for `delay` so overlapping calls are observable.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

pub const GENERATED_IMAGE: &[u8] = b"\x89PNG generated";

#[async_trait]
impl ImageGenerator for FakeGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let poisoned = self.panic_on_selfie.lock().unwrap().clone();
        if poisoned.is_some() && poisoned == request.face_image {
            panic!("generator crashed");
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.requests.lock().unwrap().push(request.clone());
        Ok(GENERATED_IMAGE.to_vec())
    }
}

#[derive(Default)]
pub struct FakeMailer {
    pub sent: Mutex<Vec<MotivationEmail>>,
    failing: Mutex<HashSet<String>>,
}

#[allow(dead_code)]
impl FakeMailer {
    pub fn fail_for(&self, email: &str) {
        self.failing.lock().unwrap().insert(email.to_string());
    }

    pub fn recipients(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|e| e.to.clone()).collect()
    }
}

#[async_trait]
impl Mailer for FakeMailer {
    async fn send(&self, email: &MotivationEmail) -> Result<()> {
        if self.failing.lock().unwrap().contains(&email.to) {
            return Err(AppError::Mail("mailbox unavailable".to_string()));
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeLatch {
    pub clears: AtomicUsize,
}

#[allow(dead_code)]
impl FakeLatch {
    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthorizationLatch for FakeLatch {
    async fn clear(&self) -> Result<()> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeShutdown {
    pub scheduled: Mutex<Vec<Duration>>,
}

#[allow(dead_code)]
impl FakeShutdown {
    pub fn scheduled(&self) -> Vec<Duration> {
        self.scheduled.lock().unwrap().clone()
    }
}

#[async_trait]
impl Shutdown for FakeShutdown {
    async fn schedule(&self, delay: Duration) -> Result<()> {
        self.scheduled.lock().unwrap().push(delay);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRelauncher {
    pub entrypoints: Mutex<Vec<PathBuf>>,
}

#[allow(dead_code)]
impl FakeRelauncher {
    pub fn relaunches(&self) -> Vec<PathBuf> {
        self.entrypoints.lock().unwrap().clone()
    }
}

impl Relauncher for FakeRelauncher {
    fn relaunch(&self, entrypoint: &Path) -> Result<()> {
        self.entrypoints.lock().unwrap().push(entrypoint.to_path_buf());
        Ok(())
    }
}

/// Secret source returning a fixed bundle, or failing.
pub struct StaticSecrets {
    bundle: Option<BTreeMap<String, String>>,
    pub fetches: AtomicUsize,
}

#[allow(dead_code)]
impl StaticSecrets {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        Self {
            bundle: Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            bundle: None,
            fetches: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SecretSource for StaticSecrets {
    async fn fetch_bundle(&self) -> std::result::Result<SecretSnapshot, SecretError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match &self.bundle {
            Some(values) => SecretSnapshot::new(values.clone()),
            None => Err(SecretError::Fetch("permission denied".to_string())),
        }
    }
}

/// In-memory collaborators shared between a test and the pipeline.
#[derive(Clone, Default)]
pub struct Harness {
    pub db: MemoryDb,
    pub storage: MemoryStorage,
    pub extractor: Arc<FakeExtractor>,
    pub generator: Arc<FakeGenerator>,
    pub mailer: Arc<FakeMailer>,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deps(&self) -> PipelineDeps {
        PipelineDeps {
            users: Arc::new(self.db.clone()),
            objects: Arc::new(self.storage.clone()),
            extractor: self.extractor.clone(),
            generator: self.generator.clone(),
            mailer: self.mailer.clone(),
        }
    }

    pub fn pipeline(&self) -> UserPipeline {
        self.pipeline_with(1, 1)
    }

    pub fn pipeline_with(
        &self,
        user_concurrency: usize,
        generation_concurrency: usize,
    ) -> UserPipeline {
        UserPipeline::new(self.deps(), user_concurrency, generation_concurrency)
    }

    /// Store a user and their selfie bytes.
    pub fn add_user(&self, user: User, selfie: &[u8]) {
        if let Some(key) = &user.selfie_object_key {
            self.storage.insert(key, selfie.to_vec());
        }
        self.db.put_user(user);
    }
}

/// Pipeline factory over a [`Harness`]; counts builds.
#[derive(Default)]
pub struct HarnessFactory {
    pub harness: Harness,
    pub builds: AtomicUsize,
}

#[allow(dead_code)]
impl HarnessFactory {
    pub fn new(harness: Harness) -> Self {
        Self {
            harness,
            builds: AtomicUsize::new(0),
        }
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PipelineFactory for HarnessFactory {
    async fn build(&self, _secrets: &SecretSnapshot) -> std::result::Result<UserPipeline, RunError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(self.harness.pipeline())
    }
}

/// Build a release archive in memory. Entries under `bin/` are executable.
#[allow(dead_code)]
pub fn release_zip(files: &[(&str, &str)]) -> Vec<u8> {
    let entries: Vec<(&str, &str, u32)> = files
        .iter()
        .map(|(name, data)| {
            let mode = if name.starts_with("bin/") { 0o755 } else { 0o644 };
            (*name, *data, mode)
        })
        .collect();
    release_zip_with_modes(&entries)
}

/// Release archive with explicit unix modes per entry.
#[allow(dead_code)]
pub fn release_zip_with_modes(files: &[(&str, &str, u32)]) -> Vec<u8> {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, data, mode) in files {
        let options = SimpleFileOptions::default().unix_permissions(*mode);
        writer.start_file(*name, options).unwrap();
        writer.write_all(data.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}
