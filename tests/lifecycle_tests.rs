// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Run lifecycle tests: gate, secrets, relaunch, fatal handling, shutdown.

use async_trait::async_trait;
use chrono::Weekday;
use motiv8_batch::config::{Config, RunConfig};
use motiv8_batch::error::RunError;
use motiv8_batch::models::WorkoutDays;
use motiv8_batch::services::storage::release_key;
use motiv8_batch::services::{
    Collaborators, MemoryStorage, PipelineFactory, RunLifecycleController, RunOutcome,
    SecretMaterializer, SecretSnapshot, UserPipeline, VersionSynchronizer,
};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

mod common;
use common::{
    monday, release_zip, test_user, FakeLatch, FakeRelauncher, FakeShutdown, Harness,
    HarnessFactory, StaticSecrets,
};

const WATCHDOG: Duration = Duration::from_secs((120 + 5) * 60);
const GRACE: Duration = Duration::from_secs(5 * 60);

struct Fixture {
    _dir: TempDir,
    config: Config,
    releases: MemoryStorage,
    harness: Harness,
    factory: Arc<HarnessFactory>,
    secrets: Arc<StaticSecrets>,
    latch: Arc<FakeLatch>,
    shutdown: Arc<FakeShutdown>,
    relauncher: Arc<FakeRelauncher>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_secrets(StaticSecrets::new(&[("STORAGE_BUCKET", "motiv8-data")]))
    }

    fn with_secrets(secrets: StaticSecrets) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::test_default();
        config.app_root = dir.path().join("app");
        config.secrets_env_path = dir.path().join("runtime.env");
        fs::create_dir_all(config.app_root.join("bin")).unwrap();
        fs::write(config.app_root.join(".release-version"), "v1\n").unwrap();

        let harness = Harness::new();
        harness.add_user(
            test_user("user-a", WorkoutDays::only(Weekday::Mon), Some("selfies/a.jpg")),
            b"selfie-a",
        );

        Self {
            _dir: dir,
            config,
            releases: MemoryStorage::new(),
            factory: Arc::new(HarnessFactory::new(harness.clone())),
            harness,
            secrets: Arc::new(secrets),
            latch: Arc::new(FakeLatch::default()),
            shutdown: Arc::new(FakeShutdown::default()),
            relauncher: Arc::new(FakeRelauncher::default()),
        }
    }

    fn controller(&self, run: RunConfig) -> RunLifecycleController {
        self.controller_with_factory(run, self.factory.clone())
    }

    fn controller_with_factory(
        &self,
        run: RunConfig,
        factory: Arc<dyn PipelineFactory>,
    ) -> RunLifecycleController {
        let version = VersionSynchronizer::new(
            Arc::new(self.releases.clone()),
            self.config.app_root.clone(),
            self.config.app_entrypoint.clone(),
            self.config.preserved_dirs.clone(),
        );
        RunLifecycleController::new(
            &self.config,
            run,
            Collaborators {
                version,
                latch: self.latch.clone(),
                secrets: SecretMaterializer::new(
                    self.secrets.clone(),
                    self.config.secrets_env_path.clone(),
                ),
                pipeline: factory,
                shutdown: self.shutdown.clone(),
                relauncher: self.relauncher.clone(),
            },
        )
        .with_run_date(monday())
    }

    fn secret_fetches(&self) -> usize {
        self.secrets
            .fetches
            .load(std::sync::atomic::Ordering::SeqCst)
    }
}

fn authorized() -> RunConfig {
    RunConfig {
        authorized: true,
        ..RunConfig::default()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// GATE
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_authorized_run_completes_and_retires() {
    let fx = Fixture::new();

    let outcome = fx.controller(authorized()).run().await;

    let RunOutcome::Completed(summary) = &outcome else {
        panic!("expected completed run, got {:?}", outcome);
    };
    assert_eq!(summary.delivered, 1);
    assert_eq!(outcome.exit_code(), 0);

    assert_eq!(fx.latch.clears(), 1);
    assert_eq!(fx.shutdown.scheduled(), vec![WATCHDOG, GRACE]);
    assert_eq!(fx.secret_fetches(), 1);
    assert!(fx.config.secrets_env_path.exists());
    assert!(fx.relauncher.relaunches().is_empty());
}

#[tokio::test]
async fn test_unauthorized_boot_has_no_side_effects() {
    let fx = Fixture::new();

    let outcome = fx.controller(RunConfig::default()).run().await;

    assert!(matches!(outcome, RunOutcome::Skipped));
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(fx.secret_fetches(), 0);
    assert_eq!(fx.factory.builds(), 0);
    assert_eq!(fx.latch.clears(), 0);
    assert!(fx.shutdown.scheduled().is_empty());
    assert!(fx.harness.mailer.recipients().is_empty());
}

#[tokio::test]
async fn test_trigger_is_single_shot() {
    let fx = Fixture::new();

    fx.controller(authorized()).run().await;
    assert_eq!(fx.latch.clears(), 1);

    // Reboot later that day: the cleared attribute reads as unauthorized
    let run = RunConfig {
        authorized: fx.latch.clears() == 0,
        ..RunConfig::default()
    };
    let outcome = fx.controller(run).run().await;

    assert!(matches!(outcome, RunOutcome::Skipped));
    assert_eq!(fx.harness.generator.calls(), 1);
    assert_eq!(fx.harness.mailer.recipients().len(), 1);
}

#[tokio::test]
async fn test_partial_failure_still_clears_latch() {
    let fx = Fixture::new();
    fx.harness.mailer.fail_for("user-a@example.com");

    let outcome = fx.controller(authorized()).run().await;

    let RunOutcome::Completed(summary) = &outcome else {
        panic!("expected completed run, got {:?}", outcome);
    };
    assert_eq!(summary.failed(), 1);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(fx.latch.clears(), 1);
}

// ═══════════════════════════════════════════════════════════════════════════
// FATAL ERRORS
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_secret_failure_is_fatal_and_keeps_latch() {
    let fx = Fixture::with_secrets(StaticSecrets::failing());

    let outcome = fx.controller(authorized()).run().await;

    assert!(matches!(outcome, RunOutcome::Fatal(RunError::Secrets(_))));
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(fx.factory.builds(), 0);
    assert_eq!(fx.latch.clears(), 0);
    assert_eq!(fx.shutdown.scheduled(), vec![WATCHDOG, GRACE]);
    assert!(!fx.config.secrets_env_path.exists());
}

struct SlowFactory;

#[async_trait]
impl PipelineFactory for SlowFactory {
    async fn build(&self, _secrets: &SecretSnapshot) -> Result<UserPipeline, RunError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(RunError::RelaunchLoop("unreachable".to_string()))
    }
}

#[tokio::test]
async fn test_run_timeout_is_fatal() {
    let fx = Fixture::new();

    let outcome = fx
        .controller_with_factory(authorized(), Arc::new(SlowFactory))
        .with_max_runtime(Duration::from_millis(50))
        .run()
        .await;

    assert!(matches!(outcome, RunOutcome::Fatal(RunError::Timeout(_))));
    assert_eq!(fx.latch.clears(), 0);
    assert_eq!(
        fx.shutdown.scheduled(),
        vec![Duration::from_millis(50) + GRACE, GRACE]
    );
}

#[tokio::test]
async fn test_missing_release_is_fatal_before_gate() {
    let fx = Fixture::new();
    let run = RunConfig {
        target_version: Some("v2".to_string()),
        ..authorized()
    };

    let outcome = fx.controller(run).run().await;

    assert!(matches!(outcome, RunOutcome::Fatal(RunError::Version(_))));
    assert_eq!(fx.secret_fetches(), 0);
    assert_eq!(
        fs::read_to_string(fx.config.app_root.join(".release-version")).unwrap(),
        "v1\n"
    );
    // Authorized instance still retires
    assert_eq!(fx.shutdown.scheduled(), vec![GRACE]);
}

// ═══════════════════════════════════════════════════════════════════════════
// RELAUNCH
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_version_swap_relaunches_before_gate() {
    let fx = Fixture::new();
    fx.releases.insert(
        &release_key("v2"),
        release_zip(&[("bin/motiv8-batch", "#!/bin/sh\n")]),
    );
    let run = RunConfig {
        target_version: Some("v2".to_string()),
        ..authorized()
    };

    let outcome = fx.controller(run).run().await;

    assert!(matches!(outcome, RunOutcome::Relaunched));
    assert_eq!(
        fx.relauncher.relaunches(),
        vec![fx.config.app_root.join("bin/motiv8-batch")]
    );
    assert_eq!(
        fs::read_to_string(fx.config.app_root.join(".release-version")).unwrap(),
        "v2\n"
    );
    assert_eq!(fx.secret_fetches(), 0);
    assert_eq!(fx.latch.clears(), 0);
    assert!(fx.shutdown.scheduled().is_empty());
}

#[tokio::test]
async fn test_relaunched_process_runs_on_new_version() {
    let fx = Fixture::new();
    fs::write(fx.config.app_root.join(".release-version"), "v2\n").unwrap();
    let run = RunConfig {
        target_version: Some("v2".to_string()),
        relaunched: true,
        ..authorized()
    };

    let outcome = fx.controller(run).run().await;

    assert!(matches!(outcome, RunOutcome::Completed(_)));
    assert!(fx.relauncher.relaunches().is_empty());
}

#[tokio::test]
async fn test_second_swap_after_relaunch_is_refused() {
    let fx = Fixture::new();
    fx.releases.insert(
        &release_key("v3"),
        release_zip(&[("bin/motiv8-batch", "#!/bin/sh\n")]),
    );
    let run = RunConfig {
        target_version: Some("v3".to_string()),
        relaunched: true,
        ..authorized()
    };

    let outcome = fx.controller(run).run().await;

    assert!(matches!(outcome, RunOutcome::Fatal(RunError::RelaunchLoop(v)) if v == "v3"));
    assert!(fx.relauncher.relaunches().is_empty());
    assert_eq!(fx.secret_fetches(), 0);
}
