// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Configuration for the batch run.
//!
//! Three layers:
//! - [`Config`]: process settings from the environment (and `.env` locally).
//! - [`RunConfig`]: per-invocation control state read from the instance
//!   (authorization latch, email scope, target version).
//! - [`RuntimeSettings`]: values from the secret snapshot, fetched fresh
//!   every run so rotation takes effect without a redeploy.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable set on the relaunched process after a code swap.
pub const RELAUNCH_ENV: &str = "MOTIV8_RELAUNCHED";

/// Process configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// GCP project hosting the instance and the secret
    pub gcp_project_id: String,
    /// Bucket holding release archives
    pub release_bucket: String,
    /// Live code directory
    pub app_root: PathBuf,
    /// Entrypoint relative to `app_root`, exec'd after a swap
    pub app_entrypoint: PathBuf,
    /// Prebuilt dependency dirs carried over into a staged release
    pub preserved_dirs: Vec<String>,
    /// Secret Manager secret holding the configuration bundle
    pub config_secret_name: String,
    /// Where the secret snapshot is written as a dotenv file
    pub secrets_env_path: PathBuf,
    /// Base URL of the local inference sidecar
    pub inference_url: String,
    /// Offset of the reference timezone used to pick the run date
    pub utc_offset_minutes: i32,
    /// Wall-clock budget for secrets + user processing
    pub max_runtime_minutes: u64,
    /// Delay between run end and instance shutdown
    pub shutdown_grace_minutes: u64,
    /// Disable to keep the instance up (local runs)
    pub shutdown_on_exit: bool,
    /// Users processed at once
    pub user_concurrency: usize,
    /// Generation jobs allowed at once
    pub generation_concurrency: usize,
    /// This process was exec'd by a previous one after a code swap
    pub relaunched: bool,
}

impl Config {
    /// Config for tests; paths point at `app_root` and must be overridden.
    pub fn test_default() -> Self {
        Self {
            gcp_project_id: "test-project".to_string(),
            release_bucket: "test-releases".to_string(),
            app_root: PathBuf::from("/tmp/motiv8-test/app"),
            app_entrypoint: PathBuf::from("bin/motiv8-batch"),
            preserved_dirs: vec!["venv".to_string(), "models".to_string()],
            config_secret_name: "motiv8-config".to_string(),
            secrets_env_path: PathBuf::from("/tmp/motiv8-test/runtime.env"),
            inference_url: "http://127.0.0.1:8500".to_string(),
            utc_offset_minutes: 0,
            max_runtime_minutes: 120,
            shutdown_grace_minutes: 5,
            shutdown_on_exit: true,
            user_concurrency: 1,
            generation_concurrency: 1,
            relaunched: false,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        Ok(Self {
            gcp_project_id: env::var("GCP_PROJECT_ID").unwrap_or_else(|_| "local-dev".to_string()),
            release_bucket: env::var("RELEASE_BUCKET")
                .map(|v| v.trim().to_string())
                .map_err(|_| ConfigError::Missing("RELEASE_BUCKET"))?,
            app_root: env::var("APP_ROOT")
                .unwrap_or_else(|_| "/opt/motiv8/app".to_string())
                .into(),
            app_entrypoint: env::var("APP_ENTRYPOINT")
                .unwrap_or_else(|_| "bin/motiv8-batch".to_string())
                .into(),
            preserved_dirs: parse_list(
                &env::var("PRESERVED_DIRS").unwrap_or_else(|_| "venv,models".to_string()),
            ),
            config_secret_name: env::var("CONFIG_SECRET_NAME")
                .unwrap_or_else(|_| "motiv8-config".to_string()),
            secrets_env_path: env::var("SECRETS_ENV_PATH")
                .unwrap_or_else(|_| "/var/lib/motiv8/runtime.env".to_string())
                .into(),
            inference_url: env::var("INFERENCE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8500".to_string()),
            utc_offset_minutes: parse_var("RUN_UTC_OFFSET_MINUTES", 0)?,
            max_runtime_minutes: parse_var("RUN_MAX_RUNTIME_MINUTES", 120)?,
            shutdown_grace_minutes: parse_var("SHUTDOWN_GRACE_MINUTES", 5)?,
            shutdown_on_exit: parse_var("SHUTDOWN_ON_EXIT", true)?,
            user_concurrency: parse_var::<usize>("USER_CONCURRENCY", 1)?.max(1),
            generation_concurrency: parse_var::<usize>("GENERATION_CONCURRENCY", 1)?.max(1),
            relaunched: relaunch_flag(env::var(RELAUNCH_ENV).ok().as_deref()),
        })
    }

    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_minutes * 60)
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name, raw)),
        _ => Ok(default),
    }
}

/// Interpret the relaunch marker; only "1" or "true" count.
pub fn relaunch_flag(raw: Option<&str>) -> bool {
    matches!(raw.map(str::trim), Some(v) if v == "1" || v.eq_ignore_ascii_case("true"))
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Control state for one invocation.
///
/// Read from the compute resource at process start and injected into the
/// lifecycle controller; clearing the authorization goes through
/// [`crate::services::gate::AuthorizationLatch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunConfig {
    /// Single-shot latch: the run only proceeds when set
    pub authorized: bool,
    /// Restrict the run to one email address
    pub scope_filter: Option<String>,
    /// Release version this instance should be running
    pub target_version: Option<String>,
    /// Set when this process was relaunched after a code swap
    pub relaunched: bool,
}

impl RunConfig {
    /// Build from raw attribute values as stored on the instance.
    pub fn from_attributes(
        authorized: Option<&str>,
        scope_filter: Option<&str>,
        target_version: Option<&str>,
    ) -> Self {
        Self {
            authorized: authorized
                .map(|v| v.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            scope_filter: non_empty(scope_filter),
            target_version: non_empty(target_version),
            relaunched: false,
        }
    }

    /// Mark whether this process is the one started after a code swap.
    pub fn with_relaunched(mut self, relaunched: bool) -> Self {
        self.relaunched = relaunched;
        self
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Settings taken from the secret snapshot.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub storage_bucket: String,
    pub firestore_project_id: String,
    pub mail: Option<MailSettings>,
}

/// Credentials for the transactional mail API.
#[derive(Debug, Clone)]
pub struct MailSettings {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
}

impl RuntimeSettings {
    /// Extract the values the pipeline needs from a secret bundle.
    ///
    /// Mail settings are optional: without them every delivery fails per user
    /// while extraction and generation still run.
    pub fn from_snapshot(
        values: &BTreeMap<String, String>,
        default_project: &str,
    ) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            values
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let mail = match (get("MAIL_API_URL"), get("MAIL_API_KEY")) {
            (Some(api_url), Some(api_key)) => Some(MailSettings {
                api_url,
                api_key,
                from: get("MAIL_FROM").unwrap_or_else(|| "noreply@motiv8.ai".to_string()),
            }),
            _ => None,
        };

        Ok(Self {
            storage_bucket: get("STORAGE_BUCKET").ok_or(ConfigError::Missing("STORAGE_BUCKET"))?,
            firestore_project_id: get("FIRESTORE_PROJECT_ID")
                .unwrap_or_else(|| default_project.to_string()),
            mail,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {0}: {1:?}")]
    Invalid(&'static str, String),
}
