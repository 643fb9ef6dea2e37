// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Secret materialization.
//!
//! The configuration bundle (storage bucket, mail credentials, ...) is a
//! single JSON-object secret in Secret Manager. It is fetched on every run,
//! never cached across runs, so a rotated credential is picked up by the next
//! run without a redeploy. The snapshot is written as a dotenv file readable
//! only by the run's user and loaded into the process environment.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::services::metadata::MetadataClient;
use async_trait::async_trait;

const SECRET_MANAGER_BASE_URL: &str = "https://secretmanager.googleapis.com/v1";

/// Configuration values fetched for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretSnapshot {
    values: BTreeMap<String, String>,
}

impl SecretSnapshot {
    /// Build a snapshot, rejecting keys that cannot be environment variables.
    pub fn new(values: BTreeMap<String, String>) -> Result<Self, SecretError> {
        if let Some(bad) = values.keys().find(|k| !is_valid_key(k)) {
            return Err(SecretError::InvalidKey(bad.clone()));
        }
        Ok(Self { values })
    }

    /// Parse a JSON object bundle. Scalars are stringified; nulls are dropped.
    pub fn from_json(raw: &[u8]) -> Result<Self, SecretError> {
        let parsed: BTreeMap<String, serde_json::Value> =
            serde_json::from_slice(raw).map_err(|e| SecretError::Parse(e.to_string()))?;

        let values = parsed
            .into_iter()
            .filter_map(|(key, value)| {
                let value = match value {
                    serde_json::Value::Null => return None,
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                Some((key, value))
            })
            .collect();

        Self::new(values)
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Render as dotenv lines, `KEY="value"`, one per key.
    pub fn to_dotenv(&self) -> String {
        self.values
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"\n", k, escape_value(v)))
            .collect()
    }
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Escape for a double-quoted dotenv value.
///
/// `$` is escaped so values are never treated as variable substitutions.
fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '$' => out.push_str("\\$"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

/// Where configuration secrets come from.
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn fetch_bundle(&self) -> Result<SecretSnapshot, SecretError>;
}

/// Reads the latest version of a JSON secret from Secret Manager.
#[derive(Clone)]
pub struct SecretManagerSource {
    http: reqwest::Client,
    metadata: MetadataClient,
    project_id: String,
    secret_name: String,
}

impl SecretManagerSource {
    pub fn new(project_id: &str, secret_name: &str, metadata: MetadataClient) -> Self {
        Self {
            http: reqwest::Client::new(),
            metadata,
            project_id: project_id.to_string(),
            secret_name: secret_name.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct AccessSecretVersionResponse {
    payload: SecretPayload,
}

#[derive(Deserialize)]
struct SecretPayload {
    data: String,
}

#[async_trait]
impl SecretSource for SecretManagerSource {
    async fn fetch_bundle(&self) -> Result<SecretSnapshot, SecretError> {
        let token = self
            .metadata
            .access_token()
            .await
            .map_err(|e| SecretError::Fetch(e.to_string()))?;

        let url = format!(
            "{}/projects/{}/secrets/{}/versions/latest:access",
            SECRET_MANAGER_BASE_URL, self.project_id, self.secret_name
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| SecretError::Fetch(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SecretError::Fetch(format!("HTTP {}: {}", status, body)));
        }

        let body: AccessSecretVersionResponse = response
            .json()
            .await
            .map_err(|e| SecretError::Parse(e.to_string()))?;
        let raw = BASE64
            .decode(body.payload.data)
            .map_err(|e| SecretError::Parse(format!("payload is not base64: {}", e)))?;

        SecretSnapshot::from_json(&raw)
    }
}

/// Fetches the bundle and makes it the process environment.
#[derive(Clone)]
pub struct SecretMaterializer {
    source: Arc<dyn SecretSource>,
    env_path: PathBuf,
}

impl SecretMaterializer {
    pub fn new(source: Arc<dyn SecretSource>, env_path: impl Into<PathBuf>) -> Self {
        Self {
            source,
            env_path: env_path.into(),
        }
    }

    /// Fetch, persist and load the configuration bundle.
    pub async fn materialize(&self) -> Result<SecretSnapshot, SecretError> {
        tracing::info!(path = %self.env_path.display(), "Fetching configuration secrets");

        let snapshot = self.source.fetch_bundle().await?;
        write_env_file(&self.env_path, &snapshot)?;

        dotenvy::from_path_override(&self.env_path)
            .map_err(|e| SecretError::Load(e.to_string()))?;

        tracing::info!(keys = snapshot.len(), "Configuration secrets loaded");
        Ok(snapshot)
    }
}

/// Atomically replace the dotenv file, readable only by the owner.
pub fn write_env_file(path: &Path, snapshot: &SecretSnapshot) -> Result<(), SecretError> {
    let io_err = |e: std::io::Error| SecretError::Write(format!("{}: {}", path.display(), e));

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let tmp_path = path.with_extension("tmp");
    if tmp_path.exists() {
        fs::remove_file(&tmp_path).map_err(io_err)?;
    }

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&tmp_path)
        .map_err(io_err)?;
    file.write_all(snapshot.to_dotenv().as_bytes())
        .map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600)).map_err(io_err)?;
    fs::rename(&tmp_path, path).map_err(io_err)?;

    Ok(())
}

/// Errors from secret materialization. All are fatal to the run.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Failed to fetch secrets: {0}")]
    Fetch(String),

    #[error("Failed to parse secret bundle: {0}")]
    Parse(String),

    #[error("Invalid secret key {0:?}")]
    InvalidKey(String),

    #[error("Failed to write secrets file: {0}")]
    Write(String),

    #[error("Failed to load secrets file: {0}")]
    Load(String),
}
