// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Object storage for selfies, embeddings, generated images and releases.
//!
//! Uses the Cloud Storage JSON API directly; objects are small enough that
//! single-request media uploads are sufficient.

use crate::error::{AppError, Result};
use crate::services::metadata::MetadataClient;
use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Logical key prefixes.
pub mod prefixes {
    pub const SELFIES: &str = "selfies";
    pub const EMBEDDINGS: &str = "embeddings";
    pub const GENERATED: &str = "generated";
    pub const RELEASES: &str = "releases";
}

/// Key for an embedding extracted from `selfie_key` at `timestamp`.
pub fn embedding_key(selfie_key: &str, timestamp: &str) -> String {
    let file = selfie_key.rsplit('/').next().unwrap_or(selfie_key);
    let stem = match file.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file,
    };
    format!("{}/{}_{}.json", prefixes::EMBEDDINGS, timestamp, stem)
}

/// Key for the image generated for a user on a date.
pub fn generated_key(user_id: &str, date: NaiveDate) -> String {
    format!(
        "{}/{}/{}.png",
        prefixes::GENERATED,
        date.format("%Y-%m-%d"),
        urlencoding::encode(user_id)
    )
}

/// Key of the code archive for a release version.
pub fn release_key(version: &str) -> String {
    format!("{}/{}.zip", prefixes::RELEASES, version)
}

/// Get/put/exists by key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object; missing objects are [`AppError::NotFound`].
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;
}

const GCS_BASE_URL: &str = "https://storage.googleapis.com";

/// Cloud Storage bucket client.
#[derive(Clone)]
pub struct GcsStorage {
    http: reqwest::Client,
    metadata: MetadataClient,
    bucket: String,
    base_url: String,
}

impl GcsStorage {
    pub fn new(bucket: &str, metadata: MetadataClient) -> Self {
        Self {
            http: reqwest::Client::new(),
            metadata,
            bucket: bucket.to_string(),
            base_url: GCS_BASE_URL.to_string(),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.base_url,
            self.bucket,
            urlencoding::encode(key)
        )
    }

    async fn check_response(key: &str, response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::NotFound(format!("object {}", key)));
        }

        let body = response.text().await.unwrap_or_default();
        Err(AppError::Storage(format!("HTTP {} for {}: {}", status, key, body)))
    }
}

#[async_trait]
impl ObjectStore for GcsStorage {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let token = self.metadata.access_token().await?;
        let response = self
            .http
            .get(self.object_url(key))
            .query(&[("alt", "media")])
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AppError::Storage(e.to_string()))?;

        let response = Self::check_response(key, response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| AppError::Storage(e.to_string()))?;

        tracing::debug!(bucket = %self.bucket, key, size = bytes.len(), "Downloaded object");
        Ok(bytes.to_vec())
    }

    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<()> {
        let token = self.metadata.access_token().await?;
        let size = data.len();
        let response = self
            .http
            .post(format!("{}/upload/storage/v1/b/{}/o", self.base_url, self.bucket))
            .query(&[("uploadType", "media"), ("name", key)])
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data)
            .send()
            .await
            .map_err(|e| AppError::Storage(e.to_string()))?;

        Self::check_response(key, response).await?;
        tracing::debug!(bucket = %self.bucket, key, size, "Uploaded object");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let token = self.metadata.access_token().await?;
        let response = self
            .http
            .get(self.object_url(key))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AppError::Storage(e.to_string()))?;

        match Self::check_response(key, response).await {
            Ok(_) => Ok(true),
            Err(AppError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// In-memory object store for tests and local dry runs.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    objects: Arc<DashMap<String, Vec<u8>>>,
    /// Keys whose get/put fail with a storage error
    failing_keys: Arc<Mutex<HashSet<String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, data: impl Into<Vec<u8>>) {
        self.objects.insert(key.to_string(), data.into());
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.get(key).map(|o| o.clone())
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|o| o.key().starts_with(prefix))
            .map(|o| o.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Make every access to `key` fail.
    pub fn fail_key(&self, key: &str) {
        if let Ok(mut failing) = self.failing_keys.lock() {
            failing.insert(key.to_string());
        }
    }

    fn check_failure(&self, key: &str) -> Result<()> {
        let failing = self
            .failing_keys
            .lock()
            .map(|f| f.contains(key))
            .unwrap_or(false);
        if failing {
            return Err(AppError::Storage(format!("injected failure for {}", key)));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.check_failure(key)?;
        self.object(key)
            .ok_or_else(|| AppError::NotFound(format!("object {}", key)))
    }

    async fn put(&self, key: &str, data: Vec<u8>, _content_type: &str) -> Result<()> {
        self.check_failure(key)?;
        self.objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_failure(key)?;
        Ok(self.objects.contains_key(key))
    }
}
