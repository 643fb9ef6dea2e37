// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Compute Engine instance metadata.
//!
//! The instance carries the run's control state as custom metadata
//! attributes:
//! - `run-authorized`: `"true"` arms the single-shot latch
//! - `email-scope`: optional email restricting the run to one user
//! - `target-version`: optional release the instance should run
//!
//! The metadata server also hands out the service account's access token,
//! used by the Secret Manager, Cloud Storage and Compute API clients.

use crate::config::RunConfig;
use crate::error::{AppError, Result};
use crate::services::gate::AuthorizationLatch;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const ATTR_RUN_AUTHORIZED: &str = "run-authorized";
pub const ATTR_EMAIL_SCOPE: &str = "email-scope";
pub const ATTR_TARGET_VERSION: &str = "target-version";

const METADATA_BASE_URL: &str = "http://metadata.google.internal/computeMetadata/v1";
const COMPUTE_BASE_URL: &str = "https://compute.googleapis.com/compute/v1";

/// Client for the instance metadata server.
#[derive(Clone)]
pub struct MetadataClient {
    http: reqwest::Client,
    base_url: String,
}

impl Default for MetadataClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataClient {
    pub fn new() -> Self {
        Self::with_base_url(METADATA_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// GET a metadata path; 404 means "not set".
    async fn get_text(&self, path: &str) -> Result<Option<String>> {
        let response = self
            .http
            .get(format!("{}/{}", self.base_url, path))
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| AppError::Metadata(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Metadata(format!("HTTP {}: {}", status, body)));
        }

        response
            .text()
            .await
            .map(Some)
            .map_err(|e| AppError::Metadata(e.to_string()))
    }

    async fn get_required(&self, path: &str) -> Result<String> {
        self.get_text(path)
            .await?
            .ok_or_else(|| AppError::Metadata(format!("metadata path {} not set", path)))
    }

    /// OAuth access token for the instance's service account.
    pub async fn access_token(&self) -> Result<String> {
        let raw = self
            .get_required("instance/service-accounts/default/token")
            .await?;
        let token: AccessToken =
            serde_json::from_str(&raw).map_err(|e| AppError::Metadata(e.to_string()))?;
        Ok(token.access_token)
    }

    /// A custom metadata attribute of this instance.
    pub async fn attribute(&self, key: &str) -> Result<Option<String>> {
        self.get_text(&format!("instance/attributes/{}", key)).await
    }

    /// Read the run's control state from instance attributes.
    pub async fn load_run_config(&self) -> Result<RunConfig> {
        let authorized = self.attribute(ATTR_RUN_AUTHORIZED).await?;
        let scope = self.attribute(ATTR_EMAIL_SCOPE).await?;
        let target = self.attribute(ATTR_TARGET_VERSION).await?;

        Ok(RunConfig::from_attributes(
            authorized.as_deref(),
            scope.as_deref(),
            target.as_deref(),
        ))
    }

    /// Project, zone and name of this instance.
    pub async fn instance_identity(&self) -> Result<InstanceIdentity> {
        let project = self.get_required("project/project-id").await?;
        // Returned as projects/<number>/zones/<zone>
        let zone_path = self.get_required("instance/zone").await?;
        let zone = zone_path
            .rsplit('/')
            .next()
            .unwrap_or(zone_path.as_str())
            .to_string();
        let name = self.get_required("instance/name").await?;

        Ok(InstanceIdentity {
            project,
            zone,
            name,
        })
    }
}

#[derive(Deserialize)]
struct AccessToken {
    access_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub project: String,
    pub zone: String,
    pub name: String,
}

/// Clears `run-authorized` through the Compute Engine API.
///
/// Instance metadata survives stop/start, so leaving the attribute set would
/// re-run the same day after any reboot.
#[derive(Clone)]
pub struct InstanceAttributeLatch {
    metadata: MetadataClient,
    http: reqwest::Client,
    compute_base_url: String,
}

impl InstanceAttributeLatch {
    pub fn new(metadata: MetadataClient) -> Self {
        Self {
            metadata,
            http: reqwest::Client::new(),
            compute_base_url: COMPUTE_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct InstanceMetadata {
    #[serde(default)]
    fingerprint: String,
    #[serde(default)]
    items: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetadataItem {
    key: String,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Deserialize)]
struct InstanceResource {
    #[serde(default)]
    metadata: InstanceMetadata,
}

/// Rewrite the authorization attribute to `"false"`, keeping other items.
fn with_authorization_cleared(mut metadata: InstanceMetadata) -> InstanceMetadata {
    let mut found = false;
    for item in metadata.items.iter_mut() {
        if item.key == ATTR_RUN_AUTHORIZED {
            item.value = Some("false".to_string());
            found = true;
        }
    }
    if !found {
        metadata.items.push(MetadataItem {
            key: ATTR_RUN_AUTHORIZED.to_string(),
            value: Some("false".to_string()),
        });
    }
    metadata
}

#[async_trait]
impl AuthorizationLatch for InstanceAttributeLatch {
    async fn clear(&self) -> Result<()> {
        let identity = self.metadata.instance_identity().await?;
        let token = self.metadata.access_token().await?;

        let instance_url = format!(
            "{}/projects/{}/zones/{}/instances/{}",
            self.compute_base_url, identity.project, identity.zone, identity.name
        );

        let response = self
            .http
            .get(&instance_url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| AppError::Metadata(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Metadata(format!("HTTP {}: {}", status, body)));
        }
        let instance: InstanceResource = response
            .json()
            .await
            .map_err(|e| AppError::Metadata(format!("JSON parse error: {}", e)))?;

        // The fingerprint makes this a compare-and-set against concurrent edits.
        let updated = with_authorization_cleared(instance.metadata);

        let response = self
            .http
            .post(format!("{}/setMetadata", instance_url))
            .bearer_auth(&token)
            .json(&updated)
            .send()
            .await
            .map_err(|e| AppError::Metadata(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Metadata(format!("HTTP {}: {}", status, body)));
        }

        tracing::info!(instance = %identity.name, "Cleared run authorization attribute");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clearing_rewrites_existing_attribute() {
        let metadata = InstanceMetadata {
            fingerprint: "abc".to_string(),
            items: vec![
                MetadataItem {
                    key: "startup-script".to_string(),
                    value: Some("run.sh".to_string()),
                },
                MetadataItem {
                    key: ATTR_RUN_AUTHORIZED.to_string(),
                    value: Some("true".to_string()),
                },
            ],
        };

        let updated = with_authorization_cleared(metadata);

        assert_eq!(updated.fingerprint, "abc");
        assert_eq!(updated.items.len(), 2);
        assert_eq!(updated.items[0].value.as_deref(), Some("run.sh"));
        assert_eq!(updated.items[1].value.as_deref(), Some("false"));
    }

    #[test]
    fn clearing_adds_missing_attribute() {
        let updated = with_authorization_cleared(InstanceMetadata::default());
        assert_eq!(updated.items.len(), 1);
        assert_eq!(updated.items[0].key, ATTR_RUN_AUTHORIZED);
        assert_eq!(updated.items[0].value.as_deref(), Some("false"));
    }

    #[test]
    fn instance_resource_without_metadata_parses() {
        let instance: InstanceResource = serde_json::from_str(r#"{"name": "batch-1"}"#).unwrap();
        assert!(instance.metadata.items.is_empty());
    }
}
