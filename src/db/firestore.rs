// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Firestore client wrapper with typed operations.
//!
//! Provides the operations the batch run needs for:
//! - Users (read, embedding key write, selfie replacement)
//! - Daily artifacts (existence check, create-once insert, delivery update)

use crate::db::{collections, UserStore};
use crate::error::{AppError, Result};
use crate::models::{DailyArtifact, User};
use async_trait::async_trait;
use chrono::NaiveDate;
use firestore::{paths, FirestoreConsistencySelector};
use futures_util::StreamExt;

/// Firestore database client.
#[derive(Clone)]
pub struct FirestoreDb {
    client: Option<firestore::FirestoreDb>,
}

impl FirestoreDb {
    /// Create a new Firestore client.
    ///
    /// For local development with emulator, set FIRESTORE_EMULATOR_HOST.
    pub async fn new(project_id: &str) -> Result<Self> {
        // If the emulator environment variable is set, use unauthenticated connection
        // to avoid local credential warnings and leakage.
        if std::env::var("FIRESTORE_EMULATOR_HOST").is_ok() {
            return Self::create_emulator_client(project_id).await;
        }

        let client = firestore::FirestoreDb::new(project_id)
            .await
            .map_err(|e| AppError::Database(format!("Failed to connect to Firestore: {}", e)))?;

        tracing::info!(project = project_id, "Connected to Firestore");

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create a Firestore client for the emulator with unauthenticated access.
    async fn create_emulator_client(project_id: &str) -> Result<Self> {
        tracing::info!("Using unauthenticated connection for Firestore Emulator");

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

        let options = firestore::FirestoreDbOptions::new(project_id.to_string());

        let client = firestore::FirestoreDb::with_options_token_source(
            options,
            gcloud_sdk::GCP_DEFAULT_SCOPES.clone(),
            gcloud_sdk::TokenSourceType::ExternalSource(Box::new(token_source)),
        )
        .await
        .map_err(|e| {
            AppError::Database(format!("Failed to connect to Firestore Emulator: {}", e))
        })?;

        tracing::info!(
            project = project_id,
            "Connected to Firestore (Emulator/Unauthenticated)"
        );

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create an offline client. All operations return an error.
    pub fn new_mock() -> Self {
        Self { client: None }
    }

    /// Create or overwrite a user document.
    ///
    /// The web app owns user documents; this is for seeding local runs.
    pub async fn upsert_user(&self, user: &User) -> Result<()> {
        let _: () = self
            .get_client()?
            .fluent()
            .update()
            .in_col(collections::USERS)
            .document_id(&user.id)
            .object(user)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    /// Helper to get the client or return an error if offline.
    fn get_client(&self) -> Result<&firestore::FirestoreDb> {
        self.client
            .as_ref()
            .ok_or_else(|| AppError::Database("Database not connected (offline mode)".to_string()))
    }
}

#[async_trait]
impl UserStore for FirestoreDb {
    // ─── User Operations ─────────────────────────────────────────

    async fn list_users(&self) -> Result<Vec<User>> {
        let mut stream = self
            .get_client()?
            .fluent()
            .select()
            .from(collections::USERS)
            .obj::<User>()
            .stream_query_with_errors()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        // A malformed document is skipped; it must not hide every other user.
        let mut users = Vec::new();
        let mut malformed = 0usize;
        while let Some(item) = stream.next().await {
            match item {
                Ok(user) => users.push(user),
                Err(e) => {
                    malformed += 1;
                    tracing::warn!(error = %e, "Skipping unreadable user document");
                }
            }
        }
        if malformed > 0 {
            tracing::warn!(malformed, loaded = users.len(), "Some user documents were skipped");
        }
        Ok(users)
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        self.get_client()?
            .fluent()
            .select()
            .by_id_in(collections::USERS)
            .obj()
            .one(user_id)
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    async fn set_embedding_key(
        &self,
        user_id: &str,
        selfie_key: &str,
        embedding_key: &str,
    ) -> Result<bool> {
        let client = self.get_client()?;

        let mut transaction = client
            .begin_transaction()
            .await
            .map_err(|e| AppError::Database(format!("Failed to begin transaction: {}", e)))?;

        // Read through the transaction so a concurrent selfie replacement
        // aborts the commit instead of being overwritten.
        let user: Option<User> = client
            .clone_with_consistency_selector(FirestoreConsistencySelector::Transaction(
                transaction.transaction_id().clone(),
            ))
            .fluent()
            .select()
            .by_id_in(collections::USERS)
            .obj()
            .one(user_id)
            .await
            .map_err(|e| {
                AppError::Database(format!("Failed to read user in transaction: {}", e))
            })?;

        let Some(mut user) = user else {
            tracing::warn!(user_id, "User not found, not recording embedding");
            let _ = transaction.rollback().await;
            return Ok(false);
        };

        if user.selfie_object_key.as_deref() != Some(selfie_key) {
            tracing::warn!(
                user_id,
                selfie_key,
                "Selfie replaced during extraction, discarding embedding"
            );
            let _ = transaction.rollback().await;
            return Ok(false);
        }

        user.embedding_object_key = Some(embedding_key.to_string());

        // Field mask: the web app owns every other field on this document.
        client
            .fluent()
            .update()
            .fields(paths!(User::{embedding_object_key}))
            .in_col(collections::USERS)
            .document_id(user_id)
            .object(&user)
            .add_to_transaction(&mut transaction)
            .map_err(|e| {
                AppError::Database(format!("Failed to add embedding to transaction: {}", e))
            })?;

        transaction
            .commit()
            .await
            .map_err(|e| AppError::Database(format!("Transaction commit failed: {}", e)))?;
        Ok(true)
    }

    async fn replace_selfie(&self, user_id: &str, selfie_key: &str) -> Result<()> {
        let mut user = self
            .get_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {}", user_id)))?;

        user.replace_selfie(selfie_key);

        let _: () = self
            .get_client()?
            .fluent()
            .update()
            .fields(paths!(User::{selfie_object_key, embedding_object_key}))
            .in_col(collections::USERS)
            .document_id(user_id)
            .object(&user)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    // ─── Daily Artifact Operations ───────────────────────────────

    async fn get_artifact(&self, user_id: &str, date: NaiveDate) -> Result<Option<DailyArtifact>> {
        self.get_client()?
            .fluent()
            .select()
            .by_id_in(collections::DAILY_ARTIFACTS)
            .obj()
            .one(&DailyArtifact::doc_id(user_id, date))
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    async fn insert_artifact(&self, artifact: &DailyArtifact) -> Result<bool> {
        if self
            .get_artifact(&artifact.user_id, artifact.date)
            .await?
            .is_some()
        {
            return Ok(false);
        }

        // Insert (not upsert) fails if another writer created the document in
        // the meantime, so a second artifact can never replace the first.
        let _: DailyArtifact = self
            .get_client()?
            .fluent()
            .insert()
            .into(collections::DAILY_ARTIFACTS)
            .document_id(DailyArtifact::doc_id(&artifact.user_id, artifact.date))
            .object(artifact)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(true)
    }

    async fn update_artifact(&self, artifact: &DailyArtifact) -> Result<()> {
        let _: () = self
            .get_client()?
            .fluent()
            .update()
            .fields(paths!(DailyArtifact::{delivered_at, delivery_error}))
            .in_col(collections::DAILY_ARTIFACTS)
            .document_id(DailyArtifact::doc_id(&artifact.user_id, artifact.date))
            .object(artifact)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }
}
