// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-process user store used by tests and local dry runs.

use crate::db::UserStore;
use crate::error::{AppError, Result};
use crate::models::{DailyArtifact, User};
use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Cloneable handle; clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryDb {
    users: Arc<DashMap<String, User>>,
    artifacts: Arc<DashMap<String, DailyArtifact>>,
    embedding_writes: Arc<AtomicUsize>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_user(&self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn user(&self, user_id: &str) -> Option<User> {
        self.users.get(user_id).map(|u| u.clone())
    }

    pub fn artifacts_for(&self, user_id: &str) -> Vec<DailyArtifact> {
        self.artifacts
            .iter()
            .filter(|a| a.user_id == user_id)
            .map(|a| a.clone())
            .collect()
    }

    pub fn artifact_count(&self) -> usize {
        self.artifacts.len()
    }

    /// Number of successful `set_embedding_key` writes.
    pub fn embedding_writes(&self) -> usize {
        self.embedding_writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl UserStore for MemoryDb {
    async fn list_users(&self) -> Result<Vec<User>> {
        let mut users: Vec<User> = self.users.iter().map(|u| u.clone()).collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(users)
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self.user(user_id))
    }

    async fn set_embedding_key(
        &self,
        user_id: &str,
        selfie_key: &str,
        embedding_key: &str,
    ) -> Result<bool> {
        let Some(mut user) = self.users.get_mut(user_id) else {
            return Ok(false);
        };
        if user.selfie_object_key.as_deref() != Some(selfie_key) {
            return Ok(false);
        }
        user.embedding_object_key = Some(embedding_key.to_string());
        self.embedding_writes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn replace_selfie(&self, user_id: &str, selfie_key: &str) -> Result<()> {
        let mut user = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| AppError::NotFound(format!("user {}", user_id)))?;
        user.replace_selfie(selfie_key);
        Ok(())
    }

    async fn get_artifact(&self, user_id: &str, date: NaiveDate) -> Result<Option<DailyArtifact>> {
        Ok(self
            .artifacts
            .get(&DailyArtifact::doc_id(user_id, date))
            .map(|a| a.clone()))
    }

    async fn insert_artifact(&self, artifact: &DailyArtifact) -> Result<bool> {
        match self
            .artifacts
            .entry(DailyArtifact::doc_id(&artifact.user_id, artifact.date))
        {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(artifact.clone());
                Ok(true)
            }
        }
    }

    async fn update_artifact(&self, artifact: &DailyArtifact) -> Result<()> {
        let mut existing = self
            .artifacts
            .get_mut(&DailyArtifact::doc_id(&artifact.user_id, artifact.date))
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "artifact for {} on {}",
                    artifact.user_id, artifact.date
                ))
            })?;
        existing.delivered_at = artifact.delivered_at.clone();
        existing.delivery_error = artifact.delivery_error.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkoutDays;

    fn user(id: &str) -> User {
        User {
            id: id.to_string(),
            email: format!("{}@example.com", id),
            selfie_object_key: Some("selfies/a.jpg".to_string()),
            embedding_object_key: None,
            gender: None,
            workout_days: WorkoutDays::default(),
            mode: None,
            anti_motivation_mode: None,
        }
    }

    fn artifact(user_id: &str) -> DailyArtifact {
        DailyArtifact {
            user_id: user_id.to_string(),
            date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            object_key: "generated/x.png".to_string(),
            generated_at: "2026-03-02T06:00:00Z".to_string(),
            delivered_at: None,
            delivery_error: None,
        }
    }

    #[tokio::test]
    async fn insert_artifact_is_create_once() {
        let db = MemoryDb::new();
        assert!(db.insert_artifact(&artifact("u1")).await.unwrap());

        let mut second = artifact("u1");
        second.object_key = "generated/other.png".to_string();
        assert!(!db.insert_artifact(&second).await.unwrap());

        let stored = db.artifacts_for("u1");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].object_key, "generated/x.png");
    }

    #[tokio::test]
    async fn embedding_write_requires_current_selfie() {
        let db = MemoryDb::new();
        db.put_user(user("u1"));

        assert!(!db
            .set_embedding_key("u1", "selfies/stale.jpg", "embeddings/e.json")
            .await
            .unwrap());
        assert_eq!(db.user("u1").unwrap().embedding_object_key, None);

        assert!(db
            .set_embedding_key("u1", "selfies/a.jpg", "embeddings/e.json")
            .await
            .unwrap());
        assert_eq!(db.embedding_writes(), 1);

        assert!(!db
            .set_embedding_key("missing", "selfies/a.jpg", "embeddings/e.json")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn update_missing_artifact_is_not_found() {
        let db = MemoryDb::new();
        let err = db.update_artifact(&artifact("u1")).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
