//! Database layer.
//!
//! [`UserStore`] is the seam the pipeline talks to; [`FirestoreDb`] backs it
//! in production and [`MemoryDb`] in tests and local dry runs.

pub mod firestore;
pub mod memory;

pub use firestore::FirestoreDb;
pub use memory::MemoryDb;

use crate::error::Result;
use crate::models::{DailyArtifact, User};
use async_trait::async_trait;
use chrono::NaiveDate;

/// Collection names as constants.
pub mod collections {
    pub const USERS: &str = "users";
    /// Generated images, keyed by `{user_id}_{date}`
    pub const DAILY_ARTIFACTS: &str = "daily_artifacts";
}

/// Reads and writes the batch run performs against the user store.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// All users; eligibility is decided by the caller.
    async fn list_users(&self) -> Result<Vec<User>>;

    async fn get_user(&self, user_id: &str) -> Result<Option<User>>;

    /// Record the embedding extracted from `selfie_key`.
    ///
    /// Returns `false` without writing if the user is gone or their selfie
    /// changed since extraction started.
    async fn set_embedding_key(
        &self,
        user_id: &str,
        selfie_key: &str,
        embedding_key: &str,
    ) -> Result<bool>;

    /// Store a new selfie key and clear the embedding key in a single write.
    async fn replace_selfie(&self, user_id: &str, selfie_key: &str) -> Result<()>;

    async fn get_artifact(&self, user_id: &str, date: NaiveDate) -> Result<Option<DailyArtifact>>;

    /// Create the artifact for its (user, date). Returns `false` if one exists.
    async fn insert_artifact(&self, artifact: &DailyArtifact) -> Result<bool>;

    /// Overwrite delivery bookkeeping on an existing artifact.
    async fn update_artifact(&self, artifact: &DailyArtifact) -> Result<()>;
}
