// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Error types for the batch run.
//!
//! `AppError` covers collaborator and per-user failures; it never escapes the
//! per-user boundary. `RunError` is the fatal class that aborts a run.

use crate::config::ConfigError;
use crate::services::secrets::SecretError;
use crate::services::version::VersionError;

/// Error raised by a collaborator call or a pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("No face detected in selfie")]
    NoFace,

    #[error("Expected exactly one face, found {0}")]
    MultipleFaces(usize),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Metadata server error: {0}")]
    Metadata(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Mail delivery error: {0}")]
    Mail(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Result type alias for collaborator and stage calls.
pub type Result<T> = std::result::Result<T, AppError>;

/// Fatal run error. The run stops before (or during) user processing,
/// the authorization latch is left set, and the process exits non-zero.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Version sync failed: {0}")]
    Version(#[from] VersionError),

    #[error("Version {0} still differs after relaunch; refusing to relaunch again")]
    RelaunchLoop(String),

    #[error("Relaunch failed: {0}")]
    Relaunch(String),

    #[error("Secret materialization failed: {0}")]
    Secrets(#[from] SecretError),

    #[error("Pipeline setup failed: {0}")]
    Setup(#[from] AppError),

    #[error("User listing failed: {0}")]
    Users(AppError),

    #[error("Run exceeded its time budget of {0:?}")]
    Timeout(std::time::Duration),
}
