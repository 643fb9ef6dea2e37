// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Data models for the batch run.

pub mod artifact;
pub mod user;

pub use artifact::{DailyArtifact, Embedding};
pub use user::{Gender, Mode, User, UserStage, WorkoutDays};
