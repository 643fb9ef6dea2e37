// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - collaborators and run orchestration.

pub mod gate;
pub mod inference;
pub mod lifecycle;
pub mod mail;
pub mod metadata;
pub mod pipeline;
pub mod prompt;
pub mod secrets;
pub mod storage;
pub mod version;

pub use gate::{AuthorizationLatch, GateDecision, RunGate};
pub use inference::{FaceExtractor, HttpInferenceClient, ImageGenerator};
pub use lifecycle::{
    Collaborators, ExecRelauncher, GcpPipelineFactory, PipelineFactory, Relauncher,
    RunLifecycleController, RunOutcome, Shutdown, SystemShutdown,
};
pub use mail::{HttpMailer, Mailer, MotivationEmail};
pub use metadata::{InstanceAttributeLatch, MetadataClient};
pub use pipeline::{PipelineDeps, RunSummary, UserFailure, UserPipeline};
pub use secrets::{SecretManagerSource, SecretMaterializer, SecretSnapshot, SecretSource};
pub use storage::{GcsStorage, MemoryStorage, ObjectStore};
pub use version::{SyncOutcome, VersionSynchronizer};
