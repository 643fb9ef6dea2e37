// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Single-shot run authorization.
//!
//! An external scheduler sets the authorization and starts the instance.
//! The run clears it once processing finishes, so a reboot or manual start
//! later the same day does nothing.

use crate::config::RunConfig;
use crate::error::Result;
use crate::models::User;
use async_trait::async_trait;
use std::sync::Arc;

/// Where the authorization flag is stored.
#[async_trait]
pub trait AuthorizationLatch: Send + Sync {
    /// Mark the authorization as consumed.
    async fn clear(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    NotAuthorized,
    Authorized { scope_filter: Option<String> },
}

/// Decides whether this invocation runs, and for whom.
#[derive(Clone)]
pub struct RunGate {
    run: RunConfig,
    latch: Arc<dyn AuthorizationLatch>,
}

impl RunGate {
    pub fn new(run: RunConfig, latch: Arc<dyn AuthorizationLatch>) -> Self {
        Self { run, latch }
    }

    pub fn authorize(&self) -> GateDecision {
        if !self.run.authorized {
            tracing::info!("Run not authorized, nothing to do");
            return GateDecision::NotAuthorized;
        }

        let scope_filter = self
            .run
            .scope_filter
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        match &scope_filter {
            Some(email) => tracing::info!(scope = %email, "Run authorized for a single user"),
            None => tracing::info!("Run authorized for all users"),
        }

        GateDecision::Authorized { scope_filter }
    }

    /// Consume the authorization. Failures are logged; the run result
    /// stands either way.
    pub async fn release(&self) {
        match self.latch.clear().await {
            Ok(()) => tracing::info!("Run authorization cleared"),
            Err(e) => tracing::error!(error = %e, "Failed to clear run authorization"),
        }
    }
}

/// True if `user` is inside the run's scope.
pub fn in_scope(user: &User, scope_filter: Option<&str>) -> bool {
    match scope_filter.map(str::trim).filter(|s| !s.is_empty()) {
        Some(email) => user.matches_email(email),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::models::WorkoutDays;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingLatch {
        clears: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl AuthorizationLatch for CountingLatch {
        async fn clear(&self) -> Result<()> {
            self.clears.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AppError::Metadata("permission denied".to_string()));
            }
            Ok(())
        }
    }

    fn run(authorized: bool, scope: Option<&str>) -> RunConfig {
        RunConfig {
            authorized,
            scope_filter: scope.map(str::to_string),
            ..RunConfig::default()
        }
    }

    #[test]
    fn unauthorized_run_is_rejected() {
        let gate = RunGate::new(run(false, Some("a@b.com")), Arc::new(CountingLatch::default()));
        assert_eq!(gate.authorize(), GateDecision::NotAuthorized);
    }

    #[test]
    fn blank_scope_means_everyone() {
        let gate = RunGate::new(run(true, Some("   ")), Arc::new(CountingLatch::default()));
        assert_eq!(
            gate.authorize(),
            GateDecision::Authorized { scope_filter: None }
        );
    }

    #[test]
    fn scope_matches_case_insensitively() {
        let user = User {
            id: "u1".to_string(),
            email: "Jane.Doe@Example.com".to_string(),
            selfie_object_key: None,
            embedding_object_key: None,
            gender: None,
            workout_days: WorkoutDays::default(),
            mode: None,
            anti_motivation_mode: None,
        };
        assert!(in_scope(&user, None));
        assert!(in_scope(&user, Some("")));
        assert!(in_scope(&user, Some(" jane.doe@example.COM ")));
        assert!(!in_scope(&user, Some("john@example.com")));
    }

    #[tokio::test]
    async fn release_swallows_latch_errors() {
        let latch = Arc::new(CountingLatch {
            fail: true,
            ..Default::default()
        });
        let gate = RunGate::new(run(true, None), latch.clone());
        gate.release().await;
        assert_eq!(latch.clears.load(Ordering::SeqCst), 1);
    }
}
