// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Release synchronization for the live code directory.
//!
//! Workflow when the target version differs from the installed one:
//! 1. Download `releases/{version}.zip` to a scratch file
//! 2. Extract into a fresh staging directory next to the live one
//! 3. Carry prebuilt dependency dirs (venv, model weights) over from the
//!    live tree instead of rebuilding them
//! 4. Write the version marker into the staged tree
//! 5. Rename live aside (timestamped, kept) and staged into place
//!
//! Nothing under the live directory is touched before step 5.

use crate::services::storage::{release_key, ObjectStore};
use crate::time_utils::file_timestamp;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Marker file in the live directory recording the installed version.
pub const VERSION_MARKER_FILE: &str = ".release-version";

/// Result of [`VersionSynchronizer::ensure_current_version`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No update requested, or already on the target version.
    UpToDate { version: Option<String> },
    /// New code is live; the caller must relaunch from `entrypoint`.
    Swapped {
        previous: Option<String>,
        version: String,
        entrypoint: PathBuf,
        /// Where the previous live tree was moved, if there was one
        backup: Option<PathBuf>,
    },
}

/// Keeps the live code directory on the requested release.
#[derive(Clone)]
pub struct VersionSynchronizer {
    releases: Arc<dyn ObjectStore>,
    app_root: PathBuf,
    entrypoint: PathBuf,
    preserved_dirs: Vec<String>,
}

impl VersionSynchronizer {
    pub fn new(
        releases: Arc<dyn ObjectStore>,
        app_root: impl Into<PathBuf>,
        entrypoint: impl Into<PathBuf>,
        preserved_dirs: Vec<String>,
    ) -> Self {
        Self {
            releases,
            app_root: app_root.into(),
            entrypoint: entrypoint.into(),
            preserved_dirs,
        }
    }

    pub fn marker_path(&self) -> PathBuf {
        self.app_root.join(VERSION_MARKER_FILE)
    }

    /// Installed version, or `None` if the marker was never written.
    pub fn current_version(&self) -> Result<Option<String>, VersionError> {
        read_marker(&self.marker_path())
    }

    /// Bring the live directory to `target`.
    ///
    /// Fails without touching the live directory if anything goes wrong
    /// before the swap. Every error is fatal to the run.
    pub async fn ensure_current_version(
        &self,
        target: Option<&str>,
    ) -> Result<SyncOutcome, VersionError> {
        let current = self.current_version()?;

        let Some(target) = target else {
            tracing::debug!(current = ?current, "No target version requested");
            return Ok(SyncOutcome::UpToDate { version: current });
        };

        if current.as_deref() == Some(target) {
            tracing::info!(version = target, "Code already at target version");
            return Ok(SyncOutcome::UpToDate { version: current });
        }

        validate_version(target)?;

        tracing::info!(
            current = ?current,
            target,
            app_root = %self.app_root.display(),
            "Updating code to target version"
        );

        let staging_dir = self.sibling(&format!("staging-{}", target));
        let scratch_file = self.sibling(&format!("download-{}.zip", target));

        let staged = self.stage_release(target, &scratch_file, &staging_dir).await;
        remove_file_quietly(&scratch_file);
        if let Err(e) = staged {
            tracing::error!(target, error = %e, "Failed to stage release, live code untouched");
            remove_dir_quietly(&staging_dir);
            return Err(e);
        }

        let backup = self.swap_into_place(&staging_dir)?;

        tracing::info!(
            previous = ?current,
            version = target,
            backup = ?backup,
            "Code swapped to target version"
        );

        Ok(SyncOutcome::Swapped {
            previous: current,
            version: target.to_string(),
            entrypoint: self.app_root.join(&self.entrypoint),
            backup,
        })
    }

    /// Steps 1-4: download, extract, preserve dependencies, write marker.
    async fn stage_release(
        &self,
        target: &str,
        scratch_file: &Path,
        staging_dir: &Path,
    ) -> Result<(), VersionError> {
        let key = release_key(target);
        let archive = self
            .releases
            .get(&key)
            .await
            .map_err(|e| VersionError::Download(format!("{}: {}", key, e)))?;
        tracing::info!(key = %key, size = archive.len(), "Downloaded release archive");

        let app_root = self.app_root.clone();
        let entrypoint = self.entrypoint.clone();
        let preserved = self.preserved_dirs.clone();
        let scratch = scratch_file.to_path_buf();
        let staging = staging_dir.to_path_buf();
        let version = target.to_string();

        tokio::task::spawn_blocking(move || {
            fs::write(&scratch, &archive).map_err(|e| io_error("write scratch archive", &scratch, e))?;
            extract_archive(&scratch, &staging)?;

            check_entrypoint(&staging, &entrypoint)?;

            preserve_dependencies(&app_root, &staging, &preserved)?;

            let marker = staging.join(VERSION_MARKER_FILE);
            fs::write(&marker, format!("{}\n", version))
                .map_err(|e| io_error("write version marker", &marker, e))
        })
        .await
        .map_err(|e| VersionError::Io {
            context: "staging task".to_string(),
            detail: e.to_string(),
        })?
    }

    /// Step 5: rename live aside, staged into place. Reverts on failure.
    fn swap_into_place(&self, staging_dir: &Path) -> Result<Option<PathBuf>, VersionError> {
        let backup = if self.app_root.exists() {
            let backup = self.sibling(&format!(
                "previous-{}",
                file_timestamp(chrono::Utc::now())
            ));
            fs::rename(&self.app_root, &backup)
                .map_err(|e| io_error("move live directory aside", &self.app_root, e))?;
            Some(backup)
        } else {
            None
        };

        if let Err(e) = fs::rename(staging_dir, &self.app_root) {
            if let Some(backup) = &backup {
                if let Err(restore) = fs::rename(backup, &self.app_root) {
                    tracing::error!(
                        backup = %backup.display(),
                        error = %restore,
                        "Failed to restore previous code directory"
                    );
                }
            }
            remove_dir_quietly(staging_dir);
            return Err(VersionError::Swap(e.to_string()));
        }

        Ok(backup)
    }

    /// Path next to the live directory: `{app_root}.{suffix}`.
    fn sibling(&self, suffix: &str) -> PathBuf {
        let name = self
            .app_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "app".to_string());
        self.app_root.with_file_name(format!("{}.{}", name, suffix))
    }
}

fn read_marker(path: &Path) -> Result<Option<String>, VersionError> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let version = raw.trim();
            Ok((!version.is_empty()).then(|| version.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error("read version marker", path, e)),
    }
}

/// Versions become object keys and directory names.
fn validate_version(version: &str) -> Result<(), VersionError> {
    let ok = !version.is_empty()
        && version != "."
        && version != ".."
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+'));
    if ok {
        Ok(())
    } else {
        Err(VersionError::InvalidVersion(version.to_string()))
    }
}

/// The staged entrypoint must be a regular file with an exec bit set.
fn check_entrypoint(staging_dir: &Path, entrypoint: &Path) -> Result<(), VersionError> {
    let path = staging_dir.join(entrypoint);
    if !path.is_file() {
        return Err(VersionError::MissingEntrypoint(entrypoint.to_path_buf()));
    }
    let mode = fs::metadata(&path)
        .map_err(|e| io_error("stat entrypoint", &path, e))?
        .permissions()
        .mode();
    if mode & 0o111 == 0 {
        return Err(VersionError::EntrypointNotExecutable(entrypoint.to_path_buf()));
    }
    Ok(())
}

fn extract_archive(archive_path: &Path, staging_dir: &Path) -> Result<(), VersionError> {
    if staging_dir.exists() {
        fs::remove_dir_all(staging_dir)
            .map_err(|e| io_error("remove stale staging directory", staging_dir, e))?;
    }
    fs::create_dir_all(staging_dir)
        .map_err(|e| io_error("create staging directory", staging_dir, e))?;

    let file =
        fs::File::open(archive_path).map_err(|e| io_error("open archive", archive_path, e))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| VersionError::Archive(e.to_string()))?;
    archive
        .extract(staging_dir)
        .map_err(|e| VersionError::Archive(e.to_string()))?;

    tracing::debug!(
        entries = archive.len(),
        staging = %staging_dir.display(),
        "Extracted release archive"
    );
    Ok(())
}

/// Copy expensive prebuilt dirs from live into staged when the release
/// does not ship its own.
fn preserve_dependencies(
    live: &Path,
    staged: &Path,
    dirs: &[String],
) -> Result<(), VersionError> {
    for dir in dirs {
        let source = live.join(dir);
        let dest = staged.join(dir);

        if !source.is_dir() {
            continue;
        }
        if dest.exists() {
            tracing::info!(dir = %dir, "Release ships its own dependency directory");
            continue;
        }

        copy_dir_recursive(&source, &dest)?;
        tracing::info!(dir = %dir, "Preserved prebuilt dependency directory");
    }
    Ok(())
}

fn copy_dir_recursive(source: &Path, dest: &Path) -> Result<(), VersionError> {
    for entry in walkdir::WalkDir::new(source) {
        let entry = entry.map_err(|e| VersionError::Io {
            context: format!("walk {}", source.display()),
            detail: e.to_string(),
        })?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| VersionError::Io {
                context: format!("relativize {}", entry.path().display()),
                detail: e.to_string(),
            })?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| io_error("create directory", &target, e))?;
        } else if file_type.is_symlink() {
            // venvs link their interpreter; keep links as links
            let link = fs::read_link(entry.path())
                .map_err(|e| io_error("read symlink", entry.path(), e))?;
            std::os::unix::fs::symlink(&link, &target)
                .map_err(|e| io_error("create symlink", &target, e))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| io_error("copy file", &target, e))?;
        }
    }
    Ok(())
}

fn remove_file_quietly(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove scratch file");
        }
    }
}

fn remove_dir_quietly(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_dir_all(path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove staging directory");
        }
    }
}

fn io_error(context: &str, path: &Path, e: std::io::Error) -> VersionError {
    VersionError::Io {
        context: format!("{} {}", context, path.display()),
        detail: e.to_string(),
    }
}

/// Errors from version synchronization.
#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error("Invalid target version {0:?}")]
    InvalidVersion(String),

    #[error("Failed to download release: {0}")]
    Download(String),

    #[error("Failed to extract release archive: {0}")]
    Archive(String),

    #[error("Release does not contain entrypoint {0}")]
    MissingEntrypoint(PathBuf),

    #[error("Release entrypoint {0} is not executable")]
    EntrypointNotExecutable(PathBuf),

    #[error("I/O error during {context}: {detail}")]
    Io { context: String, detail: String },

    #[error("Failed to swap staged release into place: {0}")]
    Swap(String),
}
