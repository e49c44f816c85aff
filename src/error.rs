//! Error taxonomy for the preview session manager.
//!
//! Collaborators (runtimes, bundle sources) report `anyhow::Error`; the session
//! layer maps those into [`PreviewError`] with a human-readable message. The
//! type is `Clone` because a single in-flight boot or pre-warm hands the same
//! outcome to every caller that joined it.

use std::time::Duration;

use crate::bundle::ProjectId;

/// Convenience alias used throughout the crate.
pub type Result<T, E = PreviewError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PreviewError {
    #[error("sandbox failed to boot: {0}")]
    Boot(String),

    #[error("dependency install failed (exit code {exit_code}): {detail}")]
    Install { exit_code: i32, detail: String },

    #[error("package cache is corrupted; install still failing after {attempts} attempts")]
    CacheCorruption { attempts: u32 },

    #[error("failed to mount files: {0}")]
    Mount(String),

    #[error("failed to write {path}: {detail}")]
    Write { path: String, detail: String },

    #[error("failed to start dev server: {0}")]
    Spawn(String),

    #[error("dev server did not report ready within {}s", .0.as_secs())]
    ServerStartTimeout(Duration),

    #[error("failed to fetch files for project {project}: {detail}")]
    BundleFetch { project: ProjectId, detail: String },

    #[error("no active sandbox; load a project first")]
    NoActiveSandbox,

    #[error("internal error: {0}")]
    Internal(String),
}

impl PreviewError {
    /// Flatten an `anyhow` chain into a single line (`outer: inner: root`).
    pub(crate) fn describe(err: &anyhow::Error) -> String {
        format!("{err:#}")
    }
}
