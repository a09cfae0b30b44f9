//! Error kinds surfaced by the orchestration engine.
//!
//! Setup-phase failures are unwound before they reach the caller, so a value
//! of [`Error`] returned from `create` always describes an environment that
//! no longer exists in any partial form.

use std::path::PathBuf;

use thiserror::Error;

use crate::environment::EnvironmentStatus;

/// Result alias used across the public API.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The host could not satisfy a sizing request. Callers normally never
    /// see this: the resource manager falls back to conservative defaults.
    #[error("host resources unavailable: {0}")]
    ResourceUnavailable(String),

    /// A network-domain setup step failed; prior steps were unwound.
    #[error("network isolation setup failed at step `{step}`: {reason}")]
    IsolationSetupFailed { step: String, reason: String },

    #[error("VM provisioning failed: {0}")]
    VmProvisionFailed(String),

    #[error("VM for environment {env_id} exited unexpectedly")]
    VmCrashed { env_id: uuid::Uuid },

    /// Persisted registry state is unreadable or unwritable.
    #[error("environment registry is corrupt: {0}")]
    RegistryCorruption(String),

    #[error("environment not found: {0}")]
    NotFound(String),

    #[error("environment name `{0}` is already used by an active environment")]
    NameInUse(String),

    #[error("invalid environment specification: {0}")]
    InvalidSpec(String),

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: EnvironmentStatus,
        to: EnvironmentStatus,
    },

    /// Cancellation or timeout observed before the named step ran.
    #[error("operation cancelled before step `{0}`")]
    Cancelled(String),

    #[error("filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Build a [`Error::Filesystem`] for `path`.
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// `true` for the normal "nothing by that name or id" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// `true` when persisted state could not be read or written.
    pub fn is_registry_corruption(&self) -> bool {
        matches!(self, Self::RegistryCorruption(_))
    }
}
