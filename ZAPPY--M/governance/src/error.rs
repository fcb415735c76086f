use std::path::PathBuf;

use thiserror::Error;

/// Failures that abort a governance operation.
///
/// Validation failures and protocol rejections are *not* represented here:
/// they are ordinary outcomes returned by the components. This type covers
/// what the caller must remediate (unwritable disk, broken configuration).
#[derive(Debug, Error)]
pub enum GovernanceError {
    /// Filesystem access failed.
    #[error("io error on {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A record could not be encoded.
    #[error("serialization error for {path}: {source}")]
    Serialization {
        /// Record location.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// The cross-process state lock could not be taken.
    #[error("state lock {path} unavailable: {source}")]
    Lock {
        /// Lock file location.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Configuration file was unreadable or invalid.
    #[error("configuration error: {0}")]
    Config(String),
    /// Log or event sink failed.
    #[error("journal error: {0}")]
    Journal(#[from] anyhow::Error),
}

impl GovernanceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type GovernanceResult<T> = Result<T, GovernanceError>;
