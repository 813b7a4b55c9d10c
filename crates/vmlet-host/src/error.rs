//! Error types for host probing.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for host probe operations.
pub type Result<T> = std::result::Result<T, HostError>;

/// Errors that can occur while reading host hardware information.
#[derive(Debug, Error)]
pub enum HostError {
    /// I/O error reading `/proc` or `/sys`.
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A value in a proc/sys file did not parse.
    #[error("failed to parse {what} from {path}: {detail}")]
    Parse {
        what: &'static str,
        path: PathBuf,
        detail: String,
    },

    /// A sysfs attribute file was larger than the scalar it should hold.
    #[error("attribute file {0} is larger than expected")]
    AttributeTooLarge(PathBuf),

    /// An expected proc/sys entry was absent.
    #[error("missing {what} in {path}")]
    Missing { what: &'static str, path: PathBuf },
}

impl HostError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(
        what: &'static str,
        path: impl Into<PathBuf>,
        detail: impl Into<String>,
    ) -> Self {
        Self::Parse {
            what,
            path: path.into(),
            detail: detail.into(),
        }
    }
}
