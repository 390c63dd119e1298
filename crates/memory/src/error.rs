use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy for the persistence layer.
///
/// | Variant              | Policy                                               |
/// |----------------------|------------------------------------------------------|
/// | `Io`                 | surfaced; disk or permission trouble is not retried  |
/// | `Corruption`         | recovered from `.bak` or a default, then logged      |
/// | `LockTimeout`        | surfaced to the operation that needed the lock       |
/// | `IndexInconsistency` | triggers a rebuild of the vector index               |
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt resource {path}: {reason}")]
    Corruption { path: PathBuf, reason: String },

    #[error("timed out after {waited:?} waiting for lock on {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("vector index holds {index_len} vectors but mirror holds {mirror_len} entries")]
    IndexInconsistency { index_len: usize, mirror_len: usize },

    #[error("record id {0} already exists")]
    DuplicateId(String),

    #[error("vector has {actual} dimensions, index expects {expected}")]
    Dimension { expected: usize, actual: usize },

    #[error("failed to encode {what}: {reason}")]
    Encode { what: &'static str, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corruption(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Corruption {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Attach a path to raw `std::io` results.
pub(crate) trait IoContext<T> {
    fn at(self, path: &std::path::Path) -> StoreResult<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: &std::path::Path) -> StoreResult<T> {
        self.map_err(|source| StoreError::io(path, source))
    }
}
