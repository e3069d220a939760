//! Durable append-only object targets for log records.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;

/// Why a record did not make it to storage.
///
/// Records are never retried; the error is only logged.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to serialize log entry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("object `{key}` already exists")]
    AlreadyExists { key: String },

    #[error("upload of `{key}` was cancelled")]
    Cancelled { key: String },

    #[error("upload of `{key}` did not finish within {deadline:?}")]
    DeadlineExceeded { key: String, deadline: Duration },

    #[error("storage I/O failed for `{key}`: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upload worker for `{key}` exited without reporting a result")]
    WorkerLost { key: String },
}

/// Shared flag telling a store to abandon an in-flight upload.
///
/// Stores check it between steps; a cancelled upload must not leave
/// a visible object behind.
#[derive(Clone, Default, Debug)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Shorthand for stores: fail with `Cancelled` if the upload was abandoned.
    pub fn check(&self, key: &str) -> Result<(), UploadError> {
        if self.is_cancelled() {
            return Err(UploadError::Cancelled {
                key: key.to_owned(),
            });
        }
        Ok(())
    }
}

/// A durable, append-only object sink.
///
/// Called concurrently from upload worker threads, one call per record.
/// Existing keys are never overwritten.
#[typetag::serde(tag = "type")]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `key`.
    fn put(&self, key: &str, body: &[u8], cancel: &CancelToken) -> Result<(), UploadError>;
}
