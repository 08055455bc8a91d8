//! Error types for the upload engine

use thiserror::Error;

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Upload error types
#[derive(Debug, Clone, Error)]
pub enum UploadError {
    /// Upload was cancelled
    #[error("Upload cancelled")]
    Cancelled,

    /// Network-level failure (connection drop, 5xx, transport error)
    #[error("Network error: {0}")]
    Network(String),

    /// A request exceeded the per-call timeout
    #[error("Request timed out")]
    Timeout,

    /// The upload token was rejected as expired
    #[error("Upload token expired")]
    TokenExpired,

    /// Failed to create upload session
    #[error("Failed to create upload session: {0}")]
    SessionCreationFailed(String),

    /// Server rejected a chunk because its digest did not match
    #[error("Hash mismatch for chunk {index}")]
    HashMismatch { index: usize },

    /// Chunk upload failed
    #[error("Chunk {index} upload failed: {message}")]
    ChunkFailed { index: usize, message: String },

    /// Failed to finalize the upload
    #[error("Failed to merge file: {0}")]
    MergeFailed(String),

    /// The chunk plan and the server state disagree
    #[error("Plan inconsistency: {0}")]
    PlanInconsistency(String),

    /// The adapter returned a malformed response
    #[error("Adapter contract violation: {0}")]
    ContractViolation(String),

    /// Caller-side validation failure (e.g. file too large)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Failed to read the source file
    #[error("Failed to read source: {0}")]
    FileRead(String),

    /// Resume store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl UploadError {
    /// Check if this error is retryable with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UploadError::Network(_) | UploadError::Timeout | UploadError::ChunkFailed { .. }
        )
    }

    /// Check if this error terminates the task immediately, bypassing retry
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            UploadError::HashMismatch { .. }
                | UploadError::PlanInconsistency(_)
                | UploadError::ContractViolation(_)
                | UploadError::Validation(_)
        )
    }

    /// Check if this error is due to cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Cancelled)
    }

    /// Create a chunk upload error
    pub fn chunk_failed(index: usize, message: impl Into<String>) -> Self {
        UploadError::ChunkFailed {
            index,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        UploadError::FileRead(err.to_string())
    }
}
