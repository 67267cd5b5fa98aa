//! Error types for the upload engine and its remote collaborators

use std::io;

/// Failure reported by a remote collaborator (archive service or attribute store).
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Temporary condition (timeout, throttling, 5xx, dropped connection).
    #[error("transient service error: {0}")]
    Transient(String),
    /// The service recomputed a checksum that differs from the one we sent.
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Request understood and refused (bad parameters, auth, quota...).
    #[error("request rejected: {0}")]
    Rejected(String),
    /// Response could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ServiceError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Transient(_) => true,
            ServiceError::Io(e) => is_retryable_io(e),
            _ => false,
        }
    }
}

/// Whether an I/O error on a network path is transient and worth retrying.
pub fn is_retryable_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
    )
}

/// Failure of the chunked upload engine.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Reading the local archive failed. Never retried.
    #[error("source file: {0}")]
    Source(#[source] io::Error),
    #[error("{op} failed: {source}")]
    Service {
        op: &'static str,
        #[source]
        source: ServiceError,
    },
    /// Another worker hit a fatal error and the run is being torn down.
    #[error("upload aborted")]
    Aborted,
}

impl UploadError {
    pub fn service(op: &'static str, source: ServiceError) -> Self {
        UploadError::Service { op, source }
    }

    /// Only collaborator failures can be transient; local source errors are always fatal.
    pub fn is_transient(&self) -> bool {
        match self {
            UploadError::Service { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

/// Failure reading, writing or pruning the retention ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("attribute store: {0}")]
    Store(#[from] ServiceError),
    #[error("ledger value is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("ledger segment {0} is missing")]
    MissingSegment(String),
    #[error("ledger segment count '{0}' is not a number")]
    BadSegmentCount(String),
    #[error("delete archive {archive_id}: {source}")]
    Delete {
        archive_id: String,
        #[source]
        source: ServiceError,
    },
    #[error("retention limit must be at least 1")]
    InvalidRetention,
}
