use std::path::PathBuf;

use thiserror::Error;

/// Fatal errors raised while resolving the root folder. Everything else is
/// captured per folder and never aborts the run.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("root folder {0:?} not found")]
    RootNotFound(PathBuf),

    #[error("root path {0:?} is not a directory")]
    NotADirectory(PathBuf),

    #[error("failed to read root folder: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-folder errors. Converted into an `UploadOutcome` at the orchestrator
/// boundary and recorded in the failure marker.
#[derive(Debug, Error)]
pub enum FolderError {
    #[error("no JSON metadata file found in folder")]
    MissingData,

    #[error("multiple JSON metadata files found: {}", candidates.join(", "))]
    AmbiguousData { candidates: Vec<String> },

    #[error("failed to parse {filename}: {source}")]
    Parse {
        filename: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported payload in {filename}: {reason}")]
    InvalidPayload { filename: String, reason: String },

    #[error("failed to read {filename}: {source}")]
    Read {
        filename: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    RecordStore(#[from] RecordStoreError),
}

impl FolderError {
    /// Whether a re-run could plausibly succeed without the folder changing.
    /// Recorded in the outcome log; nothing retries in-process.
    pub fn is_retryable(&self) -> bool {
        match self {
            FolderError::MissingData
            | FolderError::AmbiguousData { .. }
            | FolderError::Parse { .. }
            | FolderError::InvalidPayload { .. } => false,
            FolderError::Read { .. } => true,
            FolderError::RecordStore(e) => e.is_retryable(),
        }
    }
}

/// Errors from the structured-record backend.
#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("record store unreachable: {0}")]
    Connection(#[source] sqlx::Error),

    #[error("record store rejected the write: {0}")]
    Rejected(#[source] sqlx::Error),

    #[error("record store migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl RecordStoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RecordStoreError::Connection(_))
    }
}

impl From<sqlx::Error> for RecordStoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed => RecordStoreError::Connection(err),
            _ => RecordStoreError::Rejected(err),
        }
    }
}

/// Errors from the blob-store backend, classified per image.
#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("blob store rejected {key}: {message}")]
    Rejected { key: String, message: String },

    #[error("blob store unreachable for {key}: {message}")]
    Transport { key: String, message: String },
}

impl BlobStoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BlobStoreError::Transport { .. })
    }
}
