use std::{path::PathBuf, time::Duration};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("document id already registered: {0}")]
    DuplicateId(String),

    #[error("could not ingest document: {0}")]
    Ingest(String),

    #[error("{service} call failed: {message}")]
    ExternalService {
        service: &'static str,
        message: String,
        retryable: bool,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("embedding dimension mismatch: index has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("background task failed: {0}")]
    Task(String),

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

impl Error {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ExternalService { retryable, .. } => *retryable,
            Error::Timeout { .. } => true,
            _ => false,
        }
    }

    pub fn external(
        service: &'static str,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Error::ExternalService {
            service,
            message: message.into(),
            retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::external("answerer", "503", true).is_retryable());
        assert!(!Error::external("answerer", "400", false).is_retryable());
        assert!(
            Error::Timeout {
                operation: "embed",
                after: Duration::from_secs(1),
            }
            .is_retryable()
        );
        assert!(!Error::Validation("empty".into()).is_retryable());
    }
}
