use thiserror::Error;

/// Store-layer failure classes. Policy rejection is deliberately *not* an
/// error — it is a verdict the caller already holds; the store only refuses
/// to persist a rejected candidate.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Bad arguments or malformed input. Not retried.
    #[error("validation: {0}")]
    Validation(String),

    /// A schema invariant would be violated (duplicate content hash within
    /// a scope, broken content addressing). Not retried.
    #[error("integrity: {0}")]
    Integrity(String),

    /// Lock contention or a file that vanished mid-operation. Write paths
    /// retry these with bounded backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// Corruption or an invariant the store cannot recover from.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &err {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    StoreError::Transient(err.to_string())
                }
                ErrorCode::ConstraintViolation => StoreError::Integrity(err.to_string()),
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    StoreError::Fatal(err.to_string())
                }
                _ => StoreError::Fatal(err.to_string()),
            },
            rusqlite::Error::QueryReturnedNoRows => {
                StoreError::Validation("no matching row".to_string())
            }
            _ => StoreError::Fatal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Validation(format!("serialization: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
