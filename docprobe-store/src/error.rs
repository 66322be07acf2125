use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("job already exists: {0}")]
    JobExists(Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("value at {key} is not a counter")]
    NotACounter { key: String },
}
