//! Error types for the onboarding engine.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Blob store error: {0}")]
    Blob(#[from] BlobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Rejections raised at the API boundary, before any store access.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unknown task key: {0}")]
    UnknownTask(String),

    #[error("Field {field} is not accepted by task {task}")]
    UnknownField { task: String, field: String },

    #[error("Field names must not be empty")]
    EmptyFieldName,

    #[error("Upload for field {field} is empty")]
    EmptyUpload { field: String },

    #[error("Invalid file name: {0}")]
    InvalidFileName(String),
}

/// Blob store errors.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("Invalid blob path: {0}")]
    InvalidPath(String),

    #[error("Upload failed for {path}: {reason}")]
    UploadFailed { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error means the addressed tenant or task does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Database(DatabaseError::NotFound { .. }))
    }
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
