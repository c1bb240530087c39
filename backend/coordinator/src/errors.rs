//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A command or query rejected by the protocol core.
    #[error(transparent)]
    Protocol(#[from] ecotask_protocol::Error),

    /// The request itself is malformed (missing caller, bad query, ...).
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The persisted snapshot cannot be turned back into a protocol instance.
    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
