//! Protocol error taxonomy.
//!
//! Every mutating entry point checks all of its preconditions before it
//! touches any state, so an `Err` always means nothing changed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Malformed or out-of-range input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Operation invalid for the current lifecycle state.
    #[error("invalid state: {0}")]
    State(String),

    /// Caller lacks the required role or capability.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// Idempotency violation (double vote, double claim, double release).
    #[error("already done: {0}")]
    AlreadyDone(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// Time window violated.
    #[error("deadline violation: {0}")]
    Deadline(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("protocol is paused")]
    Paused,
}

/// Fieldless discriminant of [`Error`], used for matching and transport mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    State,
    Authorization,
    AlreadyDone,
    InsufficientFunds,
    Deadline,
    NotFound,
    Paused,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::State => "state",
            Self::Authorization => "authorization",
            Self::AlreadyDone => "already_done",
            Self::InsufficientFunds => "insufficient_funds",
            Self::Deadline => "deadline",
            Self::NotFound => "not_found",
            Self::Paused => "paused",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::State(_) => ErrorKind::State,
            Self::Authorization(_) => ErrorKind::Authorization,
            Self::AlreadyDone(_) => ErrorKind::AlreadyDone,
            Self::InsufficientFunds(_) => ErrorKind::InsufficientFunds,
            Self::Deadline(_) => ErrorKind::Deadline,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Paused => ErrorKind::Paused,
        }
    }

    pub(crate) fn task_not_found(id: u64) -> Self {
        Self::NotFound(format!("task {id}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
