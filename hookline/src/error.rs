//! Error types for the delivery engine.

use thiserror::Error;

use crate::event::EventId;

/// Errors surfaced by the engine and its storage backends.
#[derive(Error, Debug)]
pub enum HooklineError {
    /// A row id did not match any queue row.
    #[error("event {0} not found")]
    EventNotFound(EventId),

    /// A cancellation was requested for a row that is already terminal or is
    /// currently leased by a worker.
    #[error("event {0} cannot be cancelled in its current state")]
    NotCancellable(EventId),

    /// A cron expression could not be parsed.
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },

    /// Anything else, usually a database driver error with context attached.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, HooklineError>;
