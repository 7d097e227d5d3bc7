//! Error types for the Curtain actor.

use thiserror::Error;

/// A set-position payload that cannot be turned into a curtain command.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CurtainError {
    /// A number outside 0..=100.
    #[error("invalid position {0}% (expected 0 to 100)")]
    InvalidPosition(i64),

    #[error("unexpected payload {0:?} (expected 'OPEN', 'CLOSE', 'STOP' or a position)")]
    UnexpectedPayload(String),
}
