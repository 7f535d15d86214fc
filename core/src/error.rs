//! Error types for the coordination protocol.
//!
//! Conflicts between requests are not errors: they are reported as
//! [`crate::Decision::Conflict`]. The variants here are storage failures,
//! deployment defects, and failures of the handler's own stages.

use crate::record::RecordKey;
use crate::recovery_point::RecoveryPoint;
use thiserror::Error;

/// Errors raised by an [`crate::IdempotencyStore`] implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database connection, query or transaction failure.
    #[error("Database error: {0}")]
    Database(String),

    /// No record exists for the key.
    #[error("Idempotency record not found: {0}")]
    NotFound(RecordKey),

    /// A stored row could not be decoded.
    #[error("Corrupt idempotency record: {0}")]
    Corrupt(String),
}

/// Errors raised while admitting, executing or releasing a request.
#[derive(Error, Debug)]
pub enum IdempotencyError {
    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The stage map has no action for the record's recovery point.
    ///
    /// A deployment defect: the handler's stage map does not cover a point
    /// that records in storage can be at. Never retried.
    #[error("No stage registered for recovery point '{0}'")]
    MissingStage(RecoveryPoint),

    /// A single-stage handler was given a record at a custom recovery point.
    #[error("Unexpected recovery point '{0}' for a single-stage handler")]
    UnexpectedRecoveryPoint(RecoveryPoint),

    /// Another execution reclaimed the lock and moved the record.
    #[error("Lock lost: expected recovery point '{expected}', found '{found}'")]
    LockLost {
        /// The point this execution was about to run.
        expected: RecoveryPoint,
        /// The point found in storage.
        found: RecoveryPoint,
    },

    /// Response body could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A stage action failed; its transaction was rolled back.
    #[error("Stage execution failed: {0}")]
    Stage(#[source] anyhow::Error),
}

impl IdempotencyError {
    /// Whether this error signals a deployment defect rather than a runtime failure.
    #[must_use]
    pub const fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::MissingStage(_) | Self::UnexpectedRecoveryPoint(_)
        )
    }
}
