//! The distributor error taxonomy.
//!
//! Every error that crosses the supervisor boundary has a variant here;
//! subsystems return `Result<T>` and let the generation loop classify what
//! is fatal, what regenerates the inner task tree, and what is swallowed.

use crate::ids::ServerId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DistributorError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DistributorError {
    #[error("move-keys lock was taken by another owner")]
    MoveKeysConflict,
    #[error("transaction conflicted and should be retried")]
    TransactionConflict,
    #[error("data move was cancelled")]
    DataMoveCancelled,
    #[error("destination team for data move not found")]
    DataMoveDestTeamNotFound,
    #[error("distributor configuration changed")]
    DdConfigChanged,
    #[error("audit retries exhausted")]
    AuditStorageFailed,
    #[error("audit found a storage inconsistency")]
    AuditStorageError,
    #[error("an audit of this type is already running")]
    AuditExceededRequestLimit,
    #[error("operation not implemented")]
    NotImplemented,
    #[error("snapshot failed on storage workers")]
    SnapStorageFailed,
    #[error("snapshot failed on tlog workers")]
    SnapTlogFailed,
    #[error("snapshot failed on coordinators")]
    SnapCoordFailed,
    #[error("failed to disable tlog pops")]
    SnapDisableTlogPopFailed,
    #[error("failed to re-enable tlog pops")]
    SnapEnableTlogPopFailed,
    #[error("snapshot cannot run across a recovery")]
    SnapWithRecoveryUnsupported,
    #[error("duplicate snapshot request")]
    DuplicateSnapshotRequest,
    #[error("operation failed")]
    OperationFailed,
    #[error("operation timed out")]
    TimedOut,
    #[error("request may or may not have been delivered")]
    RequestMaybeDelivered,
    #[error("reply channel was dropped")]
    BrokenPromise,
    #[error("task was cancelled")]
    Cancelled,
    #[error("audit generation should be retried")]
    Retry,
    #[error("storage server {0} must be removed")]
    RemoveFailedServer(ServerId),
    #[error("internal error: {0}")]
    Internal(String),
}

impl DistributorError {
    pub fn internal(message: impl Into<String>) -> Self {
        DistributorError::Internal(message.into())
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, DistributorError::Cancelled)
    }

    /// Errors the queue/tracker consumers are expected to surface during a
    /// normal generation teardown; the supervisor logs them without
    /// escalating past the bootstrap loop.
    pub fn is_normal_queue_error(&self) -> bool {
        matches!(
            self,
            DistributorError::MoveKeysConflict
                | DistributorError::BrokenPromise
                | DistributorError::DataMoveCancelled
                | DistributorError::DataMoveDestTeamNotFound
        )
    }

    /// Errors the top-level router treats as a normal end of the
    /// distributor role rather than a crash.
    pub fn is_normal_distributor_error(&self) -> bool {
        matches!(
            self,
            DistributorError::Cancelled
                | DistributorError::BrokenPromise
                | DistributorError::MoveKeysConflict
                | DistributorError::DataMoveCancelled
                | DistributorError::DataMoveDestTeamNotFound
                | DistributorError::DdConfigChanged
                | DistributorError::AuditStorageFailed
        )
    }
}
