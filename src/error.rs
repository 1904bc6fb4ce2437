//! Coordinator-wide error types.
//!
//! One flat error enum covers the whole error taxonomy of the coordinator:
//! shard connectivity, lock acquisition, quorum checks, commit/replication
//! outcomes, and recovery replay. Component boundaries translate raw I/O
//! faults into one of these kinds before propagating.

use thiserror::Error;

use crate::types::ShardId;

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, CoordError>;

/// Error type for all coordinator operations.
#[derive(Debug, Error)]
pub enum CoordError {
    /// The shard could not be reached (connect or mid-session failure).
    #[error("Shard {shard} unreachable: {reason}")]
    ShardUnreachable { shard: ShardId, reason: String },

    /// Authentication against the shard failed.
    #[error("Authentication failed for shard {shard}")]
    AuthFailed { shard: ShardId },

    /// The shard id is not part of the configured topology.
    #[error("Invalid shard id: {0}")]
    InvalidShard(ShardId),

    /// Distributed lock could not be acquired within the timeout.
    #[error("Lock unavailable for '{resource}' after {waited_ms} ms")]
    LockUnavailable { resource: String, waited_ms: u64 },

    /// Id allocation requires the central shard or both partition shards.
    #[error("Insufficient quorum for id allocation: {live} of {total} shards live")]
    InsufficientQuorum { live: usize, total: usize },

    /// The commit on the primary shard failed; the transaction was aborted.
    #[error("Primary commit failed on shard {shard}: {reason}")]
    PrimaryCommitFailed { shard: ShardId, reason: String },

    /// Replication of a committed statement to a secondary failed.
    #[error("Replication to shard {target} failed: {reason}")]
    ReplicationFailed { target: ShardId, reason: String },

    /// A unique-key constraint was violated.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// No live shard can answer the request.
    #[error("No live shard available")]
    Unavailable,

    /// The checkpoint mutex is held by another process.
    #[error("Checkpoint mutex held by pid {0}")]
    MutexHeld(i64),

    /// Malformed SQL or parameters handed to a session.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error (should not occur in normal operation).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordError {
    /// Creates an unreachable-shard error.
    pub fn unreachable(shard: ShardId, reason: impl Into<String>) -> Self {
        CoordError::ShardUnreachable {
            shard,
            reason: reason.into(),
        }
    }

    /// Returns true if this error indicates a unique-key violation.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, CoordError::DuplicateKey(_))
    }

    /// Returns true if this error indicates the shard could not be reached.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            CoordError::ShardUnreachable { .. } | CoordError::Unavailable
        )
    }

    /// Returns true if the caller may retry the whole operation.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CoordError::ShardUnreachable { .. }
                | CoordError::LockUnavailable { .. }
                | CoordError::DuplicateKey(_)
        )
    }

    /// Process exit code for CLI/RPC embeddings.
    ///
    /// 1 input error, 2 shard unavailable, 3 lock unavailable,
    /// 4 quorum insufficient, 5 internal error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CoordError::InvalidInput(_) | CoordError::InvalidShard(_) => 1,
            CoordError::ShardUnreachable { .. }
            | CoordError::AuthFailed { .. }
            | CoordError::Unavailable => 2,
            CoordError::LockUnavailable { .. } => 3,
            CoordError::InsufficientQuorum { .. } => 4,
            _ => 5,
        }
    }
}
