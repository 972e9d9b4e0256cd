//! Error types for the bucketing pipeline

use super::types::{ApprovalAction, BucketId, BucketStatus};
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a storage contract
#[derive(Error, Debug)]
pub enum StoreError {
    /// Store unreachable or the call failed mid-flight; retry later
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A conditional update found the row in an unexpected state
    #[error("conflicting update: {0}")]
    Conflict(String),
    /// Stored data cannot be decoded into a domain value
    #[error("corrupt stored data: {0}")]
    Corrupt(String),
}

/// Engine-level error
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("no active bucketing rules are configured")]
    NoActiveRules,

    #[error("bucket {0} not found")]
    BucketNotFound(BucketId),

    #[error("bucket {bucket_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        bucket_id: BucketId,
        from: BucketStatus,
        to: BucketStatus,
    },

    #[error("bucket {bucket_id}: {action} is not allowed in status {status}")]
    ActionNotAllowed {
        bucket_id: BucketId,
        action: ApprovalAction,
        status: BucketStatus,
    },

    #[error("bucket {bucket_id}: threshold evaluation is not allowed in status {status}")]
    EvaluationNotAllowed {
        bucket_id: BucketId,
        status: BucketStatus,
    },

    #[error("actor '{actor}' lacks a role permitting {action} on bucket {bucket_id}")]
    PermissionDenied {
        bucket_id: BucketId,
        actor: String,
        action: ApprovalAction,
    },

    #[error("bucket {bucket_id} is missing configuration: {detail}")]
    MissingConfiguration { bucket_id: BucketId, detail: String },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The task processing an event panicked or was cancelled
    #[error("event processing aborted: {0}")]
    Aborted(String),
}

impl EngineError {
    /// Transient errors are retried on the next poll tick
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Store(StoreError::Unavailable(_))
                | EngineError::Store(StoreError::Conflict(_))
                | EngineError::Timeout(_)
                | EngineError::NoActiveRules
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(EngineError::NoActiveRules.is_transient());
        assert!(EngineError::Store(StoreError::Unavailable("locked".into())).is_transient());
        assert!(!EngineError::Store(StoreError::Corrupt("bad decimal".into())).is_transient());
        assert!(!EngineError::BucketNotFound(7).is_transient());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = EngineError::InvalidTransition {
            bucket_id: 3,
            from: BucketStatus::PendingApproval,
            to: BucketStatus::Completed,
        };
        assert_eq!(
            err.to_string(),
            "bucket 3: illegal transition PENDING_APPROVAL -> COMPLETED"
        );
    }
}
