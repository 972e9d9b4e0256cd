//! Storage contracts consumed by the engine
//!
//! The engine depends only on these traits. `db::SqliteStore` implements all
//! of them on a single SQLite database.
//!
//! Configuration lookups take identifiers, never entity handles: thresholds
//! and commit criteria are fetched with the `RuleId` stored on the bucket.

use super::error::StoreError;
use super::types::{
    ApprovalLogEntry, Bucket, BucketId, BucketStatus, BucketingRule, Checkpoint, CommitCriteria,
    FeedEvent, FeedPosition, NewBucket, ProcessingLogEntry, RuleId, Threshold,
};
use async_trait::async_trait;

pub type StoreResult<T> = Result<T, StoreError>;

/// Ordered, replayable stream of claim mutations
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Events strictly after `after`, ordered by position, at most `limit`
    async fn fetch_since(&self, after: FeedPosition, limit: usize) -> StoreResult<Vec<FeedEvent>>;
}

/// Durable consumer checkpoints and replay control
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Returns `Checkpoint::initial` when the consumer has never committed
    async fn load_checkpoint(&self, consumer_id: &str) -> StoreResult<Checkpoint>;

    /// Advance the checkpoint and add `processed` to the running total
    async fn save_checkpoint(
        &self,
        consumer_id: &str,
        position: FeedPosition,
        processed: i64,
        now: i64,
    ) -> StoreResult<Checkpoint>;

    /// Move the checkpoint to an earlier (or later) position
    async fn reset_checkpoint(
        &self,
        consumer_id: &str,
        position: FeedPosition,
        now: i64,
    ) -> StoreResult<Checkpoint>;

    /// Rewind every consumer to the start of the feed and bump its epoch
    ///
    /// Returns the number of consumers rewound.
    async fn mark_all_unprocessed(&self, now: i64) -> StoreResult<usize>;
}

/// Read-only configuration
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn active_rules(&self) -> StoreResult<Vec<BucketingRule>>;

    async fn thresholds_for_rule(&self, rule_id: RuleId) -> StoreResult<Vec<Threshold>>;

    /// Active criteria linked to the rule (lowest id first)
    async fn commit_criteria_for_rule(&self, rule_id: RuleId) -> StoreResult<Vec<CommitCriteria>>;

    async fn payer_exists(&self, payer_key: &str) -> StoreResult<bool>;

    async fn payee_exists(&self, payee_key: &str) -> StoreResult<bool>;
}

/// Result of appending one claim to a bucket
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulation {
    /// Count and amount updated, processing log written
    Applied(Bucket),
    /// Claim id already recorded as processed; nothing changed
    Duplicate(Bucket),
}

impl Accumulation {
    pub fn bucket(&self) -> &Bucket {
        match self {
            Accumulation::Applied(bucket) | Accumulation::Duplicate(bucket) => bucket,
        }
    }
}

/// Buckets and their audit trails
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn get_bucket(&self, bucket_id: BucketId) -> StoreResult<Option<Bucket>>;

    /// Oldest open (ACCUMULATING or MISSING_CONFIGURATION) bucket for the key
    async fn find_open_bucket(&self, grouping_key: &str) -> StoreResult<Option<Bucket>>;

    async fn create_bucket(&self, new_bucket: NewBucket) -> StoreResult<Bucket>;

    /// True if the claim id was already counted into any bucket
    async fn claim_already_processed(&self, claim_id: &str) -> StoreResult<bool>;

    /// Bucket the claim was counted into, if it was processed
    async fn bucket_for_claim(&self, claim_id: &str) -> StoreResult<Option<Bucket>>;

    /// Atomically add one processed claim to the bucket
    ///
    /// Increments the claim count, adds the paid amount and writes the
    /// processing-log entry in one transaction. Idempotent on claim id.
    async fn accumulate(
        &self,
        bucket_id: BucketId,
        entry: &ProcessingLogEntry,
    ) -> StoreResult<Accumulation>;

    /// Persist a lifecycle transition computed by the lifecycle manager
    ///
    /// Conditional on the stored status still being `expected`; otherwise
    /// fails with `StoreError::Conflict`. The approval entry, if any, is
    /// written in the same transaction.
    async fn save_transition(
        &self,
        bucket: &Bucket,
        expected: BucketStatus,
        approval: Option<&ApprovalLogEntry>,
    ) -> StoreResult<Bucket>;

    /// Attach an error to the bucket without changing its status
    async fn record_error(&self, bucket_id: BucketId, message: &str, now: i64) -> StoreResult<()>;

    async fn append_processing_log(&self, entry: &ProcessingLogEntry) -> StoreResult<()>;

    async fn processing_log(&self, bucket_id: BucketId) -> StoreResult<Vec<ProcessingLogEntry>>;

    async fn approval_log(&self, bucket_id: BucketId) -> StoreResult<Vec<ApprovalLogEntry>>;

    /// Identifiers of the claims counted into the bucket, in arrival order
    async fn claim_ids(&self, bucket_id: BucketId) -> StoreResult<Vec<String>>;

    async fn buckets_in_status(&self, status: BucketStatus) -> StoreResult<Vec<Bucket>>;
}
