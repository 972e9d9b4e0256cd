//! # Claim Bucketing Pipeline
//!
//! Turns a change feed of individually adjudicated claims into grouped,
//! threshold-gated, auditable bucket releases.
//!
//! ## Architecture
//!
//! ```text
//! claim_changes (feed) ──▶ FeedConsumer ──▶ PipelineEngine
//!                              │                 │
//!                       feed_checkpoints         ├─ ClaimFilter
//!                                                ├─ RuleResolver   (ConfigSnapshot)
//!                                                ├─ Aggregator     (KeyedLocks)
//!                                                ├─ thresholds / commit
//!                                                └─ LifecycleManager ──▶ ReleaseSink
//! ```
//!
//! **Key Principle:** configuration links are identifiers. Buckets carry a
//! `rule_id`; thresholds and commit criteria are looked up by that id in
//! the current snapshot, never through a held entity.
//!
//! Delivery is at-least-once. Aggregation is idempotent per claim id, so
//! replaying the feed (checkpoint reset or `mark_all_unprocessed`) never
//! double-counts.
//!
//! ## Module Organization
//!
//! - `types` - Claims, configuration entities, buckets, audit records
//! - `error` - `StoreError` and `EngineError`
//! - `store` - Storage contracts (feed, checkpoints, configuration, buckets)
//! - `db` - SQLite implementation of every contract
//! - `config` - Environment configuration
//! - `filter` - Feed payload to `Claim`
//! - `expression` - CUSTOM rule predicate language
//! - `snapshot` - Configuration snapshot and TTL cache
//! - `resolver` - Priority-ordered rule resolution
//! - `locks` - Per-grouping-key serialization
//! - `aggregator` - Find-or-create bucket and accumulate
//! - `thresholds` - CLAIM_COUNT / AMOUNT / TIME / HYBRID evaluation
//! - `commit` - AUTO / MANUAL / HYBRID commit policy
//! - `lifecycle` - Bucket state machine and approval audit
//! - `release` - Release notices for the file generator
//! - `engine` - Per-claim orchestration
//! - `ingestion` - Checkpointed feed consumer loop

pub mod types;
pub mod error;
pub mod store;
pub mod db;
pub mod config;
pub mod filter;
pub mod expression;
pub mod snapshot;
pub mod resolver;
pub mod locks;
pub mod aggregator;
pub mod thresholds;
pub mod commit;
pub mod lifecycle;
pub mod release;
pub mod engine;
pub mod ingestion;

// Re-export commonly used types
pub use types::{
    Actor, ApprovalAction, Bucket, BucketId, BucketStatus, Claim, FeedPosition, ReleaseNotice,
    RuleId,
};
pub use error::{EngineError, StoreError};
pub use store::{BucketStore, CheckpointStore, ConfigStore, FeedSource};
pub use db::SqliteStore;
pub use config::PipelineConfig;
pub use release::{ChannelReleaseSink, LogReleaseSink, ReleaseSink};
pub use engine::{ClaimOutcome, PipelineEngine};
pub use lifecycle::LifecycleManager;
pub use ingestion::{start_feed_consumer, BatchReport, FeedConsumer};
