//! Pipeline Engine - per-claim orchestration
//!
//! ```text
//! FeedEvent
//!     ↓
//! ClaimFilter::accept()          (settled? well-formed?)
//!     ↓
//! RuleResolver::resolve()        (priority order, fallback)
//!     ↓  ── grouping-key lock held from here ──
//! Aggregator::aggregate()        (find-or-create, count in, log)
//!     ↓
//! configuration_gap()            (payer/payee known?)
//!     ↓
//! thresholds::evaluate()         (any linked threshold fired?)
//!     ↓
//! commit::decide()               (auto release or approval)
//!     ↓
//! LifecycleManager               (transition, audit, release notice)
//! ```
//!
//! Accumulation, threshold evaluation and the resulting transition run as
//! one unit under the grouping-key lock, so one threshold crossing yields
//! exactly one transition.

use super::aggregator::{configuration_gap, grouping_key, Aggregator};
use super::commit::{self, CommitDecision};
use super::config::PipelineConfig;
use super::error::EngineError;
use super::filter::{ClaimFilter, FilterOutcome};
use super::lifecycle::{LifecycleEvent, LifecycleManager};
use super::locks::KeyedLocks;
use super::release::ReleaseSink;
use super::resolver::RuleResolver;
use super::snapshot::{ConfigSnapshot, SnapshotCache};
use super::store::{Accumulation, BucketStore, ConfigStore};
use super::thresholds;
use super::types::{
    system_clock, Bucket, BucketId, BucketStatus, Claim, Clock, FeedEvent, ProcessingLogEntry,
};
use std::sync::Arc;

/// What happened to one change event
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// Counted into a bucket; `status` is the bucket status afterwards
    Accumulated {
        claim_id: String,
        bucket_id: BucketId,
        status: BucketStatus,
    },
    /// Already counted earlier (redelivery)
    Duplicate { claim_id: String, bucket_id: BucketId },
    /// Not settled yet
    Skipped { claim_id: String, status: String },
    /// Malformed; recorded in the processing log
    Rejected { claim_id: String, reason: String },
}

/// Pipeline engine orchestrating filter, resolver, aggregator, thresholds,
/// commit policy and lifecycle
pub struct PipelineEngine {
    config: Arc<dyn ConfigStore>,
    buckets: Arc<dyn BucketStore>,
    snapshots: Arc<SnapshotCache>,
    locks: Arc<KeyedLocks>,
    filter: ClaimFilter,
    aggregator: Aggregator,
    lifecycle: LifecycleManager,

    /// Timestamp function (for testing with mock time)
    now_fn: Clock,
}

impl PipelineEngine {
    /// Create an engine on the system clock
    pub fn new(
        config: Arc<dyn ConfigStore>,
        buckets: Arc<dyn BucketStore>,
        sink: Arc<dyn ReleaseSink>,
        settings: &PipelineConfig,
    ) -> Self {
        Self::with_clock(config, buckets, sink, settings, system_clock())
    }

    /// Create an engine with a custom timestamp function
    ///
    /// Used for testing with deterministic timestamps.
    pub fn new_with_timestamp_fn(
        config: Arc<dyn ConfigStore>,
        buckets: Arc<dyn BucketStore>,
        sink: Arc<dyn ReleaseSink>,
        settings: &PipelineConfig,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        Self::with_clock(config, buckets, sink, settings, Arc::from(now_fn))
    }

    fn with_clock(
        config: Arc<dyn ConfigStore>,
        buckets: Arc<dyn BucketStore>,
        sink: Arc<dyn ReleaseSink>,
        settings: &PipelineConfig,
        now_fn: Clock,
    ) -> Self {
        let snapshots = Arc::new(SnapshotCache::new(config.clone(), settings.config_cache_ttl()));
        let locks = Arc::new(KeyedLocks::new());
        let lifecycle = LifecycleManager::new(
            config.clone(),
            buckets.clone(),
            sink,
            snapshots.clone(),
            locks.clone(),
            now_fn.clone(),
        );

        Self {
            aggregator: Aggregator::new(buckets.clone()),
            filter: ClaimFilter::new(settings.settled_statuses.clone()),
            config,
            buckets,
            snapshots,
            locks,
            lifecycle,
            now_fn,
        }
    }

    /// Administrative lifecycle operations (approve, reject, override, ...)
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn snapshots(&self) -> &SnapshotCache {
        &self.snapshots
    }

    pub fn now(&self) -> i64 {
        (self.now_fn)()
    }

    /// Filter, resolve, aggregate and evaluate one change event
    ///
    /// Malformed and unsettled claims are outcomes, not errors. An error
    /// means the event was not handled and must be delivered again.
    pub async fn process_event(&self, event: &FeedEvent) -> Result<ClaimOutcome, EngineError> {
        let fallback_id = format!("feed:{}", event.position);

        match self.filter.accept(&event.payload, &fallback_id) {
            FilterOutcome::Accepted(claim) => self.process_claim(&claim).await,
            FilterOutcome::Skipped { claim_id, status } => {
                log::debug!("⏭️  Claim {} skipped (status {})", claim_id, status);
                Ok(ClaimOutcome::Skipped { claim_id, status })
            }
            FilterOutcome::Rejected { claim_id, reason } => {
                log::warn!("⚠️  Claim {} rejected: {}", claim_id, reason);
                let entry = ProcessingLogEntry::for_rejected_claim(&claim_id, &reason, self.now());
                self.buckets.append_processing_log(&entry).await?;
                Ok(ClaimOutcome::Rejected { claim_id, reason })
            }
        }
    }

    /// Aggregate a settled claim and run its bucket's threshold check
    pub async fn process_claim(&self, claim: &Claim) -> Result<ClaimOutcome, EngineError> {
        let snapshot = self.snapshots.get().await?;
        let rule = RuleResolver::resolve(claim, &snapshot)?;
        let key = grouping_key(rule, claim);

        let _guard = self.locks.lock(&key).await;
        let now = self.now();

        let bucket = match self.aggregator.aggregate(claim, rule, now).await? {
            Accumulation::Applied(bucket) => bucket,
            Accumulation::Duplicate(owner) => {
                log::debug!(
                    "🔁 Claim {} already counted into bucket {}",
                    claim.claim_id,
                    owner.id
                );
                // A crash between counting and evaluating leaves the
                // crossing unevaluated; redelivery picks it up here.
                if owner.grouping_key == key && owner.status == BucketStatus::Accumulating {
                    self.evaluate_locked(owner.clone(), &snapshot, now).await?;
                }
                return Ok(ClaimOutcome::Duplicate {
                    claim_id: claim.claim_id.clone(),
                    bucket_id: owner.id,
                });
            }
        };

        let bucket = match configuration_gap(self.config.as_ref(), &bucket, &snapshot).await? {
            Some(detail) => self.lifecycle.mark_missing_locked(&bucket, &detail).await?,
            None => self.evaluate_locked(bucket, &snapshot, now).await?,
        };

        Ok(ClaimOutcome::Accumulated {
            claim_id: claim.claim_id.clone(),
            bucket_id: bucket.id,
            status: bucket.status,
        })
    }

    /// Forced re-evaluation of one bucket (administrative)
    ///
    /// Reloads configuration first. A MISSING_CONFIGURATION bucket whose
    /// payer/payee are now configured re-enters ACCUMULATING and is
    /// evaluated right away.
    pub async fn evaluate_thresholds(&self, bucket_id: BucketId) -> Result<Bucket, EngineError> {
        let (_guard, bucket) = self.lifecycle.lock_bucket(bucket_id).await?;

        if !bucket.status.is_open() {
            return Err(EngineError::EvaluationNotAllowed {
                bucket_id,
                status: bucket.status,
            });
        }

        self.snapshots.invalidate().await;
        let snapshot = self.snapshots.get().await?;

        if let Some(detail) = configuration_gap(self.config.as_ref(), &bucket, &snapshot).await? {
            self.lifecycle.mark_missing_locked(&bucket, &detail).await?;
            return Err(EngineError::MissingConfiguration { bucket_id, detail });
        }

        let bucket = if bucket.status == BucketStatus::MissingConfiguration {
            log::info!("🔧 Bucket {} configuration restored", bucket_id);
            self.lifecycle
                .apply_locked(&bucket, LifecycleEvent::ConfigurationRestored, None)
                .await?
        } else {
            bucket
        };

        self.evaluate_locked(bucket, &snapshot, self.now()).await
    }

    /// Re-evaluate every ACCUMULATING bucket so TIME thresholds fire
    /// without new claims
    ///
    /// Returns the number of buckets that left ACCUMULATING.
    pub async fn sweep_time_thresholds(&self) -> Result<usize, EngineError> {
        let snapshot = self.snapshots.get().await?;
        let candidates = self.buckets.buckets_in_status(BucketStatus::Accumulating).await?;
        let mut transitioned = 0;

        for candidate in candidates {
            let _guard = self.locks.lock(&candidate.grouping_key).await;

            let bucket = match self.buckets.get_bucket(candidate.id).await? {
                Some(bucket) if bucket.status == BucketStatus::Accumulating => bucket,
                _ => continue,
            };

            match self.evaluate_locked(bucket, &snapshot, self.now()).await {
                Ok(after) if after.status != BucketStatus::Accumulating => transitioned += 1,
                Ok(_) => {}
                Err(e) => {
                    log::warn!("⚠️  Time sweep skipped bucket {}: {}", candidate.id, e);
                }
            }
        }

        self.locks.prune();
        Ok(transitioned)
    }

    /// Threshold check plus commit decision for an ACCUMULATING bucket
    ///
    /// Caller holds the bucket's grouping-key lock.
    async fn evaluate_locked(
        &self,
        bucket: Bucket,
        snapshot: &ConfigSnapshot,
        now: i64,
    ) -> Result<Bucket, EngineError> {
        if bucket.status != BucketStatus::Accumulating {
            return Ok(bucket);
        }

        let linked = snapshot.thresholds_for_rule(bucket.rule_id);
        let Some(fired) = thresholds::evaluate(&bucket, linked, now) else {
            return Ok(bucket);
        };

        let criteria = snapshot.commit_criteria_for_rule(bucket.rule_id);
        let decision = commit::decide(&bucket, criteria);

        log::info!("📊 Bucket {} reached threshold {}", bucket.id, thresholds::describe(fired));
        log::info!("   ├─ Claims: {} | Total: {}", bucket.claim_count, bucket.total_amount);
        log::info!(
            "   └─ Commit: {} ({})",
            decision,
            criteria.map(|c| c.mode.as_str()).unwrap_or("MANUAL default")
        );

        let event = match decision {
            CommitDecision::AutoRelease => LifecycleEvent::AutoRelease,
            CommitDecision::RequireApproval => LifecycleEvent::RequestApproval,
        };
        self.lifecycle.apply_locked(&bucket, event, None).await
    }
}
