//! Bucket lifecycle: the only writer of bucket status
//!
//! `transition` is the pure state machine: it validates an event against
//! the bucket's current status and returns the next bucket value. The
//! `LifecycleManager` wraps it with per-key serialization, role checks,
//! configuration checks, persistence (conditional on the status it read)
//! and the release notice emitted whenever a bucket enters GENERATING.
//!
//! Administrative entry points take a bucket id, never a bucket value, and
//! re-read the bucket after taking the grouping-key lock.

use super::aggregator::configuration_gap;
use super::error::EngineError;
use super::locks::KeyedLocks;
use super::release::ReleaseSink;
use super::snapshot::SnapshotCache;
use super::store::{BucketStore, ConfigStore};
use super::types::{
    Actor, ApprovalAction, ApprovalLogEntry, Bucket, BucketId, BucketStatus, Clock, ReleaseNotice,
};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

/// Something that moves a bucket along its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Threshold fired, commit policy wants a human
    RequestApproval,
    /// Threshold fired, commit policy releases directly
    AutoRelease,
    Approve { actor: String },
    Reject,
    Override { actor: String },
    Redrive,
    GenerationSucceeded,
    GenerationFailed { message: String },
    ConfigurationMissing { detail: String },
    ConfigurationRestored,
}

impl LifecycleEvent {
    pub fn target(&self) -> BucketStatus {
        match self {
            LifecycleEvent::RequestApproval => BucketStatus::PendingApproval,
            LifecycleEvent::AutoRelease
            | LifecycleEvent::Approve { .. }
            | LifecycleEvent::Override { .. }
            | LifecycleEvent::Redrive => BucketStatus::Generating,
            LifecycleEvent::Reject | LifecycleEvent::ConfigurationRestored => BucketStatus::Accumulating,
            LifecycleEvent::GenerationSucceeded => BucketStatus::Completed,
            LifecycleEvent::GenerationFailed { .. } => BucketStatus::Failed,
            LifecycleEvent::ConfigurationMissing { .. } => BucketStatus::MissingConfiguration,
        }
    }

    fn sources(&self) -> &'static [BucketStatus] {
        use BucketStatus::*;
        match self {
            LifecycleEvent::RequestApproval | LifecycleEvent::AutoRelease => &[Accumulating],
            LifecycleEvent::Approve { .. } | LifecycleEvent::Reject => &[PendingApproval],
            LifecycleEvent::Override { .. } => &[Accumulating, PendingApproval],
            LifecycleEvent::Redrive => &[Failed],
            LifecycleEvent::GenerationSucceeded | LifecycleEvent::GenerationFailed { .. } => {
                &[Generating]
            }
            LifecycleEvent::ConfigurationMissing { .. } => {
                &[Accumulating, PendingApproval, Generating, Failed]
            }
            LifecycleEvent::ConfigurationRestored => &[MissingConfiguration],
        }
    }

    /// Audit action for operator-driven events
    pub fn action(&self) -> Option<ApprovalAction> {
        match self {
            LifecycleEvent::Approve { .. } => Some(ApprovalAction::Approve),
            LifecycleEvent::Reject => Some(ApprovalAction::Reject),
            LifecycleEvent::Override { .. } => Some(ApprovalAction::Override),
            LifecycleEvent::Redrive => Some(ApprovalAction::Redrive),
            _ => None,
        }
    }

    /// Reject the event if the bucket's status does not allow it
    pub fn check(&self, bucket: &Bucket) -> Result<(), EngineError> {
        let from = bucket.status;
        let to = self.target();
        if self.sources().contains(&from) && from.can_transition_to(to) {
            return Ok(());
        }

        Err(match self.action() {
            Some(action) => EngineError::ActionNotAllowed {
                bucket_id: bucket.id,
                action,
                status: from,
            },
            None => EngineError::InvalidTransition {
                bucket_id: bucket.id,
                from,
                to,
            },
        })
    }
}

/// Apply one event to a bucket value
pub fn transition(bucket: &Bucket, event: &LifecycleEvent, now: i64) -> Result<Bucket, EngineError> {
    event.check(bucket)?;

    let mut next = bucket.clone();
    next.status = event.target();
    next.updated_at = now;

    match event {
        LifecycleEvent::RequestApproval => {
            next.awaiting_approval_since = Some(now);
        }
        LifecycleEvent::AutoRelease => {
            next.generation_started_at = Some(now);
            next.generation_completed_at = None;
        }
        LifecycleEvent::Approve { actor } | LifecycleEvent::Override { actor } => {
            next.approved_by = Some(actor.clone());
            next.approved_at = Some(now);
            next.generation_started_at = Some(now);
            next.generation_completed_at = None;
        }
        LifecycleEvent::Redrive => {
            next.generation_started_at = Some(now);
            next.generation_completed_at = None;
            next.last_error = None;
            next.last_error_at = None;
        }
        LifecycleEvent::Reject => {
            next.rejection_count += 1;
            next.awaiting_approval_since = None;
        }
        LifecycleEvent::GenerationSucceeded => {
            next.generation_completed_at = Some(now);
        }
        LifecycleEvent::GenerationFailed { message: text }
        | LifecycleEvent::ConfigurationMissing { detail: text } => {
            next.last_error = Some(text.clone());
            next.last_error_at = Some(now);
        }
        LifecycleEvent::ConfigurationRestored => {
            next.last_error = None;
            next.last_error_at = None;
        }
    }

    Ok(next)
}

pub struct LifecycleManager {
    config: Arc<dyn ConfigStore>,
    buckets: Arc<dyn BucketStore>,
    sink: Arc<dyn ReleaseSink>,
    snapshots: Arc<SnapshotCache>,
    locks: Arc<KeyedLocks>,
    now_fn: Clock,
}

impl LifecycleManager {
    pub fn new(
        config: Arc<dyn ConfigStore>,
        buckets: Arc<dyn BucketStore>,
        sink: Arc<dyn ReleaseSink>,
        snapshots: Arc<SnapshotCache>,
        locks: Arc<KeyedLocks>,
        now_fn: Clock,
    ) -> Self {
        Self {
            config,
            buckets,
            sink,
            snapshots,
            locks,
            now_fn,
        }
    }

    /// PENDING_APPROVAL -> GENERATING
    pub async fn approve(
        &self,
        bucket_id: BucketId,
        actor: &Actor,
        comments: Option<&str>,
        scheduled_for: Option<i64>,
    ) -> Result<Bucket, EngineError> {
        let event = LifecycleEvent::Approve {
            actor: actor.name.clone(),
        };
        self.administer(bucket_id, event, actor, comments, scheduled_for)
            .await
    }

    /// PENDING_APPROVAL -> ACCUMULATING
    pub async fn reject(
        &self,
        bucket_id: BucketId,
        actor: &Actor,
        comments: Option<&str>,
    ) -> Result<Bucket, EngineError> {
        self.administer(bucket_id, LifecycleEvent::Reject, actor, comments, None)
            .await
    }

    /// ACCUMULATING / PENDING_APPROVAL -> GENERATING, regardless of thresholds
    pub async fn override_release(
        &self,
        bucket_id: BucketId,
        actor: &Actor,
        comments: Option<&str>,
    ) -> Result<Bucket, EngineError> {
        let event = LifecycleEvent::Override {
            actor: actor.name.clone(),
        };
        self.administer(bucket_id, event, actor, comments, None).await
    }

    /// FAILED -> GENERATING; the release notice is sent again
    pub async fn redrive(
        &self,
        bucket_id: BucketId,
        actor: &Actor,
        comments: Option<&str>,
    ) -> Result<Bucket, EngineError> {
        self.administer(bucket_id, LifecycleEvent::Redrive, actor, comments, None)
            .await
    }

    /// File generation finished: GENERATING -> COMPLETED
    pub async fn complete_generation(&self, bucket_id: BucketId) -> Result<Bucket, EngineError> {
        let (_guard, bucket) = self.lock_bucket(bucket_id).await?;
        self.apply_locked(&bucket, LifecycleEvent::GenerationSucceeded, None)
            .await
    }

    /// File generation failed: GENERATING -> FAILED
    pub async fn fail_generation(
        &self,
        bucket_id: BucketId,
        message: &str,
    ) -> Result<Bucket, EngineError> {
        let (_guard, bucket) = self.lock_bucket(bucket_id).await?;
        let event = LifecycleEvent::GenerationFailed {
            message: message.to_string(),
        };
        self.apply_locked(&bucket, event, None).await
    }

    /// Generation-time discovery of missing payer/payee configuration
    pub async fn report_missing_configuration(
        &self,
        bucket_id: BucketId,
        detail: &str,
    ) -> Result<Bucket, EngineError> {
        let (_guard, bucket) = self.lock_bucket(bucket_id).await?;
        self.mark_missing_locked(&bucket, detail).await
    }

    /// Take the grouping-key lock of a bucket and read it fresh
    pub(crate) async fn lock_bucket(
        &self,
        bucket_id: BucketId,
    ) -> Result<(OwnedMutexGuard<()>, Bucket), EngineError> {
        let key = self
            .buckets
            .get_bucket(bucket_id)
            .await?
            .ok_or(EngineError::BucketNotFound(bucket_id))?
            .grouping_key;

        let guard = self.locks.lock(&key).await;

        let bucket = self
            .buckets
            .get_bucket(bucket_id)
            .await?
            .ok_or(EngineError::BucketNotFound(bucket_id))?;
        Ok((guard, bucket))
    }

    async fn administer(
        &self,
        bucket_id: BucketId,
        event: LifecycleEvent,
        actor: &Actor,
        comments: Option<&str>,
        scheduled_for: Option<i64>,
    ) -> Result<Bucket, EngineError> {
        let (_guard, bucket) = self.lock_bucket(bucket_id).await?;
        event.check(&bucket)?;

        let Some(action) = event.action() else {
            return Err(EngineError::InvalidTransition {
                bucket_id: bucket.id,
                from: bucket.status,
                to: event.target(),
            });
        };

        self.snapshots.invalidate().await;
        let snapshot = self.snapshots.get().await?;

        let criteria = snapshot.commit_criteria_for_rule(bucket.rule_id);
        let required: &[String] = match (action, criteria) {
            (ApprovalAction::Approve | ApprovalAction::Reject, Some(c)) => &c.required_approval_roles,
            (ApprovalAction::Override | ApprovalAction::Redrive, Some(c)) => &c.override_permissions,
            (_, None) => &[],
        };
        if !actor.holds_any(required) {
            log::warn!(
                "⚠️  {} on bucket {} denied for '{}' (needs one of {:?})",
                action,
                bucket.id,
                actor.name,
                required
            );
            return Err(EngineError::PermissionDenied {
                bucket_id: bucket.id,
                actor: actor.name.clone(),
                action,
            });
        }

        if action != ApprovalAction::Reject {
            if let Some(detail) = configuration_gap(self.config.as_ref(), &bucket, &snapshot).await? {
                self.mark_missing_locked(&bucket, &detail).await?;
                return Err(EngineError::MissingConfiguration {
                    bucket_id: bucket.id,
                    detail,
                });
            }
        }

        let entry = ApprovalLogEntry {
            bucket_id: bucket.id,
            action,
            actor: actor.name.clone(),
            comments: comments.map(str::to_string),
            scheduled_for,
            created_at: (self.now_fn)(),
        };

        log::info!(
            "👤 {} on bucket {} by '{}'{}",
            action,
            bucket.id,
            actor.name,
            comments.map(|c| format!(": {}", c)).unwrap_or_default()
        );

        self.apply_locked(&bucket, event, Some(entry)).await
    }

    /// Move to MISSING_CONFIGURATION, or refresh the error if already there
    ///
    /// Caller holds the bucket's grouping-key lock.
    pub(crate) async fn mark_missing_locked(
        &self,
        bucket: &Bucket,
        detail: &str,
    ) -> Result<Bucket, EngineError> {
        if bucket.status == BucketStatus::MissingConfiguration {
            let now = (self.now_fn)();
            self.buckets.record_error(bucket.id, detail, now).await?;
            return self
                .buckets
                .get_bucket(bucket.id)
                .await?
                .ok_or(EngineError::BucketNotFound(bucket.id));
        }

        log::warn!("⚠️  Bucket {} missing configuration: {}", bucket.id, detail);
        let event = LifecycleEvent::ConfigurationMissing {
            detail: detail.to_string(),
        };
        self.apply_locked(bucket, event, None).await
    }

    /// Validate, persist and, on entry to GENERATING, release
    ///
    /// Caller holds the bucket's grouping-key lock.
    pub(crate) async fn apply_locked(
        &self,
        bucket: &Bucket,
        event: LifecycleEvent,
        approval: Option<ApprovalLogEntry>,
    ) -> Result<Bucket, EngineError> {
        let now = (self.now_fn)();
        let next = transition(bucket, &event, now)?;
        let saved = self
            .buckets
            .save_transition(&next, bucket.status, approval.as_ref())
            .await?;

        log::info!(
            "🔄 Bucket {}: {} -> {}",
            saved.id,
            bucket.status,
            saved.status
        );

        if saved.status == BucketStatus::Generating {
            return self.emit_release(saved).await;
        }
        Ok(saved)
    }

    /// Hand the notice to the sink; an undeliverable notice fails the bucket
    async fn emit_release(&self, bucket: Bucket) -> Result<Bucket, EngineError> {
        let delivery = match self.buckets.claim_ids(bucket.id).await {
            Ok(claim_ids) => {
                let notice = ReleaseNotice {
                    bucket_id: bucket.id,
                    rule_id: bucket.rule_id,
                    payer_key: bucket.payer_key.clone(),
                    payee_key: bucket.payee_key.clone(),
                    bin_number: bucket.bin_number.clone(),
                    pcn: bucket.pcn.clone(),
                    claim_count: bucket.claim_count,
                    total_amount: bucket.total_amount,
                    claim_ids,
                    released_at: bucket.generation_started_at.unwrap_or(bucket.updated_at),
                };
                self.sink.release(notice).await.map_err(|e| e.to_string())
            }
            Err(e) => Err(e.to_string()),
        };

        match delivery {
            Ok(()) => {
                log::info!(
                    "🚀 Bucket {} released for generation ({} claims, total {})",
                    bucket.id,
                    bucket.claim_count,
                    bucket.total_amount
                );
                Ok(bucket)
            }
            Err(reason) => {
                log::error!("❌ Release notice for bucket {} undeliverable: {}", bucket.id, reason);
                let failed = transition(
                    &bucket,
                    &LifecycleEvent::GenerationFailed {
                        message: format!("release notice undeliverable: {}", reason),
                    },
                    (self.now_fn)(),
                )?;
                Ok(self
                    .buckets
                    .save_transition(&failed, BucketStatus::Generating, None)
                    .await?)
            }
        }
    }
}
