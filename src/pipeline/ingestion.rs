//! Feed consumer - checkpointed, at-least-once claim ingestion
//!
//! Each poll loads the consumer's checkpoint, pulls one bounded batch of
//! change events after it and hands them to the engine in order. The
//! checkpoint advances to the last event the engine finished with; an error
//! stops the batch there, so the failing event and everything after it are
//! delivered again on the next tick.

use super::config::PipelineConfig;
use super::engine::{ClaimOutcome, PipelineEngine};
use super::error::EngineError;
use super::store::{CheckpointStore, FeedSource};
use super::types::{BucketStatus, Checkpoint, FeedEvent, FeedPosition};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Summary of one poll
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub fetched: usize,
    pub processed: usize,
    pub skipped: usize,
    pub rejected: usize,
    pub duplicates: usize,
    /// Buckets that moved to PENDING_APPROVAL during the batch
    pub awaiting_approval: usize,
    /// Buckets that moved to GENERATING during the batch
    pub released: usize,
    /// Checkpoint after the batch, if it moved
    pub checkpoint: Option<FeedPosition>,
    /// Error that stopped the batch early
    pub stopped_by: Option<String>,
}

impl BatchReport {
    fn record(&mut self, outcome: &ClaimOutcome) {
        match outcome {
            ClaimOutcome::Accumulated { status, .. } => {
                self.processed += 1;
                match status {
                    BucketStatus::PendingApproval => self.awaiting_approval += 1,
                    BucketStatus::Generating => self.released += 1,
                    _ => {}
                }
            }
            ClaimOutcome::Duplicate { .. } => self.duplicates += 1,
            ClaimOutcome::Skipped { .. } => self.skipped += 1,
            ClaimOutcome::Rejected { .. } => self.rejected += 1,
        }
    }

    fn handled(&self) -> usize {
        self.processed + self.duplicates + self.skipped + self.rejected
    }
}

pub struct FeedConsumer {
    consumer_id: String,
    feed: Arc<dyn FeedSource>,
    checkpoints: Arc<dyn CheckpointStore>,
    engine: Arc<PipelineEngine>,
    batch_size: usize,
    store_timeout: Duration,
}

impl FeedConsumer {
    pub fn new(
        feed: Arc<dyn FeedSource>,
        checkpoints: Arc<dyn CheckpointStore>,
        engine: Arc<PipelineEngine>,
        settings: &PipelineConfig,
    ) -> Self {
        Self {
            consumer_id: settings.consumer_id.clone(),
            feed,
            checkpoints,
            engine,
            batch_size: settings.batch_size.max(1),
            store_timeout: settings.store_timeout(),
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn engine(&self) -> &Arc<PipelineEngine> {
        &self.engine
    }

    /// Pull and process one batch
    ///
    /// Errors from loading the checkpoint or fetching the batch are
    /// returned; errors while processing events stop the batch and are
    /// reported in `BatchReport::stopped_by`.
    pub async fn poll_once(&self) -> Result<BatchReport, EngineError> {
        let checkpoint = self
            .timed(self.checkpoints.load_checkpoint(&self.consumer_id))
            .await?;
        let events = self
            .timed(self.feed.fetch_since(checkpoint.last_position, self.batch_size))
            .await?;

        let mut report = BatchReport {
            fetched: events.len(),
            ..BatchReport::default()
        };
        if events.is_empty() {
            return Ok(report);
        }

        let mut last_handled = None;
        for event in &events {
            match self.run_step(event).await {
                Ok(outcome) => {
                    report.record(&outcome);
                    last_handled = Some(event.position);
                }
                Err(e) => {
                    if e.is_transient() {
                        log::warn!("⚠️  Event {} not handled, retrying next tick: {}", event.position, e);
                    } else {
                        log::error!("❌ Event {} failed: {}", event.position, e);
                    }
                    report.stopped_by = Some(e.to_string());
                    break;
                }
            }
        }

        if let Some(position) = last_handled {
            let saved = self
                .timed(self.checkpoints.save_checkpoint(
                    &self.consumer_id,
                    position,
                    report.handled() as i64,
                    self.engine.now(),
                ))
                .await?;
            report.checkpoint = Some(saved.last_position);
        }

        Ok(report)
    }

    /// Move this consumer's checkpoint (replay from `position`)
    pub async fn reset_checkpoint(&self, position: FeedPosition) -> Result<Checkpoint, EngineError> {
        log::info!("⏪ Resetting checkpoint of '{}' to {}", self.consumer_id, position);
        self.timed(self.checkpoints.reset_checkpoint(
            &self.consumer_id,
            position,
            self.engine.now(),
        ))
        .await
    }

    /// Rewind every consumer to the start of the feed
    pub async fn mark_all_unprocessed(&self) -> Result<usize, EngineError> {
        log::info!("⏪ Marking the whole feed unprocessed");
        self.timed(self.checkpoints.mark_all_unprocessed(self.engine.now()))
            .await
    }

    /// Process one event on its own task, waiting at most the store timeout
    ///
    /// A timeout stops the batch but never cancels the step itself: a
    /// bucket committed as GENERATING still gets its release notice (or
    /// its FAILED transition) once the step finishes.
    async fn run_step(&self, event: &FeedEvent) -> Result<ClaimOutcome, EngineError> {
        let engine = self.engine.clone();
        let event = event.clone();
        let step = tokio::spawn(async move { engine.process_event(&event).await });

        match tokio::time::timeout(self.store_timeout, step).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(EngineError::Aborted(join.to_string())),
            Err(_) => Err(EngineError::Timeout(self.store_timeout)),
        }
    }

    /// Bound a store-backed call; a timeout is a transient error
    async fn timed<T, E, F>(&self, call: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<EngineError>,
    {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(EngineError::Timeout(self.store_timeout)),
        }
    }
}

/// Run the consumer until `shutdown` flips to true (or its sender drops)
///
/// Main loop:
/// 1. Poll timer: drain the feed batch by batch until a short batch or an error
/// 2. Sweep timer: re-evaluate ACCUMULATING buckets for TIME thresholds
pub async fn start_feed_consumer(
    consumer: Arc<FeedConsumer>,
    poll_interval: Duration,
    sweep_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!("🚀 Starting feed consumer '{}'", consumer.consumer_id());
    log::info!("   ├─ Poll interval: {}ms", poll_interval.as_millis());
    log::info!("   ├─ Batch size: {}", consumer.batch_size());
    log::info!("   └─ Time sweep interval: {}ms", sweep_interval.as_millis());

    let mut poll_timer = interval(poll_interval);
    poll_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sweep_timer = interval(sweep_interval);
    sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut total_handled = 0usize;

    loop {
        tokio::select! {
            _ = poll_timer.tick() => {
                loop {
                    match consumer.poll_once().await {
                        Ok(report) => {
                            if report.fetched > 0 {
                                total_handled += report.handled();
                                log::info!(
                                    "📊 Batch: {} fetched | {} processed | {} skipped | {} rejected | {} duplicates | {} released | {} awaiting approval | total {}",
                                    report.fetched,
                                    report.processed,
                                    report.skipped,
                                    report.rejected,
                                    report.duplicates,
                                    report.released,
                                    report.awaiting_approval,
                                    total_handled
                                );
                            }
                            let drained = report.fetched < consumer.batch_size();
                            if drained || report.stopped_by.is_some() || *shutdown.borrow() {
                                break;
                            }
                        }
                        Err(e) => {
                            log::warn!("⚠️  Poll failed, retrying next tick: {}", e);
                            break;
                        }
                    }
                }
            }

            _ = sweep_timer.tick() => {
                match consumer.engine().sweep_time_thresholds().await {
                    Ok(0) => {}
                    Ok(n) => log::info!("⏰ Time sweep moved {} bucket(s) out of ACCUMULATING", n),
                    Err(e) => log::warn!("⚠️  Time sweep failed: {}", e),
                }
            }

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    log::info!("✅ Feed consumer '{}' stopped", consumer.consumer_id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::SqliteStore;
    use crate::pipeline::release::{ChannelReleaseSink, LogReleaseSink, ReleaseError, ReleaseSink};
    use crate::pipeline::store::BucketStore;
    use crate::pipeline::types::{
        Actor, BucketingRule, CommitCriteria, CommitMode, ReleaseNotice, RuleKind, Threshold,
        ThresholdType,
    };
    use async_trait::async_trait;
    use tempfile::NamedTempFile;
    use tokio::sync::{mpsc, Notify};

    fn setup(batch_size: usize) -> (NamedTempFile, Arc<SqliteStore>, Arc<FeedConsumer>) {
        setup_with(batch_size, Arc::new(LogReleaseSink), 10_000)
    }

    fn setup_with(
        batch_size: usize,
        sink: Arc<dyn ReleaseSink>,
        store_timeout_ms: u64,
    ) -> (NamedTempFile, Arc<SqliteStore>, Arc<FeedConsumer>) {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(SqliteStore::open(temp.path()).unwrap());
        store
            .insert_rule(&BucketingRule {
                id: 0,
                name: "generic".to_string(),
                kind: RuleKind::PayerPayee,
                priority: 1,
                payer_key: None,
                payee_key: None,
                grouping_expression: None,
                active: true,
            })
            .unwrap();
        store.upsert_payer("P1", None).unwrap();
        store.upsert_payee("PE1", None).unwrap();

        let settings = PipelineConfig {
            batch_size,
            config_cache_ttl_ms: 0,
            store_timeout_ms,
            ..PipelineConfig::default()
        };
        let engine = Arc::new(PipelineEngine::new(store.clone(), store.clone(), sink, &settings));
        let consumer = Arc::new(FeedConsumer::new(store.clone(), store.clone(), engine, &settings));
        (temp, store, consumer)
    }

    fn publish(store: &SqliteStore, claim_id: &str, paid: &str) {
        let payload = format!(
            r#"{{"claim_id":"{}","payer_key":"P1","payee_key":"PE1","paid_amount":"{}","status":"PAID"}}"#,
            claim_id, paid
        );
        store.publish_change(&payload, 1_700_000_000).unwrap();
    }

    #[tokio::test]
    async fn test_poll_advances_checkpoint_in_batches() {
        let (_temp, store, consumer) = setup(2);
        publish(&store, "C1", "10");
        store.publish_change("{broken", 1_700_000_000).unwrap();
        publish(&store, "C2", "15");

        let first = consumer.poll_once().await.unwrap();
        assert_eq!(first.fetched, 2);
        assert_eq!(first.processed, 1);
        assert_eq!(first.rejected, 1);
        assert_eq!(first.checkpoint, Some(FeedPosition::new(2, 0)));

        let second = consumer.poll_once().await.unwrap();
        assert_eq!(second.processed, 1);
        assert_eq!(second.checkpoint, Some(FeedPosition::new(3, 0)));

        let idle = consumer.poll_once().await.unwrap();
        assert_eq!(idle, BatchReport::default());
    }

    #[tokio::test]
    async fn test_replay_after_reset_is_idempotent() {
        let (_temp, store, consumer) = setup(100);
        publish(&store, "C1", "100.10");
        publish(&store, "C2", "200.20");

        consumer.poll_once().await.unwrap();
        consumer.reset_checkpoint(FeedPosition::START).await.unwrap();
        let replay = consumer.poll_once().await.unwrap();
        assert_eq!(replay.duplicates, 2);
        assert_eq!(replay.processed, 0);

        assert_eq!(consumer.mark_all_unprocessed().await.unwrap(), 1);
        let again = consumer.poll_once().await.unwrap();
        assert_eq!(again.duplicates, 2);

        let open = store.buckets_in_status(BucketStatus::Accumulating).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].claim_count, 2);
        assert_eq!(open[0].total_amount.to_string(), "300.30");
    }

    #[tokio::test]
    async fn test_batch_stops_on_engine_error() {
        let (_temp, store, consumer) = setup(100);
        store.set_rule_active(1, false).unwrap();
        publish(&store, "C1", "10");

        // No active rules: transient, checkpoint stays put
        let report = consumer.poll_once().await.unwrap();
        assert!(report.stopped_by.is_some());
        assert_eq!(report.checkpoint, None);

        store.set_rule_active(1, true).unwrap();
        let report = consumer.poll_once().await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.checkpoint, Some(FeedPosition::new(1, 0)));
    }

    #[tokio::test]
    async fn test_consumer_loop_stops_on_shutdown() {
        let (_temp, store, consumer) = setup(100);
        publish(&store, "C1", "10");

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(start_feed_consumer(
            consumer.clone(),
            Duration::from_millis(10),
            Duration::from_millis(50),
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(store.claim_already_processed("C1").await.unwrap());
    }

    /// Every claim releases its bucket immediately
    fn release_on_first_claim(store: &SqliteStore) {
        store
            .insert_threshold(&Threshold {
                id: 0,
                name: "single".to_string(),
                threshold_type: ThresholdType::ClaimCount,
                max_claims: Some(1),
                max_amount: None,
                time_window: None,
                rule_id: 1,
                active: true,
            })
            .unwrap();
        store
            .insert_commit_criteria(&CommitCriteria {
                id: 0,
                name: "auto".to_string(),
                mode: CommitMode::Auto,
                auto_trigger_amount: None,
                manual_trigger_amount: None,
                required_approval_roles: vec![],
                override_permissions: vec![],
                rule_id: 1,
                active: true,
            })
            .unwrap();
    }

    fn publish_for(store: &SqliteStore, claim_id: &str, payee: &str, paid: &str) {
        let payload = format!(
            r#"{{"claim_id":"{}","payer_key":"P1","payee_key":"{}","paid_amount":"{}","status":"PAID"}}"#,
            claim_id, payee, paid
        );
        store.publish_change(&payload, 1_700_000_000).unwrap();
    }

    /// Holds every notice until the gate opens
    struct GatedSink {
        gate: Arc<Notify>,
        tx: mpsc::UnboundedSender<ReleaseNotice>,
    }

    #[async_trait]
    impl ReleaseSink for GatedSink {
        async fn release(&self, notice: ReleaseNotice) -> Result<(), ReleaseError> {
            self.gate.notified().await;
            self.tx.send(notice).map_err(|_| ReleaseError::ChannelClosed)
        }
    }

    #[tokio::test]
    async fn test_full_release_channel_fails_bucket_instead_of_dropping_notice() {
        // Test: nobody drains a one-slot channel; the second release must not vanish
        let (sink, mut rx) = ChannelReleaseSink::channel(1);
        let (_temp, store, consumer) = setup_with(100, Arc::new(sink), 200);
        release_on_first_claim(&store);
        store.upsert_payee("PE2", None).unwrap();
        publish_for(&store, "C1", "PE1", "10");
        publish_for(&store, "C2", "PE2", "20");

        let report = consumer.poll_once().await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.released, 1);
        assert_eq!(report.stopped_by, None);
        assert_eq!(report.checkpoint, Some(FeedPosition::new(2, 0)));

        let failed = store.buckets_in_status(BucketStatus::Failed).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].payee_key, "PE2");
        let error = failed[0].last_error.clone().unwrap_or_default();
        assert!(error.contains("undeliverable"), "last_error: {}", error);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.payee_key, "PE1");
        assert!(rx.try_recv().is_err());

        // Redelivery does not resurrect it; the operator redrives it
        consumer.reset_checkpoint(FeedPosition::START).await.unwrap();
        let replay = consumer.poll_once().await.unwrap();
        assert_eq!(replay.duplicates, 2);
        assert!(rx.try_recv().is_err());

        let redriven = consumer
            .engine()
            .lifecycle()
            .redrive(failed[0].id, &Actor::new("ops", &[]), Some("channel drained"))
            .await
            .unwrap();
        assert_eq!(redriven.status, BucketStatus::Generating);
        assert_eq!(rx.recv().await.unwrap().bucket_id, failed[0].id);
    }

    #[tokio::test]
    async fn test_timed_out_step_still_delivers_release() {
        // Test: the consumer stops waiting after the GENERATING commit; the notice still arrives once
        let gate = Arc::new(Notify::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = GatedSink {
            gate: gate.clone(),
            tx,
        };
        let (_temp, store, consumer) = setup_with(100, Arc::new(sink), 100);
        release_on_first_claim(&store);
        publish_for(&store, "C1", "PE1", "10");

        let report = consumer.poll_once().await.unwrap();
        assert!(report.stopped_by.is_some());
        assert_eq!(report.checkpoint, None);

        let stuck = store.buckets_in_status(BucketStatus::Generating).await.unwrap();
        assert_eq!(stuck.len(), 1);

        gate.notify_one();
        let notice = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.bucket_id, stuck[0].id);
        assert_eq!(notice.claim_ids, vec!["C1".to_string()]);

        // Redelivery counts as a duplicate and releases nothing twice
        let retry = consumer.poll_once().await.unwrap();
        assert_eq!(retry.duplicates, 1);
        assert_eq!(retry.checkpoint, Some(FeedPosition::new(1, 0)));
        assert!(rx.try_recv().is_err());

        let bucket = store.get_bucket(stuck[0].id).await.unwrap().unwrap();
        assert_eq!(bucket.status, BucketStatus::Generating);
        assert_eq!(bucket.last_error, None);
    }
}
