//! Integration tests: change feed -> buckets -> lifecycle
//!
//! Every test runs against a throw-away SQLite file and drives the pipeline
//! the way the runtime does (FeedConsumer + PipelineEngine) or, for the
//! concurrency test, calls the engine directly from many tasks.
//!
//! Key integration points tested:
//! - Accumulation and AUTO release end to end
//! - Malformed claims never reach a bucket
//! - Concurrent claims on one grouping key
//! - Replay idempotency
//! - Approval flow and illegal transitions
//! - HYBRID auto-release boundary
//! - Rule priority resolution

#[cfg(test)]
mod pipeline_integration_tests {
    use remitflow::pipeline::{
        config::PipelineConfig,
        db::SqliteStore,
        engine::{ClaimOutcome, PipelineEngine},
        error::EngineError,
        ingestion::FeedConsumer,
        release::ChannelReleaseSink,
        store::BucketStore,
        types::{
            Actor, ApprovalAction, BucketStatus, BucketingRule, Claim, CommitCriteria, CommitMode,
            FeedPosition, ReleaseNotice, RuleId, RuleKind, Threshold, ThresholdType,
        },
    };
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use std::sync::Arc;
    use tempfile::NamedTempFile;
    use tokio::sync::mpsc;

    const NOW: i64 = 1_700_000_000;

    struct Pipeline {
        _temp: NamedTempFile,
        store: Arc<SqliteStore>,
        engine: Arc<PipelineEngine>,
        consumer: FeedConsumer,
        notices: mpsc::Receiver<ReleaseNotice>,
    }

    fn rule(name: &str, priority: i32, payer: Option<&str>, payee: Option<&str>) -> BucketingRule {
        BucketingRule {
            id: 0,
            name: name.to_string(),
            kind: RuleKind::PayerPayee,
            priority,
            payer_key: payer.map(str::to_string),
            payee_key: payee.map(str::to_string),
            grouping_expression: None,
            active: true,
        }
    }

    fn amount_threshold(rule_id: RuleId, max: &str) -> Threshold {
        Threshold {
            id: 0,
            name: format!("amount >= {}", max),
            threshold_type: ThresholdType::Amount,
            max_claims: None,
            max_amount: Some(dec(max)),
            time_window: None,
            rule_id,
            active: true,
        }
    }

    fn criteria(rule_id: RuleId, mode: CommitMode, auto: Option<&str>) -> CommitCriteria {
        CommitCriteria {
            id: 0,
            name: format!("{} release", mode.as_str()),
            mode,
            auto_trigger_amount: auto.map(dec),
            manual_trigger_amount: None,
            required_approval_roles: vec!["approver".to_string()],
            override_permissions: vec!["supervisor".to_string()],
            rule_id,
            active: true,
        }
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    /// Empty store plus engine and consumer; configuration is seeded by each test
    fn pipeline() -> Pipeline {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(SqliteStore::open(temp.path()).unwrap());
        for payer in ["P1", "P2", "P3"] {
            store.upsert_payer(payer, None).unwrap();
        }
        for payee in ["PE1", "PE2", "PE3", "PE9"] {
            store.upsert_payee(payee, None).unwrap();
        }

        let settings = PipelineConfig {
            config_cache_ttl_ms: 0,
            ..PipelineConfig::default()
        };
        let (sink, notices) = ChannelReleaseSink::channel(64);
        let engine = Arc::new(PipelineEngine::new_with_timestamp_fn(
            store.clone(),
            store.clone(),
            Arc::new(sink),
            &settings,
            Box::new(|| NOW),
        ));
        let consumer = FeedConsumer::new(store.clone(), store.clone(), engine.clone(), &settings);

        Pipeline {
            _temp: temp,
            store,
            engine,
            consumer,
            notices,
        }
    }

    fn publish(store: &SqliteStore, claim_id: &str, payer: &str, payee: &str, paid: &str) {
        let payload = format!(
            r#"{{"claim_id":"{}","payer_key":"{}","payee_key":"{}","charged_amount":"{}","paid_amount":"{}","status":"PAID"}}"#,
            claim_id, payer, payee, paid, paid
        );
        store.publish_change(&payload, NOW).unwrap();
    }

    fn claim(claim_id: &str, payer: &str, payee: &str, paid: &str) -> Claim {
        Claim {
            claim_id: claim_id.to_string(),
            payer_key: payer.to_string(),
            payee_key: payee.to_string(),
            bin_number: None,
            pcn: None,
            charged_amount: dec(paid),
            paid_amount: dec(paid),
            status: "PAID".to_string(),
            service_date: None,
        }
    }

    fn accumulated_bucket(outcome: &ClaimOutcome) -> i64 {
        match outcome {
            ClaimOutcome::Accumulated { bucket_id, .. } => *bucket_id,
            other => panic!("expected accumulation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_amount_threshold_auto_release_end_to_end() {
        // Test: three claims cross an AMOUNT threshold of 3000 under AUTO commit
        let mut p = pipeline();
        let rule_id = p.store.insert_rule(&rule("generic", 1, None, None)).unwrap();
        p.store.insert_threshold(&amount_threshold(rule_id, "3000")).unwrap();
        p.store
            .insert_commit_criteria(&criteria(rule_id, CommitMode::Auto, None))
            .unwrap();

        publish(&p.store, "C1", "P1", "PE1", "900.00");
        publish(&p.store, "C2", "P1", "PE1", "1350.00");
        publish(&p.store, "C3", "P1", "PE1", "1800.00");

        let report = p.consumer.poll_once().await.unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(report.released, 1);
        assert_eq!(report.checkpoint, Some(FeedPosition::new(3, 0)));

        let generating = p.store.buckets_in_status(BucketStatus::Generating).await.unwrap();
        assert_eq!(generating.len(), 1);
        let bucket = &generating[0];
        assert_eq!(bucket.claim_count, 3);
        assert_eq!(bucket.total_amount.to_string(), "4050.00");

        // AUTO release skips the approval log
        assert!(p.store.approval_log(bucket.id).await.unwrap().is_empty());

        let notice = p.notices.recv().await.unwrap();
        assert_eq!(notice.bucket_id, bucket.id);
        assert_eq!(notice.claim_ids, vec!["C1", "C2", "C3"]);
    }

    #[tokio::test]
    async fn test_claim_without_payer_is_rejected_and_counted_nowhere() {
        // Test: missing payer key -> REJECTED processing-log row, no bucket
        let p = pipeline();
        p.store.insert_rule(&rule("generic", 1, None, None)).unwrap();

        p.store
            .publish_change(
                r#"{"claim_id":"C9","payee_key":"PE1","paid_amount":"120.00","status":"PAID"}"#,
                NOW,
            )
            .unwrap();

        let report = p.consumer.poll_once().await.unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.processed, 0);
        assert_eq!(report.checkpoint, Some(FeedPosition::new(1, 0)));

        let rejected = p.store.rejected_claims().unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].claim_id, "C9");
        assert_eq!(rejected[0].bucket_id, None);

        assert!(!p.store.claim_already_processed("C9").await.unwrap());
        assert!(p
            .store
            .buckets_in_status(BucketStatus::Accumulating)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_share_one_bucket() {
        // Test: N claims for one grouping key processed in parallel
        let p = pipeline();
        p.store.insert_rule(&rule("generic", 1, None, None)).unwrap();

        const N: usize = 40;
        let mut handles = Vec::new();
        for i in 0..N {
            let engine = p.engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .process_claim(&claim(&format!("C{}", i), "P1", "PE1", "10.01"))
                    .await
            }));
        }

        let mut bucket_ids = Vec::new();
        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            bucket_ids.push(accumulated_bucket(&outcome));
        }
        bucket_ids.dedup();
        assert_eq!(bucket_ids.len(), 1);

        let bucket = p.store.get_bucket(bucket_ids[0]).await.unwrap().unwrap();
        assert_eq!(bucket.claim_count, N as i64);
        assert_eq!(bucket.total_amount, dec("10.01") * Decimal::from(N as i64));
        assert_eq!(p.store.processing_log(bucket.id).await.unwrap().len(), N);
    }

    #[tokio::test]
    async fn test_replaying_the_feed_never_double_counts() {
        // Test: process, rewind everything, process again
        let p = pipeline();
        p.store.insert_rule(&rule("generic", 1, None, None)).unwrap();
        publish(&p.store, "C1", "P1", "PE1", "100.00");
        publish(&p.store, "C2", "P1", "PE1", "250.50");
        publish(&p.store, "C3", "P2", "PE2", "75.25");

        let first = p.consumer.poll_once().await.unwrap();
        assert_eq!(first.processed, 3);

        p.consumer.mark_all_unprocessed().await.unwrap();
        let replay = p.consumer.poll_once().await.unwrap();
        assert_eq!(replay.duplicates, 3);
        assert_eq!(replay.processed, 0);

        let open = p.store.buckets_in_status(BucketStatus::Accumulating).await.unwrap();
        assert_eq!(open.len(), 2);
        let total: Decimal = open.iter().map(|b| b.total_amount).sum();
        let count: i64 = open.iter().map(|b| b.claim_count).sum();
        assert_eq!(count, 3);
        assert_eq!(total, dec("425.75"));
    }

    #[tokio::test]
    async fn test_manual_approval_flow_and_illegal_transitions() {
        // Test: threshold -> PENDING_APPROVAL -> approve -> GENERATING -> COMPLETED
        let mut p = pipeline();
        let rule_id = p.store.insert_rule(&rule("generic", 1, None, None)).unwrap();
        p.store.insert_threshold(&amount_threshold(rule_id, "500")).unwrap();
        p.store
            .insert_commit_criteria(&criteria(rule_id, CommitMode::Manual, None))
            .unwrap();

        let outcome = p
            .engine
            .process_claim(&claim("C1", "P1", "PE1", "650.00"))
            .await
            .unwrap();
        let bucket_id = accumulated_bucket(&outcome);
        let bucket = p.store.get_bucket(bucket_id).await.unwrap().unwrap();
        assert_eq!(bucket.status, BucketStatus::PendingApproval);
        assert_eq!(bucket.awaiting_approval_since, Some(NOW));

        // Generation cannot complete before anyone approved
        let premature = p.engine.lifecycle().complete_generation(bucket_id).await;
        assert!(matches!(premature, Err(EngineError::InvalidTransition { .. })));

        let lifecycle = p.engine.lifecycle();
        let outsider = Actor::new("mallory", &["viewer"]);
        let denied = lifecycle.approve(bucket_id, &outsider, None, None).await;
        assert!(matches!(denied, Err(EngineError::PermissionDenied { .. })));

        let approver = Actor::new("alice", &["approver"]);
        let approved = lifecycle
            .approve(bucket_id, &approver, Some("ok to pay"), Some(NOW + 3600))
            .await
            .unwrap();
        assert_eq!(approved.status, BucketStatus::Generating);
        assert_eq!(approved.approved_by.as_deref(), Some("alice"));

        let notice = p.notices.recv().await.unwrap();
        assert_eq!(notice.bucket_id, bucket_id);

        let completed = lifecycle.complete_generation(bucket_id).await.unwrap();
        assert_eq!(completed.status, BucketStatus::Completed);

        let again = lifecycle.approve(bucket_id, &approver, None, None).await;
        assert!(matches!(again, Err(EngineError::ActionNotAllowed { .. })));

        let audit = p.store.approval_log(bucket_id).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, ApprovalAction::Approve);
        assert_eq!(audit[0].actor, "alice");
        assert_eq!(audit[0].comments.as_deref(), Some("ok to pay"));
        assert_eq!(audit[0].scheduled_for, Some(NOW + 3600));

        // A claim for the same key after completion opens a fresh bucket
        let next = p
            .engine
            .process_claim(&claim("C2", "P1", "PE1", "10.00"))
            .await
            .unwrap();
        assert_ne!(accumulated_bucket(&next), bucket_id);
    }

    #[tokio::test]
    async fn test_hybrid_commit_boundary() {
        // Test: HYBRID with auto bound 5000.00; 4999.99 waits, 5000.00 releases
        let mut p = pipeline();
        let rule_id = p.store.insert_rule(&rule("generic", 1, None, None)).unwrap();
        p.store.insert_threshold(&amount_threshold(rule_id, "1000")).unwrap();
        p.store
            .insert_commit_criteria(&criteria(rule_id, CommitMode::Hybrid, Some("5000.00")))
            .unwrap();

        publish(&p.store, "C1", "P1", "PE1", "4999.99");
        publish(&p.store, "C2", "P1", "PE2", "5000.00");

        let report = p.consumer.poll_once().await.unwrap();
        assert_eq!(report.awaiting_approval, 1);
        assert_eq!(report.released, 1);

        let pending = p.store.buckets_in_status(BucketStatus::PendingApproval).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payee_key, "PE1");

        let generating = p.store.buckets_in_status(BucketStatus::Generating).await.unwrap();
        assert_eq!(generating.len(), 1);
        assert_eq!(generating[0].payee_key, "PE2");

        let notice = p.notices.recv().await.unwrap();
        assert_eq!(notice.total_amount, dec("5000.00"));
    }

    #[tokio::test]
    async fn test_rule_priority_resolution() {
        // Test: highest-priority applicable rule wins, generic rule catches the rest
        let p = pipeline();
        let payer_rule = p.store.insert_rule(&rule("payer P1", 100, Some("P1"), None)).unwrap();
        let payee_rule = p.store.insert_rule(&rule("payee PE9", 50, None, Some("PE9"))).unwrap();
        let generic = p.store.insert_rule(&rule("generic", 1, None, None)).unwrap();

        let cases = [
            (claim("C1", "P1", "PE9", "1.00"), payer_rule),
            (claim("C2", "P2", "PE9", "1.00"), payee_rule),
            (claim("C3", "P3", "PE3", "1.00"), generic),
        ];

        for (claim, expected_rule) in cases {
            let outcome = p.engine.process_claim(&claim).await.unwrap();
            let bucket = p
                .store
                .get_bucket(accumulated_bucket(&outcome))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(bucket.rule_id, expected_rule, "claim {}", claim.claim_id);
        }
    }

    #[tokio::test]
    async fn test_no_active_rules_leaves_event_for_redelivery() {
        // Test: with no rules the batch stops before the event and nothing is counted
        let p = pipeline();
        publish(&p.store, "C1", "P1", "PE1", "10.00");

        let report = p.consumer.poll_once().await.unwrap();
        assert_eq!(report.processed, 0);
        assert!(report.stopped_by.is_some());
        assert_eq!(report.checkpoint, None);

        p.store.insert_rule(&rule("generic", 1, None, None)).unwrap();
        let retry = p.consumer.poll_once().await.unwrap();
        assert_eq!(retry.processed, 1);
    }
}
