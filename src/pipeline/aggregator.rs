//! Aggregation: find-or-create the bucket for a claim and count it in
//!
//! Callers hold the grouping-key lock from `KeyedLocks` for the whole
//! find-or-create-and-accumulate step, so two claims for a new key cannot
//! both create a bucket. The store's accumulate is itself transactional and
//! idempotent on claim id, which covers redelivery after a crash.

use super::error::EngineError;
use super::snapshot::ConfigSnapshot;
use super::store::{Accumulation, BucketStore, ConfigStore};
use super::types::{Bucket, BucketingRule, Claim, NewBucket, ProcessingLogEntry, RuleKind};
use std::sync::Arc;

/// Grouping key for a claim under its resolved rule
///
/// `rule:{id}|payer:{payer}|payee:{payee}`, plus `|bin:{bin}|pcn:{pcn}` for
/// BIN_PCN rules (absent values render empty).
pub fn grouping_key(rule: &BucketingRule, claim: &Claim) -> String {
    let mut key = format!(
        "rule:{}|payer:{}|payee:{}",
        rule.id, claim.payer_key, claim.payee_key
    );
    if rule.kind == RuleKind::BinPcn {
        key.push_str(&format!(
            "|bin:{}|pcn:{}",
            claim.bin_number.as_deref().unwrap_or(""),
            claim.pcn.as_deref().unwrap_or("")
        ));
    }
    key
}

/// Reason the bucket cannot be released as configured, if any
///
/// Checks that the payer and payee exist in configuration and that a
/// BIN_PCN bucket actually carries a BIN.
pub async fn configuration_gap(
    config: &dyn ConfigStore,
    bucket: &Bucket,
    snapshot: &ConfigSnapshot,
) -> Result<Option<String>, EngineError> {
    let mut missing = Vec::new();

    if !config.payer_exists(&bucket.payer_key).await? {
        missing.push(format!("payer '{}' is not configured", bucket.payer_key));
    }
    if !config.payee_exists(&bucket.payee_key).await? {
        missing.push(format!("payee '{}' is not configured", bucket.payee_key));
    }

    let bin_pcn = snapshot
        .rule(bucket.rule_id)
        .map(|rule| rule.kind == RuleKind::BinPcn)
        .unwrap_or(false);
    let has_bin = bucket
        .bin_number
        .as_deref()
        .map(|bin| !bin.trim().is_empty())
        .unwrap_or(false);
    if bin_pcn && !has_bin {
        missing.push("BIN number required by BIN_PCN rule".to_string());
    }

    if missing.is_empty() {
        Ok(None)
    } else {
        Ok(Some(missing.join("; ")))
    }
}

pub struct Aggregator {
    buckets: Arc<dyn BucketStore>,
}

impl Aggregator {
    pub fn new(buckets: Arc<dyn BucketStore>) -> Self {
        Self { buckets }
    }

    /// Count the claim into the open bucket for its grouping key
    ///
    /// Must run under the lock for `grouping_key(rule, claim)`.
    pub async fn aggregate(
        &self,
        claim: &Claim,
        rule: &BucketingRule,
        now: i64,
    ) -> Result<Accumulation, EngineError> {
        // Redelivered claim: never open a fresh bucket for it
        if self.buckets.claim_already_processed(&claim.claim_id).await? {
            if let Some(owner) = self.buckets.bucket_for_claim(&claim.claim_id).await? {
                return Ok(Accumulation::Duplicate(owner));
            }
        }

        let key = grouping_key(rule, claim);
        let bucket = match self.buckets.find_open_bucket(&key).await? {
            Some(bucket) => bucket,
            None => {
                let bucket = self
                    .buckets
                    .create_bucket(NewBucket {
                        rule_id: rule.id,
                        grouping_key: key.clone(),
                        payer_key: claim.payer_key.clone(),
                        payee_key: claim.payee_key.clone(),
                        bin_number: claim.bin_number.clone(),
                        pcn: claim.pcn.clone(),
                        created_at: now,
                    })
                    .await?;
                log::info!(
                    "🆕 Bucket {} opened for {} (rule '{}')",
                    bucket.id,
                    key,
                    rule.name
                );
                bucket
            }
        };

        let entry = ProcessingLogEntry::for_processed_claim(claim, bucket.id, now);
        let accumulation = self.buckets.accumulate(bucket.id, &entry).await?;

        if let Accumulation::Applied(updated) = &accumulation {
            log::debug!(
                "➕ Claim {} -> bucket {} ({} claims, total {})",
                claim.claim_id,
                updated.id,
                updated.claim_count,
                updated.total_amount
            );
        }

        Ok(accumulation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::SqliteStore;
    use crate::pipeline::types::{BucketStatus, RuleId};
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use tempfile::NamedTempFile;

    fn claim(id: &str, paid: &str, bin: Option<&str>) -> Claim {
        Claim {
            claim_id: id.to_string(),
            payer_key: "P1".to_string(),
            payee_key: "PE1".to_string(),
            bin_number: bin.map(str::to_string),
            pcn: Some("ADV".to_string()),
            charged_amount: Decimal::from_str(paid).unwrap(),
            paid_amount: Decimal::from_str(paid).unwrap(),
            status: "PAID".to_string(),
            service_date: None,
        }
    }

    fn rule(id: RuleId, kind: RuleKind) -> BucketingRule {
        BucketingRule {
            id,
            name: "generic".to_string(),
            kind,
            priority: 1,
            payer_key: None,
            payee_key: None,
            grouping_expression: None,
            active: true,
        }
    }

    fn create_test_store() -> (NamedTempFile, Arc<SqliteStore>) {
        let temp_file = NamedTempFile::new().unwrap();
        let store = Arc::new(SqliteStore::open(temp_file.path()).unwrap());
        (temp_file, store)
    }

    #[test]
    fn test_grouping_key_shapes() {
        let c = claim("C1", "1", Some("610014"));
        assert_eq!(grouping_key(&rule(3, RuleKind::PayerPayee), &c), "rule:3|payer:P1|payee:PE1");
        assert_eq!(
            grouping_key(&rule(4, RuleKind::BinPcn), &c),
            "rule:4|payer:P1|payee:PE1|bin:610014|pcn:ADV"
        );
    }

    #[tokio::test]
    async fn test_aggregate_reuses_open_bucket() {
        let (_temp, store) = create_test_store();
        let rule_id = store.insert_rule(&rule(0, RuleKind::PayerPayee)).unwrap();
        let generic = rule(rule_id, RuleKind::PayerPayee);
        let aggregator = Aggregator::new(store.clone());

        let first = aggregator.aggregate(&claim("C1", "900", None), &generic, 100).await.unwrap();
        let second = aggregator.aggregate(&claim("C2", "1350", None), &generic, 101).await.unwrap();

        assert_eq!(first.bucket().id, second.bucket().id);
        assert_eq!(second.bucket().claim_count, 2);
        assert_eq!(second.bucket().total_amount, Decimal::from(2250));
        assert_eq!(second.bucket().created_at, 100);
    }

    #[tokio::test]
    async fn test_redelivery_after_release_opens_nothing() {
        let (_temp, store) = create_test_store();
        let rule_id = store.insert_rule(&rule(0, RuleKind::PayerPayee)).unwrap();
        let generic = rule(rule_id, RuleKind::PayerPayee);
        let aggregator = Aggregator::new(store.clone());

        let applied = aggregator.aggregate(&claim("C1", "10", None), &generic, 100).await.unwrap();
        let mut released = applied.bucket().clone();
        released.status = BucketStatus::Generating;
        store
            .save_transition(&released, BucketStatus::Accumulating, None)
            .await
            .unwrap();

        let again = aggregator.aggregate(&claim("C1", "10", None), &generic, 200).await.unwrap();
        assert!(matches!(again, Accumulation::Duplicate(_)));
        assert_eq!(again.bucket().id, applied.bucket().id);
        let key = grouping_key(&generic, &claim("C1", "10", None));
        assert!(store.find_open_bucket(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_configuration_gap() {
        let (_temp, store) = create_test_store();
        let rule_id = store.insert_rule(&rule(0, RuleKind::BinPcn)).unwrap();
        let bin_rule = rule(rule_id, RuleKind::BinPcn);
        let snapshot = ConfigSnapshot::from_parts(vec![bin_rule.clone()], vec![], vec![]);
        let aggregator = Aggregator::new(store.clone());

        let bucket = aggregator
            .aggregate(&claim("C1", "10", None), &bin_rule, 100)
            .await
            .unwrap()
            .bucket()
            .clone();

        let gap = configuration_gap(store.as_ref(), &bucket, &snapshot).await.unwrap().unwrap();
        assert!(gap.contains("payer 'P1'"));
        assert!(gap.contains("payee 'PE1'"));
        assert!(gap.contains("BIN"));

        store.upsert_payer("P1", None).unwrap();
        store.upsert_payee("PE1", None).unwrap();
        let gap = configuration_gap(store.as_ref(), &bucket, &snapshot).await.unwrap();
        assert_eq!(gap.as_deref(), Some("BIN number required by BIN_PCN rule"));
    }
}
