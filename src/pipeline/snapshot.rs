//! Immutable configuration snapshot with a short-TTL cache
//!
//! Rules, thresholds and commit criteria are read-mostly. Each evaluation
//! works against one `ConfigSnapshot`, an arena of tables keyed by rule id.
//! The cache reloads it from the `ConfigStore` once the TTL has elapsed or
//! after an explicit `invalidate()`, so administrative edits take effect
//! without a restart.

use super::error::StoreError;
use super::expression::GroupingExpression;
use super::store::ConfigStore;
use super::types::{BucketingRule, CommitCriteria, RuleId, RuleKind, Threshold};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    /// Active rules, priority descending (ties by id ascending)
    rules: Vec<BucketingRule>,
    thresholds: HashMap<RuleId, Vec<Threshold>>,
    criteria: HashMap<RuleId, CommitCriteria>,
    /// Parsed predicates of CUSTOM rules; broken ones are absent
    expressions: HashMap<RuleId, GroupingExpression>,
}

impl ConfigSnapshot {
    /// Load the active configuration for every active rule
    pub async fn load(store: &dyn ConfigStore) -> Result<Self, StoreError> {
        let rules = store.active_rules().await?;

        let mut thresholds = Vec::new();
        let mut criteria = Vec::new();
        for rule in &rules {
            thresholds.extend(store.thresholds_for_rule(rule.id).await?);
            criteria.extend(store.commit_criteria_for_rule(rule.id).await?);
        }

        Ok(Self::from_parts(rules, thresholds, criteria))
    }

    /// Build a snapshot from raw tables, dropping inactive rows
    pub fn from_parts(
        rules: Vec<BucketingRule>,
        thresholds: Vec<Threshold>,
        criteria: Vec<CommitCriteria>,
    ) -> Self {
        let mut rules: Vec<BucketingRule> = rules.into_iter().filter(|r| r.active).collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

        let mut threshold_map: HashMap<RuleId, Vec<Threshold>> = HashMap::new();
        for threshold in thresholds.into_iter().filter(|t| t.active) {
            threshold_map.entry(threshold.rule_id).or_default().push(threshold);
        }

        let mut criteria_map: HashMap<RuleId, CommitCriteria> = HashMap::new();
        for candidate in criteria.into_iter().filter(|c| c.active) {
            match criteria_map.get(&candidate.rule_id) {
                Some(existing) => {
                    log::warn!(
                        "⚠️  Rule {} has several active commit criteria; using '{}' (id {}), ignoring '{}' (id {})",
                        candidate.rule_id,
                        if existing.id <= candidate.id { &existing.name } else { &candidate.name },
                        existing.id.min(candidate.id),
                        if existing.id <= candidate.id { &candidate.name } else { &existing.name },
                        existing.id.max(candidate.id),
                    );
                    if candidate.id < existing.id {
                        criteria_map.insert(candidate.rule_id, candidate);
                    }
                }
                None => {
                    criteria_map.insert(candidate.rule_id, candidate);
                }
            }
        }

        let mut expressions = HashMap::new();
        for rule in rules.iter().filter(|r| r.kind == RuleKind::Custom) {
            let Some(source) = rule.grouping_expression.as_deref() else {
                log::warn!("⚠️  CUSTOM rule '{}' has no grouping expression", rule.name);
                continue;
            };
            match GroupingExpression::parse(source) {
                Ok(expression) => {
                    expressions.insert(rule.id, expression);
                }
                Err(e) => log::warn!(
                    "⚠️  CUSTOM rule '{}' has an invalid grouping expression: {}",
                    rule.name,
                    e
                ),
            }
        }

        Self {
            rules,
            thresholds: threshold_map,
            criteria: criteria_map,
            expressions,
        }
    }

    pub fn rules(&self) -> &[BucketingRule] {
        &self.rules
    }

    pub fn rule(&self, rule_id: RuleId) -> Option<&BucketingRule> {
        self.rules.iter().find(|r| r.id == rule_id)
    }

    /// Active thresholds linked to the rule id
    pub fn thresholds_for_rule(&self, rule_id: RuleId) -> &[Threshold] {
        self.thresholds
            .get(&rule_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Parsed grouping expression of a CUSTOM rule (`None` if missing or invalid)
    pub fn expression(&self, rule_id: RuleId) -> Option<&GroupingExpression> {
        self.expressions.get(&rule_id)
    }

    /// The rule's commit criteria; `None` means the MANUAL default applies
    pub fn commit_criteria_for_rule(&self, rule_id: RuleId) -> Option<&CommitCriteria> {
        self.criteria.get(&rule_id)
    }
}

/// TTL cache over `ConfigSnapshot::load`
pub struct SnapshotCache {
    store: Arc<dyn ConfigStore>,
    ttl: Duration,
    current: Mutex<Option<(Instant, Arc<ConfigSnapshot>)>>,
}

impl SnapshotCache {
    pub fn new(store: Arc<dyn ConfigStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            current: Mutex::new(None),
        }
    }

    /// Current snapshot, reloading if stale
    pub async fn get(&self) -> Result<Arc<ConfigSnapshot>, StoreError> {
        let mut current = self.current.lock().await;

        if let Some((loaded_at, snapshot)) = current.as_ref() {
            if loaded_at.elapsed() < self.ttl {
                return Ok(snapshot.clone());
            }
        }

        let snapshot = Arc::new(ConfigSnapshot::load(self.store.as_ref()).await?);
        log::debug!(
            "🔄 Configuration snapshot reloaded: {} active rule(s)",
            snapshot.rules().len()
        );
        *current = Some((Instant::now(), snapshot.clone()));
        Ok(snapshot)
    }

    /// Drop the cached snapshot; the next `get` reads the store
    pub async fn invalidate(&self) {
        *self.current.lock().await = None;
    }
}
