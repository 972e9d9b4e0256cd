//! SQLite implementation of every storage contract
//!
//! One `SqliteStore` serves the change feed, consumer checkpoints, the
//! configuration tables and the bucket tables. All calls share one
//! connection behind a mutex; multi-statement writes run in IMMEDIATE
//! transactions so concurrent writers (other processes included) serialize
//! on the database lock.
//!
//! Money is stored as canonical decimal text and parsed back into
//! `rust_decimal::Decimal`, never through floating point.

use super::error::StoreError;
use super::store::{
    Accumulation, BucketStore, CheckpointStore, ConfigStore, FeedSource, StoreResult,
};
use super::types::{
    ApprovalAction, ApprovalLogEntry, Bucket, BucketId, BucketStatus, BucketingRule, Checkpoint,
    CommitCriteria, CommitMode, FeedEvent, FeedPosition, NewBucket, ProcessingLogEntry,
    ProcessingStatus, RuleId, RuleKind, Threshold, ThresholdType, TimeWindow, system_clock, Clock,
};
use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Schema files, applied in order (all statements use IF NOT EXISTS)
const SCHEMA_FILES: &[(&str, &str)] = &[
    ("00_configuration.sql", include_str!("../../sql/00_configuration.sql")),
    ("01_buckets.sql", include_str!("../../sql/01_buckets.sql")),
    ("02_audit_logs.sql", include_str!("../../sql/02_audit_logs.sql")),
    ("03_change_feed.sql", include_str!("../../sql/03_change_feed.sql")),
];

const BUCKET_COLUMNS: &str = "id, status, rule_id, grouping_key, payer_key, payee_key, \
     bin_number, pcn, claim_count, total_amount, rejection_count, created_at, updated_at, \
     awaiting_approval_since, approved_by, approved_at, generation_started_at, \
     generation_completed_at, last_error, last_error_at";

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..) => StoreError::Corrupt(err.to_string()),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Apply the embedded schema
///
/// Idempotent: safe to run on every startup.
pub fn run_schema_migrations(conn: &mut Connection) -> Result<(), StoreError> {
    log::info!("🔧 Running schema migrations ({} files)", SCHEMA_FILES.len());

    for (name, sql) in SCHEMA_FILES {
        conn.execute_batch(sql)?;
        log::debug!("   ├─ ✅ Applied: {}", name);
    }

    log::info!("✅ All schema migrations completed successfully");
    Ok(())
}

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn decimal_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text)
        .map_err(|e| conversion_error(idx, format!("invalid decimal '{}': {}", text, e)))
}

fn optional_decimal_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        Decimal::from_str(&t)
            .map_err(|e| conversion_error(idx, format!("invalid decimal '{}': {}", t, e)))
    })
    .transpose()
}

fn enum_at<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    parse(&text).ok_or_else(|| conversion_error(idx, format!("unknown value '{}'", text)))
}

fn roles_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| conversion_error(idx, format!("invalid role list '{}': {}", text, e)))
}

fn bucket_from_row(row: &Row<'_>) -> rusqlite::Result<Bucket> {
    Ok(Bucket {
        id: row.get(0)?,
        status: enum_at(row, 1, BucketStatus::parse)?,
        rule_id: row.get(2)?,
        grouping_key: row.get(3)?,
        payer_key: row.get(4)?,
        payee_key: row.get(5)?,
        bin_number: row.get(6)?,
        pcn: row.get(7)?,
        claim_count: row.get(8)?,
        total_amount: decimal_at(row, 9)?,
        rejection_count: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
        awaiting_approval_since: row.get(13)?,
        approved_by: row.get(14)?,
        approved_at: row.get(15)?,
        generation_started_at: row.get(16)?,
        generation_completed_at: row.get(17)?,
        last_error: row.get(18)?,
        last_error_at: row.get(19)?,
    })
}

fn processing_entry_from_row(row: &Row<'_>) -> rusqlite::Result<ProcessingLogEntry> {
    Ok(ProcessingLogEntry {
        claim_id: row.get(0)?,
        bucket_id: row.get(1)?,
        charged_amount: optional_decimal_at(row, 2)?,
        paid_amount: optional_decimal_at(row, 3)?,
        status: enum_at(row, 4, ProcessingStatus::parse)?,
        rejection_reason: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn load_bucket(conn: &Connection, bucket_id: BucketId) -> rusqlite::Result<Option<Bucket>> {
    conn.query_row(
        &format!("SELECT {} FROM buckets WHERE id = ?1", BUCKET_COLUMNS),
        [bucket_id],
        bucket_from_row,
    )
    .optional()
}

fn insert_processing_entry(conn: &Connection, entry: &ProcessingLogEntry) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        INSERT INTO processing_log (
            claim_id, bucket_id, charged_amount, paid_amount, status, rejection_reason, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            entry.claim_id,
            entry.bucket_id,
            entry.charged_amount.map(|d| d.to_string()),
            entry.paid_amount.map(|d| d.to_string()),
            entry.status.as_str(),
            entry.rejection_reason,
            entry.created_at,
        ],
    )?;
    Ok(())
}

fn load_checkpoint_row(conn: &Connection, consumer_id: &str) -> rusqlite::Result<Option<Checkpoint>> {
    conn.query_row(
        "SELECT consumer_id, last_position, last_sequence, total_processed, epoch, last_checkpoint_at
         FROM feed_checkpoints WHERE consumer_id = ?1",
        [consumer_id],
        |row| {
            Ok(Checkpoint {
                consumer_id: row.get(0)?,
                last_position: FeedPosition::new(row.get(1)?, row.get(2)?),
                total_processed: row.get(3)?,
                epoch: row.get(4)?,
                last_checkpoint_at: row.get(5)?,
            })
        },
    )
    .optional()
}

/// SQLite-backed store
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    now_fn: Clock,
}

impl SqliteStore {
    /// Open (or create) the database and apply the schema
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut conn = Connection::open(db_path)?;
        apply_pragmas(&conn)?;
        run_schema_migrations(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            now_fn: system_clock(),
        })
    }

    /// Replace the timestamp source used by the seed helpers
    pub fn with_clock(mut self, now_fn: Clock) -> Self {
        self.now_fn = now_fn;
        self
    }

    /// A panic under the guard rolls back the open transaction on unwind,
    /// so the connection is still usable afterwards
    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        Ok(self.conn.lock().unwrap_or_else(|poisoned| {
            log::warn!("⚠️  Recovering SQLite connection after a panic in another task");
            self.conn.clear_poison();
            poisoned.into_inner()
        }))
    }

    /// Append a claim mutation at the next free position
    pub fn publish_change(&self, payload: &str, now: i64) -> StoreResult<FeedPosition> {
        let conn = self.conn()?;
        let next: i64 = conn.query_row(
            "SELECT COALESCE(MAX(position), 0) + 1 FROM claim_changes",
            [],
            |row| row.get(0),
        )?;
        let position = FeedPosition::new(next, 0);
        Self::insert_change(&conn, position, payload, now)?;
        Ok(position)
    }

    /// Append a claim mutation at an explicit position
    pub fn publish_change_at(&self, position: FeedPosition, payload: &str, now: i64) -> StoreResult<()> {
        let conn = self.conn()?;
        Self::insert_change(&conn, position, payload, now)?;
        Ok(())
    }

    fn insert_change(conn: &Connection, position: FeedPosition, payload: &str, now: i64) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO claim_changes (position, sequence, payload, recorded_at) VALUES (?1, ?2, ?3, ?4)",
            params![position.position, position.sequence, payload, now],
        )?;
        Ok(())
    }

    pub fn upsert_payer(&self, payer_key: &str, name: Option<&str>) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO payers (payer_key, name, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(payer_key) DO UPDATE SET name = excluded.name",
            params![payer_key, name, (self.now_fn)()],
        )?;
        Ok(())
    }

    pub fn upsert_payee(&self, payee_key: &str, name: Option<&str>) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO payees (payee_key, name, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(payee_key) DO UPDATE SET name = excluded.name",
            params![payee_key, name, (self.now_fn)()],
        )?;
        Ok(())
    }

    /// Insert a rule; `rule.id` is ignored and the assigned id returned
    pub fn insert_rule(&self, rule: &BucketingRule) -> StoreResult<RuleId> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO bucketing_rules (
                name, kind, priority, payer_key, payee_key, grouping_expression, active, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                rule.name,
                rule.kind.as_str(),
                rule.priority,
                rule.payer_key,
                rule.payee_key,
                rule.grouping_expression,
                rule.active,
                (self.now_fn)(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Insert a threshold; `threshold.id` is ignored
    pub fn insert_threshold(&self, threshold: &Threshold) -> StoreResult<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO thresholds (
                name, threshold_type, max_claims, max_amount, time_window, rule_id, active, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                threshold.name,
                threshold.threshold_type.as_str(),
                threshold.max_claims,
                threshold.max_amount.map(|d| d.to_string()),
                threshold.time_window.map(|w| w.as_str()),
                threshold.rule_id,
                threshold.active,
                (self.now_fn)(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Insert commit criteria; `criteria.id` is ignored
    pub fn insert_commit_criteria(&self, criteria: &CommitCriteria) -> StoreResult<i64> {
        let roles = serde_json::to_string(&criteria.required_approval_roles)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let overrides = serde_json::to_string(&criteria.override_permissions)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO commit_criteria (
                name, mode, auto_trigger_amount, manual_trigger_amount,
                required_approval_roles, override_permissions, rule_id, active, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                criteria.name,
                criteria.mode.as_str(),
                criteria.auto_trigger_amount.map(|d| d.to_string()),
                criteria.manual_trigger_amount.map(|d| d.to_string()),
                roles,
                overrides,
                criteria.rule_id,
                criteria.active,
                (self.now_fn)(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Flip a rule's active flag
    pub fn set_rule_active(&self, rule_id: RuleId, active: bool) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE bucketing_rules SET active = ?1 WHERE id = ?2",
            params![active, rule_id],
        )?;
        Ok(())
    }

    /// Processing-log entries without a bucket (rejected claims)
    pub fn rejected_claims(&self) -> StoreResult<Vec<ProcessingLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT claim_id, bucket_id, charged_amount, paid_amount, status, rejection_reason, created_at
             FROM processing_log WHERE status = 'REJECTED' ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], processing_entry_from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

#[async_trait]
impl FeedSource for SqliteStore {
    async fn fetch_since(&self, after: FeedPosition, limit: usize) -> StoreResult<Vec<FeedEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT position, sequence, payload FROM claim_changes
             WHERE position > ?1 OR (position = ?1 AND sequence > ?2)
             ORDER BY position ASC, sequence ASC
             LIMIT ?3",
        )?;

        let rows = stmt.query_map(params![after.position, after.sequence, limit as i64], |row| {
            Ok(FeedEvent {
                position: FeedPosition::new(row.get(0)?, row.get(1)?),
                payload: row.get(2)?,
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn load_checkpoint(&self, consumer_id: &str) -> StoreResult<Checkpoint> {
        let conn = self.conn()?;
        Ok(load_checkpoint_row(&conn, consumer_id)?.unwrap_or_else(|| Checkpoint::initial(consumer_id)))
    }

    async fn save_checkpoint(
        &self,
        consumer_id: &str,
        position: FeedPosition,
        processed: i64,
        now: i64,
    ) -> StoreResult<Checkpoint> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO feed_checkpoints (
                consumer_id, last_position, last_sequence, total_processed, epoch, last_checkpoint_at
            ) VALUES (?1, ?2, ?3, ?4, 0, ?5)
            ON CONFLICT(consumer_id) DO UPDATE SET
                last_position = excluded.last_position,
                last_sequence = excluded.last_sequence,
                total_processed = feed_checkpoints.total_processed + excluded.total_processed,
                last_checkpoint_at = excluded.last_checkpoint_at
            "#,
            params![consumer_id, position.position, position.sequence, processed, now],
        )?;

        load_checkpoint_row(&conn, consumer_id)?
            .ok_or_else(|| StoreError::Conflict(format!("checkpoint {} vanished", consumer_id)))
    }

    async fn reset_checkpoint(
        &self,
        consumer_id: &str,
        position: FeedPosition,
        now: i64,
    ) -> StoreResult<Checkpoint> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO feed_checkpoints (
                consumer_id, last_position, last_sequence, total_processed, epoch, last_checkpoint_at
            ) VALUES (?1, ?2, ?3, 0, 0, ?4)
            ON CONFLICT(consumer_id) DO UPDATE SET
                last_position = excluded.last_position,
                last_sequence = excluded.last_sequence,
                last_checkpoint_at = excluded.last_checkpoint_at
            "#,
            params![consumer_id, position.position, position.sequence, now],
        )?;

        log::warn!("⏪ Checkpoint for '{}' reset to {}", consumer_id, position);

        load_checkpoint_row(&conn, consumer_id)?
            .ok_or_else(|| StoreError::Conflict(format!("checkpoint {} vanished", consumer_id)))
    }

    async fn mark_all_unprocessed(&self, now: i64) -> StoreResult<usize> {
        let conn = self.conn()?;
        let rewound = conn.execute(
            "UPDATE feed_checkpoints
             SET last_position = 0, last_sequence = 0, epoch = epoch + 1, last_checkpoint_at = ?1",
            [now],
        )?;

        log::warn!("⏪ Rewound {} consumer checkpoint(s) to the start of the feed", rewound);
        Ok(rewound)
    }
}

#[async_trait]
impl ConfigStore for SqliteStore {
    async fn active_rules(&self) -> StoreResult<Vec<BucketingRule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, kind, priority, payer_key, payee_key, grouping_expression, active
             FROM bucketing_rules WHERE active = 1
             ORDER BY priority DESC, id ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(BucketingRule {
                id: row.get(0)?,
                name: row.get(1)?,
                kind: enum_at(row, 2, RuleKind::parse)?,
                priority: row.get(3)?,
                payer_key: row.get(4)?,
                payee_key: row.get(5)?,
                grouping_expression: row.get(6)?,
                active: row.get(7)?,
            })
        })?;

        let mut rules = Vec::new();
        for row in rows {
            rules.push(row?);
        }
        Ok(rules)
    }

    async fn thresholds_for_rule(&self, rule_id: RuleId) -> StoreResult<Vec<Threshold>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, threshold_type, max_claims, max_amount, time_window, rule_id, active
             FROM thresholds WHERE rule_id = ?1 AND active = 1
             ORDER BY id ASC",
        )?;

        let rows = stmt.query_map([rule_id], |row| {
            let window: Option<String> = row.get(5)?;
            let time_window = match window {
                Some(text) => Some(
                    TimeWindow::parse(&text)
                        .ok_or_else(|| conversion_error(5, format!("unknown time window '{}'", text)))?,
                ),
                None => None,
            };

            Ok(Threshold {
                id: row.get(0)?,
                name: row.get(1)?,
                threshold_type: enum_at(row, 2, ThresholdType::parse)?,
                max_claims: row.get(3)?,
                max_amount: optional_decimal_at(row, 4)?,
                time_window,
                rule_id: row.get(6)?,
                active: row.get(7)?,
            })
        })?;

        let mut thresholds = Vec::new();
        for row in rows {
            thresholds.push(row?);
        }
        Ok(thresholds)
    }

    async fn commit_criteria_for_rule(&self, rule_id: RuleId) -> StoreResult<Vec<CommitCriteria>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, mode, auto_trigger_amount, manual_trigger_amount,
                    required_approval_roles, override_permissions, rule_id, active
             FROM commit_criteria WHERE rule_id = ?1 AND active = 1
             ORDER BY id ASC",
        )?;

        let rows = stmt.query_map([rule_id], |row| {
            Ok(CommitCriteria {
                id: row.get(0)?,
                name: row.get(1)?,
                mode: enum_at(row, 2, CommitMode::parse)?,
                auto_trigger_amount: optional_decimal_at(row, 3)?,
                manual_trigger_amount: optional_decimal_at(row, 4)?,
                required_approval_roles: roles_at(row, 5)?,
                override_permissions: roles_at(row, 6)?,
                rule_id: row.get(7)?,
                active: row.get(8)?,
            })
        })?;

        let mut criteria = Vec::new();
        for row in rows {
            criteria.push(row?);
        }
        Ok(criteria)
    }

    async fn payer_exists(&self, payer_key: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT 1 FROM payers WHERE payer_key = ?1")?;
        Ok(stmt.exists([payer_key])?)
    }

    async fn payee_exists(&self, payee_key: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT 1 FROM payees WHERE payee_key = ?1")?;
        Ok(stmt.exists([payee_key])?)
    }
}

#[async_trait]
impl BucketStore for SqliteStore {
    async fn get_bucket(&self, bucket_id: BucketId) -> StoreResult<Option<Bucket>> {
        let conn = self.conn()?;
        Ok(load_bucket(&conn, bucket_id)?)
    }

    async fn find_open_bucket(&self, grouping_key: &str) -> StoreResult<Option<Bucket>> {
        let conn = self.conn()?;
        let bucket = conn
            .query_row(
                &format!(
                    "SELECT {} FROM buckets
                     WHERE grouping_key = ?1 AND status IN ('ACCUMULATING', 'MISSING_CONFIGURATION')
                     ORDER BY id ASC LIMIT 1",
                    BUCKET_COLUMNS
                ),
                [grouping_key],
                bucket_from_row,
            )
            .optional()?;
        Ok(bucket)
    }

    async fn create_bucket(&self, new_bucket: NewBucket) -> StoreResult<Bucket> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO buckets (
                status, rule_id, grouping_key, payer_key, payee_key, bin_number, pcn,
                claim_count, total_amount, rejection_count, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, '0', 0, ?8, ?8)
            "#,
            params![
                BucketStatus::Accumulating.as_str(),
                new_bucket.rule_id,
                new_bucket.grouping_key,
                new_bucket.payer_key,
                new_bucket.payee_key,
                new_bucket.bin_number,
                new_bucket.pcn,
                new_bucket.created_at,
            ],
        )?;

        let id = conn.last_insert_rowid();
        load_bucket(&conn, id)?
            .ok_or_else(|| StoreError::Conflict(format!("bucket {} vanished after insert", id)))
    }

    async fn claim_already_processed(&self, claim_id: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT 1 FROM processing_log WHERE claim_id = ?1 AND status = 'PROCESSED'")?;
        Ok(stmt.exists([claim_id])?)
    }

    async fn bucket_for_claim(&self, claim_id: &str) -> StoreResult<Option<Bucket>> {
        let conn = self.conn()?;
        let owner: Option<Option<BucketId>> = conn
            .query_row(
                "SELECT bucket_id FROM processing_log WHERE claim_id = ?1 AND status = 'PROCESSED'",
                [claim_id],
                |row| row.get(0),
            )
            .optional()?;

        match owner.flatten() {
            Some(bucket_id) => Ok(load_bucket(&conn, bucket_id)?),
            None => Ok(None),
        }
    }

    async fn accumulate(
        &self,
        bucket_id: BucketId,
        entry: &ProcessingLogEntry,
    ) -> StoreResult<Accumulation> {
        let paid = entry.paid_amount.unwrap_or(Decimal::ZERO);

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Redelivered claim: report the bucket it was already counted into
        let counted_into: Option<Option<BucketId>> = tx
            .query_row(
                "SELECT bucket_id FROM processing_log WHERE claim_id = ?1 AND status = 'PROCESSED'",
                [&entry.claim_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(existing) = counted_into {
            let owner = existing.unwrap_or(bucket_id);
            let bucket = load_bucket(&tx, owner)?
                .ok_or_else(|| StoreError::Conflict(format!("bucket {} not found", owner)))?;
            return Ok(Accumulation::Duplicate(bucket));
        }

        let current = load_bucket(&tx, bucket_id)?
            .ok_or_else(|| StoreError::Conflict(format!("bucket {} not found", bucket_id)))?;

        let claim_count = current.claim_count + 1;
        let total_amount = current.total_amount.checked_add(paid).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "bucket {} total {} cannot absorb {} from claim {}",
                bucket_id, current.total_amount, paid, entry.claim_id
            ))
        })?;

        let updated = tx.execute(
            "UPDATE buckets SET claim_count = ?1, total_amount = ?2, updated_at = ?3
             WHERE id = ?4 AND claim_count = ?5
               AND status IN ('ACCUMULATING', 'MISSING_CONFIGURATION')",
            params![
                claim_count,
                total_amount.to_string(),
                entry.created_at,
                bucket_id,
                current.claim_count,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::Conflict(format!(
                "bucket {} changed during accumulation",
                bucket_id
            )));
        }

        let mut linked = entry.clone();
        linked.bucket_id = Some(bucket_id);
        insert_processing_entry(&tx, &linked)?;

        let bucket = load_bucket(&tx, bucket_id)?
            .ok_or_else(|| StoreError::Conflict(format!("bucket {} not found", bucket_id)))?;
        tx.commit()?;

        Ok(Accumulation::Applied(bucket))
    }

    async fn save_transition(
        &self,
        bucket: &Bucket,
        expected: BucketStatus,
        approval: Option<&ApprovalLogEntry>,
    ) -> StoreResult<Bucket> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let updated = tx.execute(
            r#"
            UPDATE buckets SET
                status = ?1,
                rejection_count = ?2,
                updated_at = ?3,
                awaiting_approval_since = ?4,
                approved_by = ?5,
                approved_at = ?6,
                generation_started_at = ?7,
                generation_completed_at = ?8,
                last_error = ?9,
                last_error_at = ?10
            WHERE id = ?11 AND status = ?12
            "#,
            params![
                bucket.status.as_str(),
                bucket.rejection_count,
                bucket.updated_at,
                bucket.awaiting_approval_since,
                bucket.approved_by,
                bucket.approved_at,
                bucket.generation_started_at,
                bucket.generation_completed_at,
                bucket.last_error,
                bucket.last_error_at,
                bucket.id,
                expected.as_str(),
            ],
        )?;

        if updated == 0 {
            return Err(StoreError::Conflict(format!(
                "bucket {} is no longer {}",
                bucket.id, expected
            )));
        }

        if let Some(entry) = approval {
            tx.execute(
                "INSERT INTO approval_log (bucket_id, action, actor, comments, scheduled_for, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.bucket_id,
                    entry.action.as_str(),
                    entry.actor,
                    entry.comments,
                    entry.scheduled_for,
                    entry.created_at,
                ],
            )?;
        }

        let saved = load_bucket(&tx, bucket.id)?
            .ok_or_else(|| StoreError::Conflict(format!("bucket {} not found", bucket.id)))?;
        tx.commit()?;

        Ok(saved)
    }

    async fn record_error(&self, bucket_id: BucketId, message: &str, now: i64) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE buckets SET last_error = ?1, last_error_at = ?2, updated_at = ?2 WHERE id = ?3",
            params![message, now, bucket_id],
        )?;
        Ok(())
    }

    async fn append_processing_log(&self, entry: &ProcessingLogEntry) -> StoreResult<()> {
        let conn = self.conn()?;
        insert_processing_entry(&conn, entry)?;
        Ok(())
    }

    async fn processing_log(&self, bucket_id: BucketId) -> StoreResult<Vec<ProcessingLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT claim_id, bucket_id, charged_amount, paid_amount, status, rejection_reason, created_at
             FROM processing_log WHERE bucket_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([bucket_id], processing_entry_from_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    async fn approval_log(&self, bucket_id: BucketId) -> StoreResult<Vec<ApprovalLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT bucket_id, action, actor, comments, scheduled_for, created_at
             FROM approval_log WHERE bucket_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([bucket_id], |row| {
            Ok(ApprovalLogEntry {
                bucket_id: row.get(0)?,
                action: enum_at(row, 1, ApprovalAction::parse)?,
                actor: row.get(2)?,
                comments: row.get(3)?,
                scheduled_for: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    async fn claim_ids(&self, bucket_id: BucketId) -> StoreResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT claim_id FROM processing_log
             WHERE bucket_id = ?1 AND status = 'PROCESSED' ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([bucket_id], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    async fn buckets_in_status(&self, status: BucketStatus) -> StoreResult<Vec<Bucket>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM buckets WHERE status = ?1 ORDER BY id ASC",
            BUCKET_COLUMNS
        ))?;
        let rows = stmt.query_map([status.as_str()], bucket_from_row)?;

        let mut buckets = Vec::new();
        for row in rows {
            buckets.push(row?);
        }
        Ok(buckets)
    }
}
