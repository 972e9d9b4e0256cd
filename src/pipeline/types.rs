//! Core data types for claim bucketing
//!
//! Configuration entities (rules, thresholds, commit criteria) and buckets
//! reference each other only through identifiers (`RuleId`, `BucketId`).
//! Nothing here holds a live handle to another entity; every link is resolved
//! by an identifier lookup against the current configuration snapshot.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub type RuleId = i64;
pub type BucketId = i64;

/// Unix-seconds clock, injectable for deterministic tests
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp())
}

/// Adjudicated claim, parsed from a change-feed payload
///
/// Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub claim_id: String,
    pub payer_key: String,
    pub payee_key: String,
    pub bin_number: Option<String>,
    pub pcn: Option<String>,
    pub charged_amount: Decimal,
    pub paid_amount: Decimal,
    /// Upstream adjudication status, upper-cased
    pub status: String,
    pub service_date: Option<NaiveDate>,
}

impl Claim {
    /// True when the claim carries a non-empty BIN number
    pub fn has_bin(&self) -> bool {
        self.bin_number
            .as_deref()
            .map(|bin| !bin.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Kind of bucketing rule, decides the applicability test and grouping key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleKind {
    PayerPayee,
    BinPcn,
    Custom,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::PayerPayee => "PAYER_PAYEE",
            RuleKind::BinPcn => "BIN_PCN",
            RuleKind::Custom => "CUSTOM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PAYER_PAYEE" => Some(RuleKind::PayerPayee),
            "BIN_PCN" => Some(RuleKind::BinPcn),
            "CUSTOM" => Some(RuleKind::Custom),
            _ => None,
        }
    }
}

/// Bucketing rule (configuration, read-only to the engine)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketingRule {
    pub id: RuleId,
    pub name: String,
    pub kind: RuleKind,
    /// Higher priority is evaluated first
    pub priority: i32,
    pub payer_key: Option<String>,
    pub payee_key: Option<String>,
    pub grouping_expression: Option<String>,
    pub active: bool,
}

/// Threshold type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThresholdType {
    ClaimCount,
    Amount,
    Time,
    Hybrid,
}

impl ThresholdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdType::ClaimCount => "CLAIM_COUNT",
            ThresholdType::Amount => "AMOUNT",
            ThresholdType::Time => "TIME",
            ThresholdType::Hybrid => "HYBRID",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CLAIM_COUNT" => Some(ThresholdType::ClaimCount),
            "AMOUNT" => Some(ThresholdType::Amount),
            "TIME" => Some(ThresholdType::Time),
            "HYBRID" => Some(ThresholdType::Hybrid),
            _ => None,
        }
    }
}

/// Age bound for TIME / HYBRID thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeWindow {
    Daily,
    Weekly,
    Monthly,
}

impl TimeWindow {
    /// Window length in seconds (a month is 30 days)
    pub fn seconds(&self) -> i64 {
        match self {
            TimeWindow::Daily => 86_400,
            TimeWindow::Weekly => 7 * 86_400,
            TimeWindow::Monthly => 30 * 86_400,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeWindow::Daily => "DAILY",
            TimeWindow::Weekly => "WEEKLY",
            TimeWindow::Monthly => "MONTHLY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DAILY" => Some(TimeWindow::Daily),
            "WEEKLY" => Some(TimeWindow::Weekly),
            "MONTHLY" => Some(TimeWindow::Monthly),
            _ => None,
        }
    }
}

/// Release threshold linked to a rule by `rule_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub id: i64,
    pub name: String,
    pub threshold_type: ThresholdType,
    pub max_claims: Option<i64>,
    pub max_amount: Option<Decimal>,
    pub time_window: Option<TimeWindow>,
    pub rule_id: RuleId,
    pub active: bool,
}

/// Commit mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitMode {
    Auto,
    Manual,
    Hybrid,
}

impl CommitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitMode::Auto => "AUTO",
            CommitMode::Manual => "MANUAL",
            CommitMode::Hybrid => "HYBRID",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AUTO" => Some(CommitMode::Auto),
            "MANUAL" => Some(CommitMode::Manual),
            "HYBRID" => Some(CommitMode::Hybrid),
            _ => None,
        }
    }
}

/// Commit policy linked to a rule by `rule_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitCriteria {
    pub id: i64,
    pub name: String,
    pub mode: CommitMode,
    pub auto_trigger_amount: Option<Decimal>,
    pub manual_trigger_amount: Option<Decimal>,
    pub required_approval_roles: Vec<String>,
    pub override_permissions: Vec<String>,
    pub rule_id: RuleId,
    pub active: bool,
}

/// Bucket lifecycle state
///
/// ```text
/// ACCUMULATING ──▶ PENDING_APPROVAL ──▶ GENERATING ──▶ COMPLETED
///      │  ▲               │                  │
///      │  └── reject ─────┘                  └──▶ FAILED ──(redrive)──▶ GENERATING
///      └────────── auto-release / override ──▶ GENERATING
/// any non-terminal state ──▶ MISSING_CONFIGURATION ──(config fixed)──▶ ACCUMULATING
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BucketStatus {
    Accumulating,
    PendingApproval,
    Generating,
    Completed,
    Failed,
    MissingConfiguration,
}

impl BucketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketStatus::Accumulating => "ACCUMULATING",
            BucketStatus::PendingApproval => "PENDING_APPROVAL",
            BucketStatus::Generating => "GENERATING",
            BucketStatus::Completed => "COMPLETED",
            BucketStatus::Failed => "FAILED",
            BucketStatus::MissingConfiguration => "MISSING_CONFIGURATION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACCUMULATING" => Some(BucketStatus::Accumulating),
            "PENDING_APPROVAL" => Some(BucketStatus::PendingApproval),
            "GENERATING" => Some(BucketStatus::Generating),
            "COMPLETED" => Some(BucketStatus::Completed),
            "FAILED" => Some(BucketStatus::Failed),
            "MISSING_CONFIGURATION" => Some(BucketStatus::MissingConfiguration),
            _ => None,
        }
    }

    /// Open buckets still take claims for their grouping key
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            BucketStatus::Accumulating | BucketStatus::MissingConfiguration
        )
    }

    /// Legal edges of the lifecycle graph
    pub fn can_transition_to(&self, next: BucketStatus) -> bool {
        use BucketStatus::*;
        matches!(
            (self, next),
            (Accumulating, PendingApproval)
                | (Accumulating, Generating)
                | (Accumulating, MissingConfiguration)
                | (PendingApproval, Generating)
                | (PendingApproval, Accumulating)
                | (PendingApproval, MissingConfiguration)
                | (Generating, Completed)
                | (Generating, Failed)
                | (Generating, MissingConfiguration)
                | (Failed, Generating)
                | (Failed, MissingConfiguration)
                | (MissingConfiguration, Accumulating)
        )
    }
}

impl fmt::Display for BucketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accumulating group of claims destined for one release
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: BucketId,
    pub status: BucketStatus,
    pub rule_id: RuleId,
    pub grouping_key: String,
    pub payer_key: String,
    pub payee_key: String,
    pub bin_number: Option<String>,
    pub pcn: Option<String>,
    pub claim_count: i64,
    pub total_amount: Decimal,
    /// Number of times an approver rejected this bucket
    pub rejection_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub awaiting_approval_since: Option<i64>,
    pub approved_by: Option<String>,
    pub approved_at: Option<i64>,
    pub generation_started_at: Option<i64>,
    pub generation_completed_at: Option<i64>,
    pub last_error: Option<String>,
    pub last_error_at: Option<i64>,
}

impl Bucket {
    /// Seconds since the bucket was created (never negative)
    pub fn age_seconds(&self, now: i64) -> i64 {
        (now - self.created_at).max(0)
    }
}

/// Fields needed to create a bucket for a new grouping key
#[derive(Debug, Clone, PartialEq)]
pub struct NewBucket {
    pub rule_id: RuleId,
    pub grouping_key: String,
    pub payer_key: String,
    pub payee_key: String,
    pub bin_number: Option<String>,
    pub pcn: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Processed,
    Rejected,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Processed => "PROCESSED",
            ProcessingStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PROCESSED" => Some(ProcessingStatus::Processed),
            "REJECTED" => Some(ProcessingStatus::Rejected),
            _ => None,
        }
    }
}

/// Per-claim audit record (append-only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    pub claim_id: String,
    pub bucket_id: Option<BucketId>,
    pub charged_amount: Option<Decimal>,
    pub paid_amount: Option<Decimal>,
    pub status: ProcessingStatus,
    pub rejection_reason: Option<String>,
    pub created_at: i64,
}

impl ProcessingLogEntry {
    pub fn for_processed_claim(claim: &Claim, bucket_id: BucketId, now: i64) -> Self {
        Self {
            claim_id: claim.claim_id.clone(),
            bucket_id: Some(bucket_id),
            charged_amount: Some(claim.charged_amount),
            paid_amount: Some(claim.paid_amount),
            status: ProcessingStatus::Processed,
            rejection_reason: None,
            created_at: now,
        }
    }

    /// Rejected claims are never linked to a bucket
    pub fn for_rejected_claim(claim_id: impl Into<String>, reason: impl Into<String>, now: i64) -> Self {
        Self {
            claim_id: claim_id.into(),
            bucket_id: None,
            charged_amount: None,
            paid_amount: None,
            status: ProcessingStatus::Rejected,
            rejection_reason: Some(reason.into()),
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalAction {
    Approve,
    Reject,
    Override,
    Redrive,
}

impl ApprovalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalAction::Approve => "APPROVE",
            ApprovalAction::Reject => "REJECT",
            ApprovalAction::Override => "OVERRIDE",
            ApprovalAction::Redrive => "REDRIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "APPROVE" => Some(ApprovalAction::Approve),
            "REJECT" => Some(ApprovalAction::Reject),
            "OVERRIDE" => Some(ApprovalAction::Override),
            "REDRIVE" => Some(ApprovalAction::Redrive),
            _ => None,
        }
    }
}

impl fmt::Display for ApprovalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-transition audit record (append-only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalLogEntry {
    pub bucket_id: BucketId,
    pub action: ApprovalAction,
    pub actor: String,
    pub comments: Option<String>,
    pub scheduled_for: Option<i64>,
    pub created_at: i64,
}

/// Position in the change feed, ordered by `(position, sequence)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct FeedPosition {
    pub position: i64,
    pub sequence: i64,
}

impl FeedPosition {
    /// Before every event in the feed
    pub const START: FeedPosition = FeedPosition { position: 0, sequence: 0 };

    pub fn new(position: i64, sequence: i64) -> Self {
        Self { position, sequence }
    }
}

impl fmt::Display for FeedPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.position, self.sequence)
    }
}

/// Raw change event as delivered by the feed source
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEvent {
    pub position: FeedPosition,
    pub payload: String,
}

/// Durable ingestion progress of one logical consumer
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub consumer_id: String,
    pub last_position: FeedPosition,
    pub total_processed: i64,
    /// Bumped every time the consumer is told to reprocess everything
    pub epoch: i64,
    pub last_checkpoint_at: Option<i64>,
}

impl Checkpoint {
    pub fn initial(consumer_id: &str) -> Self {
        Self {
            consumer_id: consumer_id.to_string(),
            last_position: FeedPosition::START,
            total_processed: 0,
            epoch: 0,
            last_checkpoint_at: None,
        }
    }
}

/// Operator performing an administrative action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub name: String,
    pub roles: Vec<String>,
}

impl Actor {
    pub fn new(name: impl Into<String>, roles: &[&str]) -> Self {
        Self {
            name: name.into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    /// An empty requirement list admits everyone
    pub fn holds_any(&self, required: &[String]) -> bool {
        required.is_empty()
            || required
                .iter()
                .any(|role| self.roles.iter().any(|held| held.eq_ignore_ascii_case(role)))
    }
}

/// "Bucket ready for release" notification handed to the file generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseNotice {
    pub bucket_id: BucketId,
    pub rule_id: RuleId,
    pub payer_key: String,
    pub payee_key: String,
    pub bin_number: Option<String>,
    pub pcn: Option<String>,
    pub claim_count: i64,
    pub total_amount: Decimal,
    pub claim_ids: Vec<String>,
    pub released_at: i64,
}
