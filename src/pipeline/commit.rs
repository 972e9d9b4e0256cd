//! Commit policy: what happens once a threshold fires
//!
//! The decision is advisory; the lifecycle manager performs the transition.

use super::types::{Bucket, CommitCriteria, CommitMode};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitDecision {
    /// Straight to GENERATING
    AutoRelease,
    /// Park in PENDING_APPROVAL
    RequireApproval,
}

impl fmt::Display for CommitDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitDecision::AutoRelease => f.write_str("AUTO_RELEASE"),
            CommitDecision::RequireApproval => f.write_str("REQUIRE_APPROVAL"),
        }
    }
}

/// Apply the rule's commit criteria to an eligible bucket
///
/// No criteria means MANUAL. HYBRID auto-releases once the bucket total
/// reaches the auto-trigger bound and asks for approval below it (or when
/// no bound is configured).
pub fn decide(bucket: &Bucket, criteria: Option<&CommitCriteria>) -> CommitDecision {
    let Some(criteria) = criteria else {
        return CommitDecision::RequireApproval;
    };

    match criteria.mode {
        CommitMode::Auto => CommitDecision::AutoRelease,
        CommitMode::Manual => CommitDecision::RequireApproval,
        CommitMode::Hybrid => match criteria.auto_trigger_amount {
            Some(bound) if bucket.total_amount >= bound => CommitDecision::AutoRelease,
            _ => CommitDecision::RequireApproval,
        },
    }
}
