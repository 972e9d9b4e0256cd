//! Threshold evaluation
//!
//! Thresholds are matched to a bucket by `rule_id` equality against the
//! configuration snapshot. A bucket becomes release-eligible the moment any
//! linked active threshold fires; evaluation stops at the first match.

use super::types::{Bucket, Threshold, ThresholdType};

/// First active threshold linked to the bucket's rule that fires, if any
///
/// No linked thresholds means the bucket never becomes eligible on its own.
pub fn evaluate<'a>(bucket: &Bucket, thresholds: &'a [Threshold], now: i64) -> Option<&'a Threshold> {
    thresholds
        .iter()
        .filter(|t| t.active && t.rule_id == bucket.rule_id)
        .find(|t| fires(bucket, t, now))
}

/// Whether a single threshold fires for the bucket at `now`
pub fn fires(bucket: &Bucket, threshold: &Threshold, now: i64) -> bool {
    match threshold.threshold_type {
        ThresholdType::ClaimCount => count_reached(bucket, threshold),
        ThresholdType::Amount => amount_reached(bucket, threshold),
        ThresholdType::Time => window_elapsed(bucket, threshold, now),
        ThresholdType::Hybrid => {
            count_reached(bucket, threshold)
                || amount_reached(bucket, threshold)
                || window_elapsed(bucket, threshold, now)
        }
    }
}

fn count_reached(bucket: &Bucket, threshold: &Threshold) -> bool {
    threshold
        .max_claims
        .map(|max| bucket.claim_count >= max)
        .unwrap_or(false)
}

fn amount_reached(bucket: &Bucket, threshold: &Threshold) -> bool {
    threshold
        .max_amount
        .map(|max| bucket.total_amount >= max)
        .unwrap_or(false)
}

fn window_elapsed(bucket: &Bucket, threshold: &Threshold, now: i64) -> bool {
    threshold
        .time_window
        .map(|window| bucket.age_seconds(now) >= window.seconds())
        .unwrap_or(false)
}

/// Short human description of why a threshold fired, for logs
pub fn describe(threshold: &Threshold) -> String {
    let mut bounds = Vec::new();
    if let Some(max) = threshold.max_claims {
        bounds.push(format!("claims>={}", max));
    }
    if let Some(max) = threshold.max_amount {
        bounds.push(format!("amount>={}", max));
    }
    if let Some(window) = threshold.time_window {
        bounds.push(format!("age>={}", window.as_str()));
    }
    format!(
        "'{}' ({} {})",
        threshold.name,
        threshold.threshold_type.as_str(),
        bounds.join(" | ")
    )
}
