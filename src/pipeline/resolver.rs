//! Rule resolution: pick the one bucketing rule that governs a claim
//!
//! Rules are walked in priority order (highest first) and the first whose
//! kind-specific applicability test passes wins. When nothing matches, the
//! lowest-priority rule is used as the fallback, so resolution only fails
//! when no rule is active at all.
//!
//! Several unconditional rules at different priorities will shadow the
//! lower ones. Resolution stays deterministic in that case; it does not try
//! to guess what the configurer meant.

use super::error::EngineError;
use super::snapshot::ConfigSnapshot;
use super::types::{BucketingRule, Claim, RuleKind};

/// Resolves claims against a configuration snapshot
pub struct RuleResolver;

impl RuleResolver {
    /// Applicable rule for the claim
    pub fn resolve<'a>(
        claim: &Claim,
        snapshot: &'a ConfigSnapshot,
    ) -> Result<&'a BucketingRule, EngineError> {
        let rules = snapshot.rules();

        if let Some(rule) = rules.iter().find(|rule| Self::applies(rule, claim, snapshot)) {
            return Ok(rule);
        }

        let fallback = rules.last().ok_or(EngineError::NoActiveRules)?;
        log::debug!(
            "🔧 Claim {} matched no rule; falling back to '{}' (priority {})",
            claim.claim_id,
            fallback.name,
            fallback.priority
        );
        Ok(fallback)
    }

    /// Kind-specific applicability test
    ///
    /// CUSTOM predicates come pre-parsed from the snapshot; a rule whose
    /// expression is missing or invalid never applies.
    pub fn applies(rule: &BucketingRule, claim: &Claim, snapshot: &ConfigSnapshot) -> bool {
        match rule.kind {
            RuleKind::PayerPayee => {
                scope_matches(rule.payer_key.as_deref(), &claim.payer_key)
                    && scope_matches(rule.payee_key.as_deref(), &claim.payee_key)
            }
            RuleKind::BinPcn => claim.has_bin(),
            RuleKind::Custom => snapshot
                .expression(rule.id)
                .map(|expression| expression.matches(claim))
                .unwrap_or(false),
        }
    }
}

/// Unset or blank scope admits any value
fn scope_matches(scope: Option<&str>, value: &str) -> bool {
    match scope.map(str::trim).filter(|s| !s.is_empty()) {
        Some(expected) => expected == value,
        None => true,
    }
}
