//! Claim filter: raw feed payload -> `Claim`
//!
//! Only claims in a settled adjudication status pass. Malformed or
//! incomplete payloads are rejected with a reason; the caller records the
//! rejection in the processing log. Nothing here returns an error past the
//! batch boundary.

use super::types::Claim;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;

/// Largest paid or charged amount a single claim may carry
pub const MAX_CLAIM_AMOUNT: Decimal = Decimal::from_parts(1_000_000_000, 0, 0, false, 0);

/// Outcome of filtering one change event
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutcome {
    /// Settled, well-formed claim
    Accepted(Claim),
    /// Well-formed but not settled yet; not an error, not logged as rejected
    Skipped { claim_id: String, status: String },
    /// Malformed or incomplete; `claim_id` is a placeholder when unknown
    Rejected { claim_id: String, reason: String },
}

/// Feed payload as written by the adjudication source
#[derive(Debug, Default, Deserialize)]
struct RawClaimPayload {
    #[serde(alias = "claimId", alias = "id")]
    claim_id: Option<Value>,
    #[serde(alias = "payerKey", alias = "payer")]
    payer_key: Option<String>,
    #[serde(alias = "payeeKey", alias = "payee")]
    payee_key: Option<String>,
    #[serde(alias = "binNumber", alias = "bin_number")]
    bin: Option<String>,
    pcn: Option<String>,
    #[serde(alias = "chargedAmount")]
    charged_amount: Option<Value>,
    #[serde(alias = "paidAmount")]
    paid_amount: Option<Value>,
    #[serde(alias = "adjudicationStatus")]
    status: Option<String>,
    #[serde(alias = "serviceDate")]
    service_date: Option<String>,
}

/// Filters change events on adjudication status and payload shape
#[derive(Debug, Clone)]
pub struct ClaimFilter {
    settled_statuses: Vec<String>,
}

impl ClaimFilter {
    /// `settled_statuses` are compared case-insensitively
    pub fn new(settled_statuses: Vec<String>) -> Self {
        Self {
            settled_statuses: settled_statuses
                .into_iter()
                .map(|s| s.trim().to_ascii_uppercase())
                .collect(),
        }
    }

    pub fn is_settled(&self, status: &str) -> bool {
        let status = status.trim().to_ascii_uppercase();
        self.settled_statuses.iter().any(|s| *s == status)
    }

    /// Parse and validate one payload
    ///
    /// `fallback_id` names the event in rejection records when the payload
    /// carries no usable claim id (typically the feed position).
    pub fn accept(&self, payload: &str, fallback_id: &str) -> FilterOutcome {
        let raw: RawClaimPayload = match serde_json::from_str(payload) {
            Ok(raw) => raw,
            Err(e) => {
                return FilterOutcome::Rejected {
                    claim_id: fallback_id.to_string(),
                    reason: format!("malformed payload: {}", e),
                }
            }
        };

        let claim_id = match raw.claim_id.as_ref().and_then(scalar_text) {
            Some(id) => id,
            None => {
                return FilterOutcome::Rejected {
                    claim_id: fallback_id.to_string(),
                    reason: "missing claim id".to_string(),
                }
            }
        };

        let reject = |reason: String| FilterOutcome::Rejected {
            claim_id: claim_id.clone(),
            reason,
        };

        let status = match non_blank(raw.status) {
            Some(status) => status.to_ascii_uppercase(),
            None => return reject("missing adjudication status".to_string()),
        };

        if !self.is_settled(&status) {
            return FilterOutcome::Skipped {
                claim_id: claim_id.clone(),
                status,
            };
        }

        let payer_key = match non_blank(raw.payer_key) {
            Some(payer) => payer,
            None => return reject("missing payer key".to_string()),
        };

        let payee_key = match non_blank(raw.payee_key) {
            Some(payee) => payee,
            None => return reject("missing payee key".to_string()),
        };

        let paid_amount = match raw.paid_amount.as_ref().map(parse_amount) {
            Some(Ok(amount)) => amount,
            Some(Err(e)) => return reject(format!("invalid paid amount: {}", e)),
            None => return reject("missing paid amount".to_string()),
        };

        if paid_amount.is_sign_negative() && !paid_amount.is_zero() {
            return reject(format!("negative paid amount {}", paid_amount));
        }
        if paid_amount > MAX_CLAIM_AMOUNT {
            return reject(format!(
                "paid amount {} exceeds ceiling {}",
                paid_amount, MAX_CLAIM_AMOUNT
            ));
        }

        let charged_amount = match raw.charged_amount.as_ref().map(parse_amount) {
            Some(Ok(amount)) => amount,
            Some(Err(e)) => return reject(format!("invalid charged amount: {}", e)),
            None => Decimal::ZERO,
        };
        if charged_amount.abs() > MAX_CLAIM_AMOUNT {
            return reject(format!(
                "charged amount {} exceeds ceiling {}",
                charged_amount, MAX_CLAIM_AMOUNT
            ));
        }

        let service_date = match non_blank(raw.service_date) {
            Some(text) => match NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
                Ok(date) => Some(date),
                Err(e) => return reject(format!("invalid service date '{}': {}", text, e)),
            },
            None => None,
        };

        FilterOutcome::Accepted(Claim {
            claim_id,
            payer_key,
            payee_key,
            bin_number: non_blank(raw.bin),
            pcn: non_blank(raw.pcn),
            charged_amount,
            paid_amount,
            status,
            service_date,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Claim ids may arrive as strings or numbers
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Amounts may arrive as JSON numbers or decimal strings
fn parse_amount(value: &Value) -> Result<Decimal, String> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        other => return Err(format!("expected number or string, got {}", other)),
    };

    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| format!("'{}': {}", text, e))
}
