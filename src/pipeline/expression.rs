//! Grouping expressions for CUSTOM bucketing rules
//!
//! A tiny predicate language, evaluated against a claim:
//!
//! ```text
//! payer == "P1" && bin ^= 610 && paid >= 250.00
//! ```
//!
//! Clauses are joined by `&&` and all must hold. Fields: `payer`, `payee`,
//! `bin`, `pcn`, `status`, `paid`, `charged`. Operators: `==`, `!=`, `^=`
//! (starts with), and `>=`, `<=`, `>`, `<` on the amount fields only.
//! Text comparison is exact; an absent BIN/PCN compares as the empty string.

use super::types::Claim;
use rust_decimal::Decimal;
use std::str::FromStr;

// Two-character operators first so `>=` is not read as `>`
const OPERATORS: &[(&str, Op)] = &[
    (">=", Op::Ge),
    ("<=", Op::Le),
    ("==", Op::Eq),
    ("!=", Op::Ne),
    ("^=", Op::StartsWith),
    (">", Op::Gt),
    ("<", Op::Lt),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    StartsWith,
    Ge,
    Le,
    Gt,
    Lt,
}

impl Op {
    fn is_ordering(&self) -> bool {
        matches!(self, Op::Ge | Op::Le | Op::Gt | Op::Lt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Payer,
    Payee,
    Bin,
    Pcn,
    Status,
    Paid,
    Charged,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "payer" => Some(Field::Payer),
            "payee" => Some(Field::Payee),
            "bin" => Some(Field::Bin),
            "pcn" => Some(Field::Pcn),
            "status" => Some(Field::Status),
            "paid" => Some(Field::Paid),
            "charged" => Some(Field::Charged),
            _ => None,
        }
    }

    fn is_amount(&self) -> bool {
        matches!(self, Field::Paid | Field::Charged)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Text(String),
    Amount(Decimal),
}

#[derive(Debug, Clone, PartialEq)]
struct Clause {
    field: Field,
    op: Op,
    operand: Operand,
}

impl Clause {
    fn parse(src: &str) -> Result<Self, String> {
        let (idx, symbol, op) = OPERATORS
            .iter()
            .filter_map(|(symbol, op)| src.find(symbol).map(|idx| (idx, *symbol, *op)))
            .min_by_key(|(idx, symbol, _)| (*idx, std::cmp::Reverse(symbol.len())))
            .ok_or_else(|| format!("no operator in clause '{}'", src.trim()))?;

        let field_name = &src[..idx];
        let field = Field::parse(field_name)
            .ok_or_else(|| format!("unknown field '{}'", field_name.trim()))?;

        let raw_value = unquote(&src[idx + symbol.len()..]);

        if op.is_ordering() && !field.is_amount() {
            return Err(format!("operator '{}' needs an amount field", symbol));
        }

        let operand = if field.is_amount() {
            if op == Op::StartsWith {
                return Err("'^=' is not defined on amounts".to_string());
            }
            Operand::Amount(
                Decimal::from_str(&raw_value)
                    .map_err(|e| format!("invalid amount '{}': {}", raw_value, e))?,
            )
        } else {
            Operand::Text(raw_value)
        };

        Ok(Self { field, op, operand })
    }

    fn matches(&self, claim: &Claim) -> bool {
        match &self.operand {
            Operand::Amount(bound) => {
                let value = match self.field {
                    Field::Paid => claim.paid_amount,
                    _ => claim.charged_amount,
                };
                match self.op {
                    Op::Eq => value == *bound,
                    Op::Ne => value != *bound,
                    Op::Ge => value >= *bound,
                    Op::Le => value <= *bound,
                    Op::Gt => value > *bound,
                    Op::Lt => value < *bound,
                    Op::StartsWith => false,
                }
            }
            Operand::Text(expected) => {
                let value = match self.field {
                    Field::Payer => claim.payer_key.as_str(),
                    Field::Payee => claim.payee_key.as_str(),
                    Field::Bin => claim.bin_number.as_deref().unwrap_or(""),
                    Field::Pcn => claim.pcn.as_deref().unwrap_or(""),
                    _ => claim.status.as_str(),
                };
                match self.op {
                    Op::Eq => value == expected,
                    Op::Ne => value != expected,
                    Op::StartsWith => !value.is_empty() && value.starts_with(expected.as_str()),
                    _ => false,
                }
            }
        }
    }
}

fn unquote(raw: &str) -> String {
    let trimmed = raw.trim();
    let quoted = trimmed.len() >= 2
        && ((trimmed.starts_with('"') && trimmed.ends_with('"'))
            || (trimmed.starts_with('\'') && trimmed.ends_with('\'')));
    if quoted {
        trimmed[1..trimmed.len() - 1].to_string()
    } else {
        trimmed.to_string()
    }
}

/// Parsed grouping expression
#[derive(Debug, Clone, PartialEq)]
pub struct GroupingExpression {
    clauses: Vec<Clause>,
}

impl GroupingExpression {
    pub fn parse(src: &str) -> Result<Self, String> {
        if src.trim().is_empty() {
            return Err("empty grouping expression".to_string());
        }

        let clauses = src
            .split("&&")
            .map(Clause::parse)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { clauses })
    }

    pub fn matches(&self, claim: &Claim) -> bool {
        self.clauses.iter().all(|clause| clause.matches(claim))
    }
}
