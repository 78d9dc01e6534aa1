//! Row filter predicates
//!
//! Mapping rules may carry a JSON predicate tree that decides whether a row
//! change reaches the target at all. The tree is parsed once at configuration
//! load into a [`Predicate`]; evaluation at event time is total — a missing
//! column compares unequal to any literal and `null` never satisfies an
//! ordering operator.
//!
//! Grammar:
//! - leaf: `{"<col>": {"<op>": <literal>}}` with op ∈ eq, gt, gte, lt, lte
//! - shorthand leaf: `{"<col>": <literal>}` (implicit eq)
//! - unary: `{"not": <predicate>}`
//! - n-ary: `{"and": [...]}`, `{"or": [...]}`
//! - an object with several keys is the conjunction of its entries

use crate::error::{EtlError, EtlResult};
use crate::events::Row;
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    fn from_key(key: &str) -> Option<Self> {
        match key {
            "eq" => Some(CompareOp::Eq),
            "gt" => Some(CompareOp::Gt),
            "gte" => Some(CompareOp::Gte),
            "lt" => Some(CompareOp::Lt),
            "lte" => Some(CompareOp::Lte),
            _ => None,
        }
    }
}

/// Parsed filter predicate tree
#[derive(Debug, Clone)]
pub enum Predicate {
    Compare {
        column: String,
        op: CompareOp,
        literal: Value,
    },
    Not(Box<Predicate>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    /// Parse a JSON predicate tree, rejecting unknown operators and
    /// malformed nodes. Used at configuration load.
    pub fn parse(raw: &Value) -> EtlResult<Predicate> {
        let obj = raw
            .as_object()
            .ok_or_else(|| EtlError::filter("predicate must be a JSON object"))?;
        if obj.is_empty() {
            return Err(EtlError::filter("predicate object is empty"));
        }

        let mut parts = Vec::with_capacity(obj.len());
        for (key, value) in obj {
            parts.push(Self::parse_entry(key, value)?);
        }

        Ok(if parts.len() == 1 {
            parts.pop().expect("one element")
        } else {
            Predicate::And(parts)
        })
    }

    fn parse_entry(key: &str, value: &Value) -> EtlResult<Predicate> {
        match key {
            "not" => Ok(Predicate::Not(Box::new(Self::parse(value)?))),
            "and" | "or" => {
                let items = value.as_array().ok_or_else(|| {
                    EtlError::filter(format!("'{key}' requires an array of predicates"))
                })?;
                if items.is_empty() {
                    return Err(EtlError::filter(format!("'{key}' requires at least one predicate")));
                }
                let parsed = items
                    .iter()
                    .map(Self::parse)
                    .collect::<EtlResult<Vec<_>>>()?;
                Ok(if key == "and" {
                    Predicate::And(parsed)
                } else {
                    Predicate::Or(parsed)
                })
            }
            column => Self::parse_leaf(column, value),
        }
    }

    fn parse_leaf(column: &str, value: &Value) -> EtlResult<Predicate> {
        match value {
            Value::Object(ops) if !ops.is_empty() => {
                let mut compares = Vec::with_capacity(ops.len());
                for (op_key, literal) in ops {
                    let op = CompareOp::from_key(op_key).ok_or_else(|| {
                        EtlError::filter(format!(
                            "unsupported operator '{op_key}' on column '{column}'"
                        ))
                    })?;
                    compares.push(Predicate::Compare {
                        column: column.to_string(),
                        op,
                        literal: literal.clone(),
                    });
                }
                Ok(if compares.len() == 1 {
                    compares.pop().expect("one element")
                } else {
                    Predicate::And(compares)
                })
            }
            Value::Object(_) => Err(EtlError::filter(format!(
                "empty operator object on column '{column}'"
            ))),
            literal => Ok(Predicate::Compare {
                column: column.to_string(),
                op: CompareOp::Eq,
                literal: literal.clone(),
            }),
        }
    }

    /// Evaluate the predicate against a row. Total: never fails.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Predicate::Compare {
                column,
                op,
                literal,
            } => match row.get(column) {
                // Missing columns compare unequal to any literal
                None => false,
                Some(actual) => compare(actual, *op, literal),
            },
            Predicate::Not(inner) => !inner.matches(row),
            Predicate::And(parts) => parts.iter().all(|p| p.matches(row)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(row)),
        }
    }
}

fn compare(actual: &Value, op: CompareOp, literal: &Value) -> bool {
    match op {
        CompareOp::Eq => values_equal(actual, literal),
        _ => match order_values(actual, literal) {
            Some(ordering) => match op {
                CompareOp::Gt => ordering == Ordering::Greater,
                CompareOp::Gte => ordering != Ordering::Less,
                CompareOp::Lt => ordering == Ordering::Less,
                CompareOp::Lte => ordering != Ordering::Greater,
                CompareOp::Eq => unreachable!(),
            },
            None => false,
        },
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        // Numeric comparison so that 18 == 18.0
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordering between two values, or `None` when no order is defined.
/// `null` is never ordered against anything.
fn order_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        let mut r = Row::new();
        for (k, v) in pairs {
            r.insert(k.to_string(), v.clone());
        }
        r
    }

    fn parse(raw: Value) -> Predicate {
        Predicate::parse(&raw).unwrap()
    }

    #[test]
    fn test_implicit_and_over_columns() {
        // Spec scenario: {"status": {"eq": "active"}, "age": {"gte": 18}}
        let p = parse(json!({"status": {"eq": "active"}, "age": {"gte": 18}}));
        assert!(!p.matches(&row(&[("status", json!("active")), ("age", json!(17))])));
        assert!(p.matches(&row(&[("status", json!("active")), ("age", json!(18))])));
        assert!(!p.matches(&row(&[("status", json!("idle")), ("age", json!(30))])));
    }

    #[test]
    fn test_nested_and_or() {
        // Spec scenario 4
        let p = parse(json!({"and": [
            {"status": {"eq": "active"}},
            {"or": [
                {"category": {"eq": "premium"}},
                {"score": {"gte": 90}}
            ]}
        ]}));
        assert!(p.matches(&row(&[
            ("status", json!("active")),
            ("category", json!("free")),
            ("score", json!(95)),
        ])));
        assert!(!p.matches(&row(&[
            ("status", json!("active")),
            ("category", json!("free")),
            ("score", json!(80)),
        ])));
    }

    #[test]
    fn test_missing_column_is_false() {
        let p = parse(json!({"status": {"eq": "active"}}));
        assert!(!p.matches(&row(&[("other", json!("active"))])));

        let ordering = parse(json!({"age": {"gte": 18}}));
        assert!(!ordering.matches(&Row::new()));
    }

    #[test]
    fn test_null_never_satisfies_ordering() {
        let p = parse(json!({"age": {"gte": 18}}));
        assert!(!p.matches(&row(&[("age", Value::Null)])));
        let lt = parse(json!({"age": {"lt": 18}}));
        assert!(!lt.matches(&row(&[("age", Value::Null)])));
    }

    #[test]
    fn test_null_literal_equality() {
        let p = parse(json!({"deleted_at": {"eq": null}}));
        assert!(p.matches(&row(&[("deleted_at", Value::Null)])));
        // Missing column still compares unequal
        assert!(!p.matches(&Row::new()));
    }

    #[test]
    fn test_not() {
        let p = parse(json!({"not": {"status": {"eq": "blocked"}}}));
        assert!(p.matches(&row(&[("status", json!("active"))])));
        assert!(!p.matches(&row(&[("status", json!("blocked"))])));
    }

    #[test]
    fn test_eq_shorthand_and_numeric_coercion() {
        let p = parse(json!({"age": 18}));
        assert!(p.matches(&row(&[("age", json!(18.0))])));
        assert!(!p.matches(&row(&[("age", json!(19))])));
    }

    #[test]
    fn test_range_on_one_column() {
        let p = parse(json!({"age": {"gte": 18, "lt": 65}}));
        assert!(p.matches(&row(&[("age", json!(40))])));
        assert!(!p.matches(&row(&[("age", json!(70))])));
    }

    #[test]
    fn test_string_ordering() {
        let p = parse(json!({"name": {"gt": "m"}}));
        assert!(p.matches(&row(&[("name", json!("zoe"))])));
        assert!(!p.matches(&row(&[("name", json!("anna"))])));
        // Cross-type ordering is undefined, therefore false
        assert!(!p.matches(&row(&[("name", json!(5))])));
    }

    #[test]
    fn test_unknown_operator_rejected() {
        assert!(Predicate::parse(&json!({"age": {"between": [1, 2]}})).is_err());
        assert!(Predicate::parse(&json!({"and": "notalist"})).is_err());
        assert!(Predicate::parse(&json!({})).is_err());
    }
}
