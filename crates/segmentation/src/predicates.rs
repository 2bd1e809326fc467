//! Operator semantics for segment rules.
//!
//! Every comparison is total: a type mismatch or an uncoercible operand makes
//! the rule false, never an error.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use mailflow_core::types::RuleOperator;
use serde_json::Value;

/// A contact attribute resolved for one rule.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// The field does not exist on this contact (unknown custom field).
    Missing,
    /// A known attribute with no value.
    Empty,
    List(Vec<String>),
    Text(String),
    Number(f64),
    Time(DateTime<Utc>),
    Json(Value),
}

impl FieldValue {
    fn is_empty(&self) -> bool {
        match self {
            FieldValue::Missing | FieldValue::Empty => true,
            FieldValue::List(items) => items.is_empty(),
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::Number(_) | FieldValue::Time(_) => false,
            FieldValue::Json(v) => match v {
                Value::Null => true,
                Value::String(s) => s.trim().is_empty(),
                Value::Array(a) => a.is_empty(),
                Value::Object(o) => o.is_empty(),
                Value::Bool(_) | Value::Number(_) => false,
            },
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Time(t) => Some(epoch_secs(t)),
            FieldValue::Text(s) => parse_number(s),
            FieldValue::Json(v) => coerce_number(v),
            FieldValue::Missing | FieldValue::Empty | FieldValue::List(_) => None,
        }
    }
}

fn epoch_secs(t: &DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64 / 1000.0
}

fn parse_number(s: &str) -> Option<f64> {
    let s = s.trim();
    if let Ok(n) = s.parse::<f64>() {
        return n.is_finite().then_some(n);
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| epoch_secs(&t.with_timezone(&Utc)))
}

/// Numbers pass through; strings are parsed as decimals or RFC 3339
/// timestamps (epoch seconds). Anything else is not a number.
pub fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

/// Evaluate one operator. `Missing` fields are false under every operator.
pub fn evaluate(actual: &FieldValue, operator: RuleOperator, expected: Option<&Value>) -> bool {
    if *actual == FieldValue::Missing {
        return false;
    }
    match operator {
        RuleOperator::IsEmpty => return actual.is_empty(),
        RuleOperator::IsNotEmpty => return !actual.is_empty(),
        _ => {}
    }
    let Some(expected) = expected.filter(|v| !v.is_null()) else {
        return false;
    };
    match operator {
        RuleOperator::Contains => contains(actual, expected).unwrap_or(false),
        RuleOperator::NotContains => contains(actual, expected).is_some_and(|hit| !hit),
        RuleOperator::Equals => equals(actual, expected),
        RuleOperator::NotEquals => !equals(actual, expected),
        RuleOperator::GreaterThan => numeric_cmp(actual, expected) == Some(Ordering::Greater),
        RuleOperator::LessThan => numeric_cmp(actual, expected) == Some(Ordering::Less),
        RuleOperator::IsEmpty | RuleOperator::IsNotEmpty => false,
    }
}

/// Substring or membership test. `None` when the test does not apply to the
/// operand types.
fn contains(actual: &FieldValue, expected: &Value) -> Option<bool> {
    match actual {
        FieldValue::Empty => Some(false),
        FieldValue::List(items) => expected.as_str().map(|e| items.iter().any(|i| i == e)),
        FieldValue::Text(s) => expected.as_str().map(|e| s.contains(e)),
        FieldValue::Json(Value::String(s)) => expected.as_str().map(|e| s.contains(e)),
        FieldValue::Json(Value::Array(items)) => Some(items.contains(expected)),
        FieldValue::Json(Value::Null) => Some(false),
        _ => None,
    }
}

fn equals(actual: &FieldValue, expected: &Value) -> bool {
    match actual {
        FieldValue::Missing | FieldValue::Empty => false,
        FieldValue::List(items) => match expected {
            Value::String(e) => items.len() == 1 && items[0] == *e,
            Value::Array(wanted) => {
                let mut wanted: Vec<&str> = match wanted.iter().map(Value::as_str).collect() {
                    Some(w) => w,
                    None => return false,
                };
                wanted.sort_unstable();
                wanted.dedup();
                let mut have: Vec<&str> = items.iter().map(String::as_str).collect();
                have.sort_unstable();
                have.dedup();
                have == wanted
            }
            _ => false,
        },
        FieldValue::Text(s) => match expected {
            Value::String(e) => s == e,
            Value::Number(_) => parse_number(s).zip(coerce_number(expected)).is_some_and(|(a, b)| a == b),
            _ => false,
        },
        FieldValue::Number(_) | FieldValue::Time(_) => {
            actual.as_number().zip(coerce_number(expected)).is_some_and(|(a, b)| a == b)
        }
        FieldValue::Json(v) => {
            v == expected
                || matches!(v, Value::Number(_))
                    && coerce_number(v).zip(coerce_number(expected)).is_some_and(|(a, b)| a == b)
        }
    }
}

fn numeric_cmp(actual: &FieldValue, expected: &Value) -> Option<Ordering> {
    let a = actual.as_number()?;
    let b = coerce_number(expected)?;
    a.partial_cmp(&b)
}
