use std::cmp::Ordering;

use mailflow_core::types::{Contact, Variables};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::expr::{self, CompareOp, ConditionError, Expr};

/// Evaluates step conditions against a contact and the trigger payload.
///
/// Identifiers resolve as `contact.<field>`, `vars.<name>`, or bare
/// `<name>` (payload first, then contact). Values are only ever read.
#[derive(Debug, Clone, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// `true` for an absent or blank condition. Any parse or evaluation error
    /// is logged and treated as `false`.
    pub fn evaluate(&self, condition: Option<&str>, contact: &Contact, vars: &Variables) -> bool {
        let Some(source) = condition.filter(|c| !c.trim().is_empty()) else {
            return true;
        };
        match self.try_evaluate(source, contact, vars) {
            Ok(result) => result,
            Err(err) => {
                warn!(
                    contact_id = %contact.id,
                    condition = %source,
                    error = %err,
                    "Step condition failed to evaluate; treating as false"
                );
                false
            }
        }
    }

    pub fn try_evaluate(
        &self,
        source: &str,
        contact: &Contact,
        vars: &Variables,
    ) -> Result<bool, ConditionError> {
        let expr = expr::parse(source)?;
        let scope = Scope {
            contact: contact_scope(contact),
            vars,
        };
        match scope.eval(&expr)? {
            Value::Bool(b) => Ok(b),
            _ => Err(ConditionError::NotBoolean),
        }
    }

    /// Syntax check used when a sequence is saved.
    pub fn validate(&self, source: &str) -> Result<(), ConditionError> {
        expr::parse(source).map(|_| ())
    }
}

/// Read-only view of a contact as seen by conditions. Dates are epoch seconds.
pub fn contact_scope(contact: &Contact) -> Value {
    let mut map = Map::new();
    for (name, value) in &contact.custom_fields {
        map.insert(name.clone(), value.clone());
    }
    let builtins = json!({
        "id": contact.id.to_string(),
        "email": contact.email,
        "first_name": contact.first_name,
        "last_name": contact.last_name,
        "location": contact.location,
        "subscribed": contact.subscribed,
        "status": contact.status,
        "tags": contact.tags,
        "engagement": contact.engagement.engagement_score,
        "total_sent": contact.engagement.total_sent,
        "total_opened": contact.engagement.total_opened,
        "total_clicked": contact.engagement.total_clicked,
        "signup_date": contact.signup_date.timestamp(),
        "last_activity": contact.last_activity.map(|t| t.timestamp()),
        "custom": contact.custom_fields,
    });
    if let Value::Object(builtins) = builtins {
        map.extend(builtins);
    }
    Value::Object(map)
}

struct Scope<'a> {
    contact: Value,
    vars: &'a Variables,
}

impl Scope<'_> {
    fn eval(&self, expr: &Expr) -> Result<Value, ConditionError> {
        match expr {
            Expr::Number(n) => Ok(json!(n)),
            Expr::Str(s) => Ok(Value::String(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Null => Ok(Value::Null),
            Expr::Path(path) => self.lookup(path),
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Not(inner) => Ok(Value::Bool(!self.eval_bool(inner)?)),
            Expr::And(lhs, rhs) => Ok(Value::Bool(self.eval_bool(lhs)? && self.eval_bool(rhs)?)),
            Expr::Or(lhs, rhs) => Ok(Value::Bool(self.eval_bool(lhs)? || self.eval_bool(rhs)?)),
            Expr::Compare(op, lhs, rhs) => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                compare(*op, &lhs, &rhs).map(Value::Bool)
            }
        }
    }

    fn eval_bool(&self, expr: &Expr) -> Result<bool, ConditionError> {
        match self.eval(expr)? {
            Value::Bool(b) => Ok(b),
            other => Err(ConditionError::TypeMismatch(format!(
                "expected boolean operand, found {}",
                type_name(&other)
            ))),
        }
    }

    fn lookup(&self, path: &[String]) -> Result<Value, ConditionError> {
        let unknown = || ConditionError::UnknownIdentifier(path.join("."));
        let (root, rest) = path.split_first().ok_or_else(unknown)?;
        let found = match root.as_str() {
            "contact" => walk(&self.contact, rest),
            "vars" => {
                let (name, rest) = rest.split_first().ok_or_else(unknown)?;
                self.vars.get(name).and_then(|v| walk(v, rest))
            }
            _ => self
                .vars
                .get(root)
                .and_then(|v| walk(v, rest))
                .or_else(|| walk(&self.contact, path)),
        };
        found.cloned().ok_or_else(unknown)
    }
}

fn walk<'v>(value: &'v Value, path: &[String]) -> Option<&'v Value> {
    path.iter().try_fold(value, |current, segment| current.as_object()?.get(segment))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Equality that treats `1` and `1.0` as the same number.
fn loosely_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => lhs == rhs,
    }
}

fn compare(op: CompareOp, lhs: &Value, rhs: &Value) -> Result<bool, ConditionError> {
    let mismatch = || {
        ConditionError::TypeMismatch(format!(
            "cannot apply {op:?} to {} and {}",
            type_name(lhs),
            type_name(rhs)
        ))
    };
    match op {
        CompareOp::Eq => Ok(loosely_equal(lhs, rhs)),
        CompareOp::Ne => Ok(!loosely_equal(lhs, rhs)),
        CompareOp::In => match (lhs, rhs) {
            (_, Value::Array(items)) => Ok(items.iter().any(|item| loosely_equal(lhs, item))),
            (Value::String(needle), Value::String(haystack)) => Ok(haystack.contains(needle.as_str())),
            _ => Err(mismatch()),
        },
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let ordering = match (lhs, rhs) {
                (Value::Number(a), Value::Number(b)) => a
                    .as_f64()
                    .zip(b.as_f64())
                    .and_then(|(a, b)| a.partial_cmp(&b)),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            }
            .ok_or_else(mismatch)?;
            Ok(match op {
                CompareOp::Lt => ordering == Ordering::Less,
                CompareOp::Le => ordering != Ordering::Greater,
                CompareOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            })
        }
    }
}
