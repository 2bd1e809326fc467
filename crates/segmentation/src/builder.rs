//! Audience builder: fluent API for constructing segment rules.

use mailflow_core::error::{MailflowError, MailflowResult};
use mailflow_core::types::{Audience, AudienceKind, RuleField, RuleLogic, RuleOperator, SegmentRule};
use serde_json::Value;
use uuid::Uuid;

pub struct AudienceBuilder {
    name: String,
    rules: Vec<SegmentRule>,
    logic: RuleLogic,
}

impl AudienceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
            logic: RuleLogic::All,
        }
    }

    pub fn with_any(mut self) -> Self {
        self.logic = RuleLogic::Any;
        self
    }

    pub fn rule(mut self, field: RuleField, operator: RuleOperator, value: Option<Value>) -> Self {
        self.rules.push(SegmentRule::new(field, operator, value));
        self
    }

    pub fn tagged(self, tag: impl Into<String>) -> Self {
        self.rule(RuleField::Tags, RuleOperator::Contains, Some(Value::String(tag.into())))
    }

    pub fn not_tagged(self, tag: impl Into<String>) -> Self {
        self.rule(RuleField::Tags, RuleOperator::NotContains, Some(Value::String(tag.into())))
    }

    pub fn location_contains(self, needle: impl Into<String>) -> Self {
        self.rule(RuleField::Location, RuleOperator::Contains, Some(Value::String(needle.into())))
    }

    pub fn engagement_above(self, score: f64) -> Self {
        self.rule(RuleField::Engagement, RuleOperator::GreaterThan, Some(score.into()))
    }

    pub fn engagement_below(self, score: f64) -> Self {
        self.rule(RuleField::Engagement, RuleOperator::LessThan, Some(score.into()))
    }

    pub fn custom_equals(self, name: impl Into<String>, value: Value) -> Self {
        self.rule(RuleField::Custom(name.into()), RuleOperator::Equals, Some(value))
    }

    /// Dynamic audience from the accumulated rules. Malformed rules are
    /// rejected here rather than silently never matching.
    pub fn build(self) -> MailflowResult<Audience> {
        for rule in &self.rules {
            rule.validate().map_err(MailflowError::Validation)?;
        }
        Ok(Audience {
            id: Uuid::new_v4(),
            name: self.name,
            kind: AudienceKind::Dynamic {
                rules: self.rules,
                logic: self.logic,
            },
        })
    }

    pub fn fixed(name: impl Into<String>, contact_ids: Vec<Uuid>) -> Audience {
        Audience {
            id: Uuid::new_v4(),
            name: name.into(),
            kind: AudienceKind::Static { contact_ids },
        }
    }

    pub fn everyone(name: impl Into<String>) -> Audience {
        Audience {
            id: Uuid::new_v4(),
            name: name.into(),
            kind: AudienceKind::All,
        }
    }
}
