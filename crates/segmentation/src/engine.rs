//! Segment evaluator: resolves an audience to the contacts it selects.

use mailflow_core::error::{MailflowError, MailflowResult};
use mailflow_core::store::Storage;
use mailflow_core::types::{Audience, AudienceKind, Contact, RuleField, RuleLogic, SegmentRule};
use tracing::debug;
use uuid::Uuid;

use crate::predicates::{self, FieldValue};

/// Stateless; audiences and contacts are passed in.
#[derive(Debug, Default, Clone, Copy)]
pub struct SegmentEvaluator;

impl SegmentEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Contact ids selected by `audience` out of `contacts`, sorted and
    /// deduplicated.
    ///
    /// Static audiences return their explicit id list as-is (a listed id need
    /// not be among `contacts`); `All` selects mailable contacts; dynamic
    /// audiences apply their rules.
    pub fn resolve(&self, audience: &Audience, contacts: &[Contact]) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = match &audience.kind {
            AudienceKind::Static { contact_ids } => contact_ids.clone(),
            AudienceKind::All => contacts
                .iter()
                .filter(|c| c.is_mailable())
                .map(|c| c.id)
                .collect(),
            AudienceKind::Dynamic { rules, logic } => contacts
                .iter()
                .filter(|c| self.matches_rules(c, rules, *logic))
                .map(|c| c.id)
                .collect(),
        };
        ids.sort_unstable();
        ids.dedup();
        debug!(audience = %audience.id, members = ids.len(), "Audience resolved");
        ids
    }

    /// Resolve an audience by id against every stored contact.
    pub fn resolve_stored(&self, store: &dyn Storage, audience_id: Uuid) -> MailflowResult<Vec<Uuid>> {
        let audience = store
            .get_audience(audience_id)
            .ok_or_else(|| MailflowError::not_found("audience", audience_id))?;
        Ok(self.resolve(&audience, &store.list_contacts()))
    }

    /// Membership test for a single contact.
    pub fn is_member(&self, audience: &Audience, contact: &Contact) -> bool {
        match &audience.kind {
            AudienceKind::Static { contact_ids } => contact_ids.contains(&contact.id),
            AudienceKind::All => contact.is_mailable(),
            AudienceKind::Dynamic { rules, logic } => self.matches_rules(contact, rules, *logic),
        }
    }

    /// `All` is vacuously true for no rules; `Any` is false.
    pub fn matches_rules(&self, contact: &Contact, rules: &[SegmentRule], logic: RuleLogic) -> bool {
        match logic {
            RuleLogic::All => rules.iter().all(|r| self.evaluate_rule(contact, r)),
            RuleLogic::Any => rules.iter().any(|r| self.evaluate_rule(contact, r)),
        }
    }

    pub fn evaluate_rule(&self, contact: &Contact, rule: &SegmentRule) -> bool {
        let actual = resolve_field(contact, &rule.field);
        predicates::evaluate(&actual, rule.operator, rule.value.as_ref())
    }
}

fn resolve_field(contact: &Contact, field: &RuleField) -> FieldValue {
    match field {
        RuleField::Tags => FieldValue::List(contact.tags.iter().cloned().collect()),
        RuleField::Location => match &contact.location {
            Some(location) => FieldValue::Text(location.clone()),
            None => FieldValue::Empty,
        },
        RuleField::Engagement => FieldValue::Number(contact.engagement.engagement_score),
        RuleField::SignupDate => FieldValue::Time(contact.signup_date),
        RuleField::LastActivity => match contact.last_activity {
            Some(at) => FieldValue::Time(at),
            None => FieldValue::Empty,
        },
        RuleField::Custom(name) => match contact.custom_fields.get(name) {
            Some(value) => FieldValue::Json(value.clone()),
            None => FieldValue::Missing,
        },
    }
}
