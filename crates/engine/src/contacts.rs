//! Contact upsert used by the trigger entrypoints.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mailflow_core::error::{MailflowError, MailflowResult};
use mailflow_core::store::Storage;
use mailflow_core::types::Contact;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

/// Identity and optional attributes of the contact a business flow is
/// acting for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactInput {
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, Value>,
}

impl ContactInput {
    pub fn email(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            ..Self::default()
        }
    }

    fn apply(&self, contact: &mut Contact) {
        if let Some(first) = &self.first_name {
            contact.first_name = Some(first.clone());
        }
        if let Some(last) = &self.last_name {
            contact.last_name = Some(last.clone());
        }
        if let Some(location) = &self.location {
            contact.location = Some(location.clone());
        }
        contact.tags.extend(self.tags.iter().cloned());
        for (name, value) in &self.custom_fields {
            contact.custom_fields.insert(name.clone(), value.clone());
        }
    }
}

fn check_email(email: &str) -> MailflowResult<&str> {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(MailflowError::Validation(format!("invalid email address '{email}'"))),
    }
}

/// Find the contact by email, creating an active subscribed one when
/// unknown, then merge the supplied attributes. Status and subscription are
/// never changed here.
pub fn upsert_contact(
    store: &dyn Storage,
    input: &ContactInput,
    now: DateTime<Utc>,
) -> MailflowResult<Contact> {
    let email = check_email(&input.email)?;

    if let Some(existing) = store.find_contact_by_email(email) {
        return store.update_contact(existing.id, &mut |c| input.apply(c));
    }

    let mut contact = Contact::new(email, now);
    input.apply(&mut contact);
    match store.insert_contact(contact.clone()) {
        Ok(id) => {
            info!(contact_id = %id, "Contact created");
            Ok(contact)
        }
        // Lost an insert race; merge into the winner.
        Err(MailflowError::Conflict(_)) => {
            let existing = store
                .find_contact_by_email(email)
                .ok_or_else(|| MailflowError::not_found("contact", email))?;
            store.update_contact(existing.id, &mut |c| input.apply(c))
        }
        Err(err) => Err(err),
    }
}
