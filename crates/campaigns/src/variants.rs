//! Deterministic A/B variant assignment.

use std::collections::BTreeSet;

use mailflow_core::error::{MailflowError, MailflowResult};
use mailflow_core::types::Variant;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Bucket in `0..100` for a contact. Depends only on the id, so repeated
/// resolution of the same audience lands every contact in the same place.
pub fn bucket(contact_id: Uuid) -> u8 {
    let digest = Sha256::digest(contact_id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % 100) as u8
}

/// Variant whose cumulative percentage range holds the contact's bucket.
/// `None` only for an empty or under-allocated split.
pub fn assign_variant(variants: &[Variant], contact_id: Uuid) -> Option<&Variant> {
    let bucket = u32::from(bucket(contact_id));
    let mut upper = 0u32;
    variants.iter().find(|v| {
        upper += u32::from(v.percentage);
        bucket < upper
    })
}

/// Percentages must sum to exactly 100 and names must be unique.
pub fn validate_split(variants: &[Variant]) -> MailflowResult<()> {
    if variants.is_empty() {
        return Err(MailflowError::Validation(
            "A/B testing is enabled but no variants are defined".into(),
        ));
    }
    let mut names = BTreeSet::new();
    for variant in variants {
        if variant.name.trim().is_empty() {
            return Err(MailflowError::Validation("variant name must not be empty".into()));
        }
        if !names.insert(variant.name.as_str()) {
            return Err(MailflowError::Validation(format!(
                "duplicate variant name '{}'",
                variant.name
            )));
        }
    }
    let total: u32 = variants.iter().map(|v| u32::from(v.percentage)).sum();
    if total != 100 {
        return Err(MailflowError::Validation(format!(
            "variant percentages sum to {total}, expected 100"
        )));
    }
    Ok(())
}
