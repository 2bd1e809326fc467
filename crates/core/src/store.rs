//! Persistence contract for engine entities.
//!
//! Entities reference each other by id; everything is resolved through this
//! trait. Mutators passed to `update_*` run while the row is locked and must not
//! call back into the store.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::MailflowResult;
use crate::types::{
    Audience, Campaign, CampaignStatus, Contact, Job, Log, Sequence, Template,
};

pub trait Storage: Send + Sync {
    // ─── Contacts ──────────────────────────────────────────────────────────

    /// Fails with `Conflict` when the email is already taken.
    fn insert_contact(&self, contact: Contact) -> MailflowResult<Uuid>;
    fn get_contact(&self, id: Uuid) -> Option<Contact>;
    fn find_contact_by_email(&self, email: &str) -> Option<Contact>;
    fn list_contacts(&self) -> Vec<Contact>;
    /// Atomic read-modify-write of one contact.
    fn update_contact(&self, id: Uuid, f: &mut dyn FnMut(&mut Contact)) -> MailflowResult<Contact>;

    // ─── Audiences ─────────────────────────────────────────────────────────

    fn insert_audience(&self, audience: Audience) -> MailflowResult<Uuid>;
    fn get_audience(&self, id: Uuid) -> Option<Audience>;

    // ─── Templates ─────────────────────────────────────────────────────────

    fn insert_template(&self, template: Template) -> MailflowResult<Uuid>;
    fn get_template(&self, id: Uuid) -> Option<Template>;
    fn find_template_by_key(&self, key: &str) -> Option<Template>;

    // ─── Sequences ─────────────────────────────────────────────────────────

    fn insert_sequence(&self, sequence: Sequence) -> MailflowResult<Uuid>;
    fn get_sequence(&self, id: Uuid) -> Option<Sequence>;
    fn find_sequence_by_key(&self, key: &str) -> Option<Sequence>;
    fn list_sequences(&self) -> Vec<Sequence>;

    // ─── Jobs ──────────────────────────────────────────────────────────────

    /// Returns `None` without inserting when a job already exists for the same
    /// (recipient, sequence, step) or (recipient, campaign).
    fn insert_job(&self, job: Job) -> MailflowResult<Option<Uuid>>;
    fn get_job(&self, id: Uuid) -> Option<Job>;
    /// Scheduled jobs with `scheduled_for <= now`, earliest first.
    fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Vec<Job>;
    /// Atomic `scheduled → processing`. `false` when the job is gone or someone
    /// else got there first.
    fn claim_job(&self, id: Uuid, now: DateTime<Utc>) -> bool;
    fn update_job(&self, id: Uuid, f: &mut dyn FnMut(&mut Job)) -> MailflowResult<Job>;
    fn jobs_for_contact(&self, contact_id: Uuid) -> Vec<Job>;
    fn jobs_for_sequence(&self, contact_id: Uuid, sequence_id: Uuid) -> Vec<Job>;
    fn jobs_for_campaign(&self, campaign_id: Uuid) -> Vec<Job>;
    /// Jobs in `processing` claimed before `claimed_before`.
    fn stale_claims(&self, claimed_before: DateTime<Utc>) -> Vec<Job>;

    // ─── Logs ──────────────────────────────────────────────────────────────

    /// Fails with `Conflict` on a duplicate provider message id.
    fn insert_log(&self, log: Log) -> MailflowResult<Uuid>;
    fn get_log(&self, id: Uuid) -> Option<Log>;
    fn find_log_by_provider_id(&self, provider_message_id: &str) -> Option<Log>;
    fn update_log(&self, id: Uuid, f: &mut dyn FnMut(&mut Log)) -> MailflowResult<Log>;
    fn logs_for_campaign(&self, campaign_id: Uuid) -> Vec<Log>;

    // ─── Campaigns ─────────────────────────────────────────────────────────

    fn insert_campaign(&self, campaign: Campaign) -> MailflowResult<Uuid>;
    fn get_campaign(&self, id: Uuid) -> Option<Campaign>;
    /// Oldest first.
    fn list_campaigns(&self) -> Vec<Campaign>;
    fn update_campaign(
        &self,
        id: Uuid,
        f: &mut dyn FnMut(&mut Campaign),
    ) -> MailflowResult<Campaign>;
    /// Atomic check-and-set of the campaign status. `Ok(false)` when the
    /// current status is not in `from`.
    fn transition_campaign(
        &self,
        id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
        now: DateTime<Utc>,
    ) -> MailflowResult<bool>;

    // ─── Reply signals ─────────────────────────────────────────────────────

    fn record_reply(&self, contact_id: Uuid, sequence_id: Uuid, at: DateTime<Utc>);
    fn has_reply(&self, contact_id: Uuid, sequence_id: Uuid) -> bool;
}
