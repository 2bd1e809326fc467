//! In-memory store backed by DashMap.
//!
//! Production: replace with PostgreSQL (sqlx) or a similar ACID store offering
//! conditional updates. This provides the same `Storage` surface for
//! development and testing; per-entry shard locks give the atomic claim and
//! check-and-set semantics the engine relies on.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{MailflowError, MailflowResult};
use crate::store::Storage;
use crate::types::{
    Audience, Campaign, CampaignStatus, Contact, Job, JobStatus, Log, Sequence, Template,
};

/// Uniqueness key of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum JobKey {
    SequenceStep {
        contact_id: Uuid,
        sequence_id: Uuid,
        step_index: u32,
    },
    Campaign {
        contact_id: Uuid,
        campaign_id: Uuid,
    },
}

impl JobKey {
    fn of(job: &Job) -> Option<Self> {
        if let Some(seq) = &job.sequence {
            return Some(JobKey::SequenceStep {
                contact_id: job.contact_id,
                sequence_id: seq.sequence_id,
                step_index: seq.step_index,
            });
        }
        job.campaign.as_ref().map(|c| JobKey::Campaign {
            contact_id: job.contact_id,
            campaign_id: c.campaign_id,
        })
    }
}

/// Thread-safe in-memory store for every engine entity.
#[derive(Default)]
pub struct MemoryStore {
    contacts: DashMap<Uuid, Contact>,
    contact_emails: DashMap<String, Uuid>,
    audiences: DashMap<Uuid, Audience>,
    templates: DashMap<Uuid, Template>,
    template_keys: DashMap<String, Uuid>,
    sequences: DashMap<Uuid, Sequence>,
    sequence_keys: DashMap<String, Uuid>,
    jobs: DashMap<Uuid, Job>,
    job_keys: DashMap<JobKey, Uuid>,
    logs: DashMap<Uuid, Log>,
    log_provider_ids: DashMap<String, Uuid>,
    campaigns: DashMap<Uuid, Campaign>,
    replies: DashMap<(Uuid, Uuid), DateTime<Utc>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("contacts", &self.contacts.len())
            .field("sequences", &self.sequences.len())
            .field("jobs", &self.jobs.len())
            .field("logs", &self.logs.len())
            .field("campaigns", &self.campaigns.len())
            .finish()
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// Insert `value` under `id` when `key` is free in `index`.
fn insert_unique<T>(
    index: &DashMap<String, Uuid>,
    rows: &DashMap<Uuid, T>,
    key: String,
    id: Uuid,
    value: T,
    kind: &str,
) -> MailflowResult<Uuid> {
    match index.entry(key) {
        Entry::Occupied(existing) => Err(MailflowError::Conflict(format!(
            "{kind} '{}' already exists",
            existing.key()
        ))),
        Entry::Vacant(slot) => {
            rows.insert(id, value);
            slot.insert(id);
            Ok(id)
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("Memory store initialized (in-memory, development mode)");
        Self::default()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn all_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|r| r.value().clone()).collect();
        jobs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.scheduled_for.cmp(&b.scheduled_for))
                .then(a.id.cmp(&b.id))
        });
        jobs
    }

    fn collect_jobs(&self, pred: impl Fn(&Job) -> bool) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|r| pred(r.value()))
            .map(|r| r.value().clone())
            .collect();
        jobs.sort_by(|a, b| a.scheduled_for.cmp(&b.scheduled_for).then(a.id.cmp(&b.id)));
        jobs
    }
}

impl Storage for MemoryStore {
    // ─── Contacts ──────────────────────────────────────────────────────────

    fn insert_contact(&self, contact: Contact) -> MailflowResult<Uuid> {
        let id = contact.id;
        let key = normalize_email(&contact.email);
        insert_unique(&self.contact_emails, &self.contacts, key, id, contact, "contact")
    }

    fn get_contact(&self, id: Uuid) -> Option<Contact> {
        self.contacts.get(&id).map(|r| r.value().clone())
    }

    fn find_contact_by_email(&self, email: &str) -> Option<Contact> {
        let id = *self.contact_emails.get(&normalize_email(email))?;
        self.get_contact(id)
    }

    fn list_contacts(&self) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = self.contacts.iter().map(|r| r.value().clone()).collect();
        contacts.sort_by_key(|c| c.id);
        contacts
    }

    fn update_contact(&self, id: Uuid, f: &mut dyn FnMut(&mut Contact)) -> MailflowResult<Contact> {
        let mut entry = self
            .contacts
            .get_mut(&id)
            .ok_or_else(|| MailflowError::not_found("contact", id))?;
        f(entry.value_mut());
        Ok(entry.value().clone())
    }

    // ─── Audiences ─────────────────────────────────────────────────────────

    fn insert_audience(&self, audience: Audience) -> MailflowResult<Uuid> {
        let id = audience.id;
        self.audiences.insert(id, audience);
        Ok(id)
    }

    fn get_audience(&self, id: Uuid) -> Option<Audience> {
        self.audiences.get(&id).map(|r| r.value().clone())
    }

    // ─── Templates ─────────────────────────────────────────────────────────

    fn insert_template(&self, template: Template) -> MailflowResult<Uuid> {
        let id = template.id;
        let key = template.key.clone();
        insert_unique(&self.template_keys, &self.templates, key, id, template, "template")
    }

    fn get_template(&self, id: Uuid) -> Option<Template> {
        self.templates.get(&id).map(|r| r.value().clone())
    }

    fn find_template_by_key(&self, key: &str) -> Option<Template> {
        let id = *self.template_keys.get(key)?;
        self.get_template(id)
    }

    // ─── Sequences ─────────────────────────────────────────────────────────

    fn insert_sequence(&self, sequence: Sequence) -> MailflowResult<Uuid> {
        let id = sequence.id;
        let key = sequence.key.clone();
        insert_unique(&self.sequence_keys, &self.sequences, key, id, sequence, "sequence")
    }

    fn get_sequence(&self, id: Uuid) -> Option<Sequence> {
        self.sequences.get(&id).map(|r| r.value().clone())
    }

    fn find_sequence_by_key(&self, key: &str) -> Option<Sequence> {
        let id = *self.sequence_keys.get(key)?;
        self.get_sequence(id)
    }

    fn list_sequences(&self) -> Vec<Sequence> {
        let mut sequences: Vec<Sequence> =
            self.sequences.iter().map(|r| r.value().clone()).collect();
        sequences.sort_by(|a, b| a.key.cmp(&b.key));
        sequences
    }

    // ─── Jobs ──────────────────────────────────────────────────────────────

    fn insert_job(&self, job: Job) -> MailflowResult<Option<Uuid>> {
        let id = job.id;
        let Some(key) = JobKey::of(&job) else {
            self.jobs.insert(id, job);
            return Ok(Some(id));
        };
        match self.job_keys.entry(key) {
            Entry::Occupied(existing) => {
                debug!(existing = %existing.get(), "Job already exists for key, skipping");
                Ok(None)
            }
            Entry::Vacant(slot) => {
                self.jobs.insert(id, job);
                slot.insert(id);
                Ok(Some(id))
            }
        }
    }

    fn get_job(&self, id: Uuid) -> Option<Job> {
        self.jobs.get(&id).map(|r| r.value().clone())
    }

    fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Vec<Job> {
        let mut due: Vec<Job> = self
            .jobs
            .iter()
            .filter(|r| r.status == JobStatus::Scheduled && r.scheduled_for <= now)
            .map(|r| r.value().clone())
            .collect();
        due.sort_by(|a, b| {
            a.scheduled_for
                .cmp(&b.scheduled_for)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        due.truncate(limit);
        due
    }

    fn claim_job(&self, id: Uuid, now: DateTime<Utc>) -> bool {
        match self.jobs.get_mut(&id) {
            Some(mut job) if job.status == JobStatus::Scheduled => {
                job.status = JobStatus::Processing;
                job.claimed_at = Some(now);
                job.updated_at = now;
                true
            }
            _ => false,
        }
    }

    fn update_job(&self, id: Uuid, f: &mut dyn FnMut(&mut Job)) -> MailflowResult<Job> {
        let mut entry = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| MailflowError::not_found("job", id))?;
        f(entry.value_mut());
        Ok(entry.value().clone())
    }

    fn jobs_for_contact(&self, contact_id: Uuid) -> Vec<Job> {
        self.collect_jobs(|j| j.contact_id == contact_id)
    }

    fn jobs_for_sequence(&self, contact_id: Uuid, sequence_id: Uuid) -> Vec<Job> {
        self.collect_jobs(|j| {
            j.contact_id == contact_id
                && j.sequence.is_some_and(|s| s.sequence_id == sequence_id)
        })
    }

    fn jobs_for_campaign(&self, campaign_id: Uuid) -> Vec<Job> {
        self.collect_jobs(|j| {
            j.campaign
                .as_ref()
                .is_some_and(|c| c.campaign_id == campaign_id)
        })
    }

    fn stale_claims(&self, claimed_before: DateTime<Utc>) -> Vec<Job> {
        self.collect_jobs(|j| {
            j.status == JobStatus::Processing && j.claimed_at.is_some_and(|at| at < claimed_before)
        })
    }

    // ─── Logs ──────────────────────────────────────────────────────────────

    fn insert_log(&self, log: Log) -> MailflowResult<Uuid> {
        let id = log.id;
        let key = log.provider_message_id.clone();
        insert_unique(&self.log_provider_ids, &self.logs, key, id, log, "log for provider message")
    }

    fn get_log(&self, id: Uuid) -> Option<Log> {
        self.logs.get(&id).map(|r| r.value().clone())
    }

    fn find_log_by_provider_id(&self, provider_message_id: &str) -> Option<Log> {
        let id = *self.log_provider_ids.get(provider_message_id)?;
        self.get_log(id)
    }

    fn update_log(&self, id: Uuid, f: &mut dyn FnMut(&mut Log)) -> MailflowResult<Log> {
        let mut entry = self
            .logs
            .get_mut(&id)
            .ok_or_else(|| MailflowError::not_found("log", id))?;
        f(entry.value_mut());
        Ok(entry.value().clone())
    }

    fn logs_for_campaign(&self, campaign_id: Uuid) -> Vec<Log> {
        let mut logs: Vec<Log> = self
            .logs
            .iter()
            .filter(|r| {
                r.campaign
                    .as_ref()
                    .is_some_and(|c| c.campaign_id == campaign_id)
            })
            .map(|r| r.value().clone())
            .collect();
        logs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        logs
    }

    // ─── Campaigns ─────────────────────────────────────────────────────────

    fn insert_campaign(&self, campaign: Campaign) -> MailflowResult<Uuid> {
        let id = campaign.id;
        self.campaigns.insert(id, campaign);
        Ok(id)
    }

    fn get_campaign(&self, id: Uuid) -> Option<Campaign> {
        self.campaigns.get(&id).map(|r| r.value().clone())
    }

    fn list_campaigns(&self) -> Vec<Campaign> {
        let mut campaigns: Vec<Campaign> =
            self.campaigns.iter().map(|r| r.value().clone()).collect();
        campaigns.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        campaigns
    }

    fn update_campaign(
        &self,
        id: Uuid,
        f: &mut dyn FnMut(&mut Campaign),
    ) -> MailflowResult<Campaign> {
        let mut entry = self
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| MailflowError::not_found("campaign", id))?;
        f(entry.value_mut());
        Ok(entry.value().clone())
    }

    fn transition_campaign(
        &self,
        id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
        now: DateTime<Utc>,
    ) -> MailflowResult<bool> {
        let mut entry = self
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| MailflowError::not_found("campaign", id))?;
        if !from.contains(&entry.status) {
            return Ok(false);
        }
        entry.status = to;
        entry.updated_at = now;
        Ok(true)
    }

    // ─── Reply signals ─────────────────────────────────────────────────────

    fn record_reply(&self, contact_id: Uuid, sequence_id: Uuid, at: DateTime<Utc>) {
        self.replies.entry((contact_id, sequence_id)).or_insert(at);
    }

    fn has_reply(&self, contact_id: Uuid, sequence_id: Uuid) -> bool {
        self.replies.contains_key(&(contact_id, sequence_id))
    }
}
