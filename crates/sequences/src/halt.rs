//! Sequence halting: cancels the remaining unclaimed jobs of a
//! (contact, sequence) pair once the contact unsubscribes or replies.

use std::collections::BTreeSet;
use std::sync::Arc;

use mailflow_core::clock::Clock;
use mailflow_core::error::MailflowResult;
use mailflow_core::event_bus::{make_event, EngineEventType, EventSink};
use mailflow_core::store::Storage;
use mailflow_core::types::{Contact, JobStatus, Sequence};
use tracing::info;
use uuid::Uuid;

use crate::state_machine::JobStateMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    Unsubscribed,
    Replied,
}

impl HaltReason {
    pub fn as_str(self) -> &'static str {
        match self {
            HaltReason::Unsubscribed => "contact unsubscribed",
            HaltReason::Replied => "contact replied",
        }
    }
}

/// Pure halting rule.
pub fn halt_reason(sequence: &Sequence, contact: &Contact, replied: bool) -> Option<HaltReason> {
    if sequence.stop_on_unsubscribe && !contact.subscribed {
        return Some(HaltReason::Unsubscribed);
    }
    if sequence.stop_on_reply && replied {
        return Some(HaltReason::Replied);
    }
    None
}

pub struct SequenceHalter {
    store: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    machine: JobStateMachine,
}

impl SequenceHalter {
    pub fn new(store: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            event_sink: mailflow_core::event_bus::noop_sink(),
            machine: JobStateMachine::new(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Halting rule with the reply signal read from storage.
    pub fn check(&self, sequence: &Sequence, contact: &Contact) -> Option<HaltReason> {
        let replied = sequence.stop_on_reply && self.store.has_reply(contact.id, sequence.id);
        halt_reason(sequence, contact, replied)
    }

    /// Cancel every still-`scheduled` job of the pair. Jobs already claimed or
    /// finished are left alone. Returns how many were cancelled.
    pub fn cancel_remaining(
        &self,
        contact_id: Uuid,
        sequence_id: Uuid,
        reason: &str,
    ) -> MailflowResult<usize> {
        let mut cancelled = 0;
        for job in self.store.jobs_for_sequence(contact_id, sequence_id) {
            if job.status == JobStatus::Scheduled && self.cancel_if_unclaimed(job.id, contact_id, reason)? {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(
                contact_id = %contact_id,
                sequence_id = %sequence_id,
                cancelled,
                reason,
                "Halted sequence for contact"
            );
        }
        Ok(cancelled)
    }

    /// Run the halting check for every sequence the contact still has live
    /// jobs in.
    pub fn halt_contact(&self, contact_id: Uuid) -> MailflowResult<usize> {
        let Some(contact) = self.store.get_contact(contact_id) else {
            return Ok(0);
        };
        let sequence_ids: BTreeSet<Uuid> = self
            .store
            .jobs_for_contact(contact_id)
            .into_iter()
            .filter(|j| j.status == JobStatus::Scheduled)
            .filter_map(|j| j.sequence.map(|s| s.sequence_id))
            .collect();

        let mut cancelled = 0;
        for sequence_id in sequence_ids {
            let Some(sequence) = self.store.get_sequence(sequence_id) else {
                continue;
            };
            if let Some(reason) = self.check(&sequence, &contact) {
                cancelled += self.cancel_remaining(contact_id, sequence_id, reason.as_str())?;
            }
        }
        Ok(cancelled)
    }

    /// Cancel every unclaimed job of the contact, sequence and campaign alike.
    pub fn cancel_all_for_contact(&self, contact_id: Uuid, reason: &str) -> MailflowResult<usize> {
        let mut cancelled = 0;
        for job in self.store.jobs_for_contact(contact_id) {
            if job.status == JobStatus::Scheduled && self.cancel_if_unclaimed(job.id, contact_id, reason)? {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(contact_id = %contact_id, cancelled, reason, "Cancelled all pending jobs for contact");
        }
        Ok(cancelled)
    }

    fn cancel_if_unclaimed(&self, job_id: Uuid, contact_id: Uuid, reason: &str) -> MailflowResult<bool> {
        let now = self.clock.now();
        let mut cancelled = false;
        self.store.update_job(job_id, &mut |job| {
            if job.status == JobStatus::Scheduled
                && self.machine.transition(job, JobStatus::Cancelled, now).is_ok()
            {
                job.error = Some(reason.to_string());
                cancelled = true;
            }
        })?;
        if cancelled {
            metrics::counter!("scheduler.jobs_cancelled").increment(1);
            self.event_sink.emit(make_event(
                EngineEventType::JobCancelled,
                job_id.to_string(),
                Some(contact_id),
                Some(reason.to_string()),
            ));
        }
        Ok(cancelled)
    }
}
