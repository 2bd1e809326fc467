//! Job scheduler: polls due jobs, claims them and drives each through
//! halting, condition, dispatch and retry.
//!
//! Any number of schedulers may share one store; the atomic
//! `scheduled → processing` claim keeps each job with a single processor.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use mailflow_core::clock::Clock;
use mailflow_core::config::SchedulerConfig;
use mailflow_core::error::{MailflowError, MailflowResult};
use mailflow_core::event_bus::{make_event, EngineEventType, EventSink};
use mailflow_core::store::Storage;
use mailflow_core::types::{Contact, ContactStatus, Job, JobStatus};
use mailflow_delivery::{DeliveryDispatcher, DispatchError, TransportError};
use mailflow_sequences::{ConditionEvaluator, JobStateMachine, SequenceHalter};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::retry::{RetryDecision, RetryPolicy};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_interval: StdDuration,
    pub batch_size: usize,
    pub workers: usize,
    /// Claims older than this are handed back to the queue.
    pub stale_after: Duration,
    pub retry: RetryPolicy,
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            poll_interval: StdDuration::from_millis(config.poll_interval_ms),
            batch_size: config.batch_size,
            workers: config.workers,
            stale_after: Duration::seconds(config.stale_claim_secs.min(i64::MAX as u64 / 1000) as i64),
            retry: RetryPolicy::from(config),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

/// What happened to one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Sent { log_id: Uuid },
    Retrying { attempts: u32, next_attempt_at: DateTime<Utc> },
    Failed { error: String },
    Cancelled { reason: String },
    /// Another worker owns the job, or it is no longer scheduled.
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub due: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl TickSummary {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Sent { .. } => self.sent += 1,
            JobOutcome::Retrying { .. } => self.retried += 1,
            JobOutcome::Failed { .. } => self.failed += 1,
            JobOutcome::Cancelled { .. } => self.cancelled += 1,
            JobOutcome::Skipped => self.skipped += 1,
        }
    }
}

pub struct JobScheduler {
    store: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<DeliveryDispatcher>,
    halter: Arc<SequenceHalter>,
    conditions: ConditionEvaluator,
    machine: JobStateMachine,
    event_sink: Arc<dyn EventSink>,
    settings: SchedulerSettings,
}

impl JobScheduler {
    pub fn new(
        store: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<DeliveryDispatcher>,
        halter: Arc<SequenceHalter>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            clock,
            dispatcher,
            halter,
            conditions: ConditionEvaluator::new(),
            machine: JobStateMachine::new(),
            event_sink: mailflow_core::event_bus::noop_sink(),
            settings,
        }
    }

    /// Attach an event sink for emitting analytics events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// One poll: process up to `batch_size` due jobs, earliest first.
    pub async fn tick(&self) -> TickSummary {
        let now = self.clock.now();
        let due = self.store.due_jobs(now, self.settings.batch_size);
        let mut summary = TickSummary {
            due: due.len(),
            ..TickSummary::default()
        };

        for job in due {
            match self.process_job(job.id).await {
                Ok(outcome) => summary.record(&outcome),
                Err(err) => {
                    summary.errors += 1;
                    error!(job_id = %job.id, error = %err, "Job processing failed");
                }
            }
        }

        if summary.due > 0 {
            info!(
                due = summary.due,
                sent = summary.sent,
                retried = summary.retried,
                failed = summary.failed,
                cancelled = summary.cancelled,
                skipped = summary.skipped,
                "Scheduler tick complete"
            );
        }
        summary
    }

    /// Claim and process a single job. Returns `Skipped` when the claim is
    /// lost; storage errors leave the job claimed for stale recovery.
    pub async fn process_job(&self, job_id: Uuid) -> MailflowResult<JobOutcome> {
        if !self.store.claim_job(job_id, self.clock.now()) {
            debug!(job_id = %job_id, "Job not claimable, skipping");
            return Ok(JobOutcome::Skipped);
        }
        let job = self
            .store
            .get_job(job_id)
            .ok_or_else(|| MailflowError::not_found("job", job_id))?;
        self.run_claimed(&job).await
    }

    async fn run_claimed(&self, job: &Job) -> MailflowResult<JobOutcome> {
        let Some(contact) = self.store.get_contact(job.contact_id) else {
            return self.fail(job, format!("contact {} not found", job.contact_id), false);
        };
        if contact.status != ContactStatus::Active {
            return self.cancel(job, &format!("recipient {:?}", contact.status).to_lowercase());
        }

        if let Some(seq_ref) = job.sequence {
            let Some(sequence) = self.store.get_sequence(seq_ref.sequence_id) else {
                return self.fail(job, format!("sequence {} not found", seq_ref.sequence_id), false);
            };
            if let Some(reason) = self.halter.check(&sequence, &contact) {
                let outcome = self.cancel(job, reason.as_str())?;
                self.halter
                    .cancel_remaining(contact.id, sequence.id, reason.as_str())?;
                return Ok(outcome);
            }
            let Some(step) = sequence.steps.get(seq_ref.step_index as usize) else {
                return self.fail(
                    job,
                    format!("sequence '{}' has no step {}", sequence.key, seq_ref.step_index),
                    false,
                );
            };
            if !self
                .conditions
                .evaluate(step.condition.as_deref(), &contact, &job.variables)
            {
                return self.cancel(job, "step condition not met");
            }
        }

        if job.campaign.is_some() && !contact.subscribed {
            return self.cancel(job, "contact unsubscribed");
        }

        match self.dispatcher.dispatch(job, &contact).await {
            Ok(sent) => self.mark_sent(job, sent.log_id),
            Err(DispatchError::Transport(err)) if err.is_retryable() => self.retry_or_fail(job, err.to_string()),
            Err(DispatchError::Transport(TransportError::InvalidRecipient(detail))) => {
                let outcome = self.fail(job, format!("invalid recipient: {detail}"), true)?;
                self.mark_bounced(&contact)?;
                Ok(outcome)
            }
            Err(err) => self.fail(job, err.to_string(), true),
        }
    }

    /// Apply a guarded status change plus extra field updates to a claimed job.
    fn settle(&self, job_id: Uuid, to: JobStatus, apply: &mut dyn FnMut(&mut Job)) -> MailflowResult<Job> {
        let now = self.clock.now();
        let mut moved = Ok(());
        let job = self.store.update_job(job_id, &mut |job| {
            moved = self.machine.transition(job, to, now);
            if moved.is_ok() {
                apply(job);
            }
        })?;
        moved?;
        Ok(job)
    }

    fn mark_sent(&self, job: &Job, log_id: Uuid) -> MailflowResult<JobOutcome> {
        let now = self.clock.now();
        self.settle(job.id, JobStatus::Sent, &mut |j| {
            j.attempts += 1;
            j.last_attempt = Some(now);
            j.log_id = Some(log_id);
            j.error = None;
        })?;
        metrics::counter!("scheduler.jobs_sent").increment(1);
        debug!(job_id = %job.id, log_id = %log_id, "Job sent");
        Ok(JobOutcome::Sent { log_id })
    }

    fn retry_or_fail(&self, job: &Job, error: String) -> MailflowResult<JobOutcome> {
        let now = self.clock.now();
        match self.settings.retry.next_attempt(job.attempts, now) {
            RetryDecision::Retry { attempts, at } => {
                self.settle(job.id, JobStatus::Scheduled, &mut |j| {
                    j.attempts = attempts;
                    j.last_attempt = Some(now);
                    j.scheduled_for = at;
                    j.error = Some(error.clone());
                })?;
                metrics::counter!("scheduler.jobs_retried").increment(1);
                warn!(
                    job_id = %job.id,
                    attempts,
                    next_attempt_at = %at,
                    error = %error,
                    "Transient delivery failure, job rescheduled"
                );
                self.event_sink.emit(make_event(
                    EngineEventType::JobRetried,
                    job.id.to_string(),
                    Some(job.contact_id),
                    Some(error),
                ));
                Ok(JobOutcome::Retrying {
                    attempts,
                    next_attempt_at: at,
                })
            }
            RetryDecision::GiveUp { .. } => self.fail(job, error, true),
        }
    }

    fn fail(&self, job: &Job, error: String, consumed_attempt: bool) -> MailflowResult<JobOutcome> {
        let now = self.clock.now();
        let failed = self.settle(job.id, JobStatus::Failed, &mut |j| {
            if consumed_attempt {
                j.attempts += 1;
                j.last_attempt = Some(now);
            }
            j.error = Some(error.clone());
        })?;
        metrics::counter!("scheduler.jobs_failed").increment(1);
        warn!(job_id = %job.id, attempts = failed.attempts, error = %error, "Job failed");
        self.event_sink.emit(make_event(
            EngineEventType::EmailFailed,
            job.id.to_string(),
            Some(job.contact_id),
            Some(error.clone()),
        ));
        Ok(JobOutcome::Failed { error })
    }

    fn cancel(&self, job: &Job, reason: &str) -> MailflowResult<JobOutcome> {
        self.settle(job.id, JobStatus::Cancelled, &mut |j| {
            j.error = Some(reason.to_string());
        })?;
        metrics::counter!("scheduler.jobs_cancelled").increment(1);
        info!(job_id = %job.id, contact_id = %job.contact_id, reason, "Job cancelled");
        self.event_sink.emit(make_event(
            EngineEventType::JobCancelled,
            job.id.to_string(),
            Some(job.contact_id),
            Some(reason.to_string()),
        ));
        Ok(JobOutcome::Cancelled {
            reason: reason.to_string(),
        })
    }

    fn mark_bounced(&self, contact: &Contact) -> MailflowResult<()> {
        self.store.update_contact(contact.id, &mut |c| {
            if c.status == ContactStatus::Active {
                c.status = ContactStatus::Bounced;
            }
        })?;
        warn!(contact_id = %contact.id, "Recipient rejected by provider, contact marked bounced");
        self.halter
            .cancel_all_for_contact(contact.id, "invalid recipient")?;
        Ok(())
    }

    /// Return jobs stuck in `processing` past `stale_after` to the queue. The
    /// lost run counts as an attempt; a job out of attempts fails instead.
    pub fn recover_stale_claims(&self) -> MailflowResult<usize> {
        let now = self.clock.now();
        let cutoff = now - self.settings.stale_after;
        let mut recovered = 0;

        for stale in self.store.stale_claims(cutoff) {
            let mut moved = Ok(());
            let mut decision = None;
            self.store.update_job(stale.id, &mut |j| {
                let still_stale = j.status == JobStatus::Processing
                    && j.claimed_at.is_some_and(|at| at < cutoff);
                if !still_stale {
                    return;
                }
                let next = self.settings.retry.next_attempt(j.attempts, now);
                let (to, attempts) = match next {
                    RetryDecision::Retry { attempts, .. } => (JobStatus::Scheduled, attempts),
                    RetryDecision::GiveUp { attempts } => (JobStatus::Failed, attempts),
                };
                moved = self.machine.transition(j, to, now);
                if moved.is_ok() {
                    j.attempts = attempts;
                    j.error = Some("claim expired".to_string());
                    if to == JobStatus::Scheduled {
                        j.scheduled_for = now;
                    }
                    decision = Some(next);
                }
            })?;
            moved?;

            if let Some(next) = decision {
                recovered += 1;
                warn!(job_id = %stale.id, decision = ?next, "Recovered stale job claim");
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailflow_core::event_bus::capture_sink;
    use mailflow_core::types::{
        Delay, Sequence, SequenceRef, SequenceStep, Template, TemplateVariable, Variables,
    };
    use mailflow_core::{ManualClock, MemoryStore, TemplateRenderer};
    use mailflow_delivery::{DispatchSettings, RecordingTransport};

    struct Harness {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        transport: Arc<RecordingTransport>,
        scheduler: Arc<JobScheduler>,
        sequence: Sequence,
        contact: Contact,
    }

    fn t0() -> DateTime<Utc> {
        "2024-05-01T09:00:00Z".parse().unwrap()
    }

    fn harness_with(step: SequenceStep, sequence_flags: fn(Sequence) -> Sequence) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let transport = Arc::new(RecordingTransport::new());

        let template = Template::new("welcome", "Welcome {{ first_name }}", "Hello!");
        let step = SequenceStep { template_id: template.id, ..step };
        let sequence = sequence_flags(Sequence::new("user-onboarding", "user.registered").step(step));
        store.insert_template(template).unwrap();
        store.insert_sequence(sequence.clone()).unwrap();

        let mut contact = Contact::new("ana@example.com", t0());
        contact.first_name = Some("Ana".into());
        store.insert_contact(contact.clone()).unwrap();

        let halter = Arc::new(SequenceHalter::new(store.clone(), clock.clone()));
        let dispatcher = Arc::new(DeliveryDispatcher::new(
            store.clone(),
            transport.clone(),
            Arc::new(TemplateRenderer::new()),
            clock.clone(),
            DispatchSettings {
                default_from: "hello@voicemarket.io".into(),
                default_reply_to: None,
                send_timeout: StdDuration::from_secs(5),
            },
        ));
        let scheduler = Arc::new(JobScheduler::new(
            store.clone(),
            clock.clone(),
            dispatcher,
            halter,
            SchedulerSettings::default(),
        ));
        Harness {
            store,
            clock,
            transport,
            scheduler,
            sequence,
            contact,
        }
    }

    fn harness() -> Harness {
        harness_with(SequenceStep::new(Uuid::nil(), Delay::minutes(0)), |s| s)
    }

    fn schedule(h: &Harness, step_index: u32, at: DateTime<Utc>) -> Uuid {
        let job = Job::for_sequence_step(
            h.contact.id,
            h.sequence.steps[0].template_id,
            SequenceRef {
                sequence_id: h.sequence.id,
                step_index,
            },
            Variables::new(),
            at,
            h.clock.now(),
        );
        h.store.insert_job(job).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_due_job_is_sent_and_logged() {
        let h = harness();
        let job_id = schedule(&h, 0, t0());
        h.clock.advance(Duration::seconds(5));

        let summary = h.scheduler.tick().await;
        assert_eq!(summary.due, 1);
        assert_eq!(summary.sent, 1);

        let job = h.store.get_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Sent);
        assert_eq!(job.attempts, 1);
        assert!(job.claimed_at.is_none());
        let log = h.store.get_log(job.log_id.unwrap()).unwrap();
        assert_eq!(log.subject, "Welcome Ana");
        assert_eq!(h.transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_future_jobs_wait() {
        let h = harness();
        let job_id = schedule(&h, 0, t0() + Duration::days(1));
        assert_eq!(h.scheduler.tick().await.due, 0);
        assert_eq!(h.store.get_job(job_id).unwrap().status, JobStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_transient_failures_back_off_then_fail() {
        let h = harness();
        let job_id = schedule(&h, 0, t0());
        h.store
            .update_job(job_id, &mut |j| j.attempts = 2)
            .unwrap();
        h.transport
            .fail_next(TransportError::Transient("timeout".into()));

        let outcome = h.scheduler.process_job(job_id).await.unwrap();
        let expected_at = t0() + Duration::seconds(300 * 8);
        assert_eq!(
            outcome,
            JobOutcome::Retrying {
                attempts: 3,
                next_attempt_at: expected_at
            }
        );
        let job = h.store.get_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.scheduled_for, expected_at);

        h.clock.set(expected_at);
        h.transport
            .fail_next(TransportError::Transient("timeout".into()));
        let outcome = h.scheduler.process_job(job_id).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Failed { .. }));
        let job = h.store.get_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 4);
        assert!(job.error.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn test_missing_variable_fails_without_transport() {
        let h = harness();
        let template = Template::new("receipt", "Receipt", "Total {{ amount }}")
            .with_variable(TemplateVariable::required("amount"));
        let template_id = template.id;
        h.store.insert_template(template).unwrap();
        let job = Job::for_sequence_step(
            h.contact.id,
            template_id,
            SequenceRef {
                sequence_id: h.sequence.id,
                step_index: 0,
            },
            Variables::new(),
            t0(),
            t0(),
        );
        let job_id = h.store.insert_job(job).unwrap().unwrap();

        let outcome = h.scheduler.process_job(job_id).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Failed { .. }));
        let job = h.store.get_job(job_id).unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(h.transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_recipient_bounces_contact() {
        let h = harness_with(SequenceStep::new(Uuid::nil(), Delay::minutes(0)), |s| {
            s.step(SequenceStep::new(Uuid::nil(), Delay::days(1)))
        });
        let first = schedule(&h, 0, t0());
        let second = schedule(&h, 1, t0() + Duration::days(1));
        h.transport
            .fail_next(TransportError::InvalidRecipient("550 no such user".into()));

        h.scheduler.tick().await;

        assert_eq!(h.store.get_job(first).unwrap().status, JobStatus::Failed);
        assert_eq!(h.store.get_job(second).unwrap().status, JobStatus::Cancelled);
        assert_eq!(
            h.store.get_contact(h.contact.id).unwrap().status,
            ContactStatus::Bounced
        );
    }

    #[tokio::test]
    async fn test_false_condition_cancels_without_log() {
        let h = harness_with(
            SequenceStep::new(Uuid::nil(), Delay::minutes(0)).when("contact.engagement > 50"),
            |s| s,
        );
        let job_id = schedule(&h, 0, t0());
        let outcome = h.scheduler.process_job(job_id).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Cancelled { .. }));
        let job = h.store.get_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.log_id.is_none());
        assert_eq!(h.transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribed_contact_halts_sequence() {
        let h = harness_with(SequenceStep::new(Uuid::nil(), Delay::minutes(0)), |s| {
            s.step(SequenceStep::new(Uuid::nil(), Delay::days(1)))
                .stop_on_unsubscribe(true)
        });
        let sink = capture_sink();
        let first = schedule(&h, 0, t0());
        let second = schedule(&h, 1, t0() + Duration::days(1));
        h.store
            .update_contact(h.contact.id, &mut |c| c.subscribed = false)
            .unwrap();

        let scheduler = JobScheduler::new(
            h.store.clone(),
            h.clock.clone(),
            Arc::new(DeliveryDispatcher::new(
                h.store.clone(),
                h.transport.clone(),
                Arc::new(TemplateRenderer::new()),
                h.clock.clone(),
                DispatchSettings {
                    default_from: "hello@voicemarket.io".into(),
                    default_reply_to: None,
                    send_timeout: StdDuration::from_secs(5),
                },
            )),
            Arc::new(SequenceHalter::new(h.store.clone(), h.clock.clone())),
            SchedulerSettings::default(),
        )
        .with_event_sink(sink.clone());

        scheduler.tick().await;
        assert_eq!(h.store.get_job(first).unwrap().status, JobStatus::Cancelled);
        assert_eq!(h.store.get_job(second).unwrap().status, JobStatus::Cancelled);
        assert_eq!(h.transport.calls(), 0);
        assert_eq!(sink.count_type(EngineEventType::JobCancelled), 1);
    }

    #[tokio::test]
    async fn test_suppressed_contact_is_not_mailed() {
        let h = harness();
        let job_id = schedule(&h, 0, t0());
        h.store
            .update_contact(h.contact.id, &mut |c| c.status = ContactStatus::Complained)
            .unwrap();
        let outcome = h.scheduler.process_job(job_id).await.unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Cancelled {
                reason: "recipient complained".into()
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_send_once() {
        let h = harness();
        let job_id = schedule(&h, 0, t0());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let scheduler = h.scheduler.clone();
            handles.push(tokio::spawn(async move { scheduler.process_job(job_id).await }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() != JobOutcome::Skipped {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(h.transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_claims_return_to_queue() {
        let h = harness();
        let job_id = schedule(&h, 0, t0());
        assert!(h.store.claim_job(job_id, t0()));

        h.clock.advance(Duration::minutes(5));
        assert_eq!(h.scheduler.recover_stale_claims().unwrap(), 0);

        h.clock.advance(Duration::minutes(6));
        assert_eq!(h.scheduler.recover_stale_claims().unwrap(), 1);
        let job = h.store.get_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.scheduled_for, h.clock.now());

        assert_eq!(h.scheduler.tick().await.sent, 1);
    }
}
