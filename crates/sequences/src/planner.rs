use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use mailflow_core::clock::Clock;
use mailflow_core::error::{MailflowError, MailflowResult};
use mailflow_core::event_bus::{make_event, EngineEventType, EventSink};
use mailflow_core::store::Storage;
use mailflow_core::types::{Contact, Job, Sequence, SequenceRef, Variables};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::evaluator::ConditionEvaluator;

/// Longest gap allowed between a trigger and the last step of its sequence.
pub const MAX_SEQUENCE_SPAN_DAYS: i64 = 10 * 366;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedStep {
    pub step_index: u32,
    pub scheduled_for: DateTime<Utc>,
    /// `None` when a job for this step already existed.
    pub job_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanOutcome {
    pub sequence_id: Uuid,
    pub contact_id: Uuid,
    pub steps: Vec<PlannedStep>,
}

impl PlanOutcome {
    pub fn scheduled(&self) -> usize {
        self.steps.iter().filter(|s| s.job_id.is_some()).count()
    }

    pub fn skipped(&self) -> usize {
        self.steps.len() - self.scheduled()
    }
}

/// Expands a sequence trigger into one scheduled job per step.
pub struct SequencePlanner {
    store: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
}

impl SequencePlanner {
    pub fn new(store: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            event_sink: mailflow_core::event_bus::noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Offset of each step from the trigger. Delays accumulate, so step `i`
    /// fires after the sum of delays `0..=i`. The total may not exceed
    /// `MAX_SEQUENCE_SPAN_DAYS`.
    pub fn offsets(sequence: &Sequence) -> MailflowResult<Vec<Duration>> {
        let limit = Duration::days(MAX_SEQUENCE_SPAN_DAYS);
        let mut total = Duration::zero();
        let mut offsets = Vec::with_capacity(sequence.steps.len());
        for (index, step) in sequence.steps.iter().enumerate() {
            total = step
                .delay
                .to_duration()
                .and_then(|delay| total.checked_add(&delay))
                .filter(|sum| *sum <= limit)
                .ok_or_else(|| {
                    MailflowError::Validation(format!(
                        "sequence '{}' step {index} is scheduled more than {MAX_SEQUENCE_SPAN_DAYS} days after the trigger",
                        sequence.key
                    ))
                })?;
            offsets.push(total);
        }
        Ok(offsets)
    }

    /// Plan every step for `contact`. Steps that already have a job are
    /// reported with `job_id: None`; planning twice never duplicates work.
    pub fn plan(
        &self,
        sequence: &Sequence,
        contact: &Contact,
        trigger_at: DateTime<Utc>,
        variables: Variables,
    ) -> MailflowResult<PlanOutcome> {
        if !sequence.active {
            return Err(MailflowError::Validation(format!(
                "sequence '{}' is not active",
                sequence.key
            )));
        }
        if sequence.steps.is_empty() {
            return Err(MailflowError::Validation(format!(
                "sequence '{}' has no steps",
                sequence.key
            )));
        }
        validate_sequence(self.store.as_ref(), sequence)?;

        let now = self.clock.now();
        let mut outcome = PlanOutcome {
            sequence_id: sequence.id,
            contact_id: contact.id,
            steps: Vec::with_capacity(sequence.steps.len()),
        };

        let schedule = Self::offsets(sequence)?
            .into_iter()
            .enumerate()
            .map(|(index, offset)| {
                trigger_at.checked_add_signed(offset).ok_or_else(|| {
                    MailflowError::Validation(format!(
                        "sequence '{}' step {index} falls outside the supported date range",
                        sequence.key
                    ))
                })
            })
            .collect::<MailflowResult<Vec<_>>>()?;

        for (index, (step, scheduled_for)) in sequence.steps.iter().zip(schedule).enumerate() {
            let step_index = index as u32;
            let job = Job::for_sequence_step(
                contact.id,
                step.template_id,
                SequenceRef {
                    sequence_id: sequence.id,
                    step_index,
                },
                variables.clone(),
                scheduled_for,
                now,
            );
            let job_id = self.store.insert_job(job)?;
            match job_id {
                Some(id) => {
                    debug!(job_id = %id, step_index, %scheduled_for, "Scheduled sequence step");
                    self.event_sink.emit(make_event(
                        EngineEventType::JobScheduled,
                        id.to_string(),
                        Some(contact.id),
                        Some(format!("{}#{}", sequence.key, step_index)),
                    ));
                }
                None => debug!(step_index, "Step already planned for contact, skipping"),
            }
            outcome.steps.push(PlannedStep {
                step_index,
                scheduled_for,
                job_id,
            });
        }

        info!(
            sequence = %sequence.key,
            contact_id = %contact.id,
            scheduled = outcome.scheduled(),
            skipped = outcome.skipped(),
            "Sequence triggered"
        );
        self.event_sink.emit(make_event(
            EngineEventType::SequenceTriggered,
            sequence.id.to_string(),
            Some(contact.id),
            Some(sequence.key.clone()),
        ));
        Ok(outcome)
    }
}

/// Referential and syntax checks for a sequence definition: every step's
/// template must exist, every condition must parse and the last step must
/// land within `MAX_SEQUENCE_SPAN_DAYS` of the trigger.
pub fn validate_sequence(store: &dyn Storage, sequence: &Sequence) -> MailflowResult<()> {
    SequencePlanner::offsets(sequence)?;
    let conditions = ConditionEvaluator::new();
    for (index, step) in sequence.steps.iter().enumerate() {
        if store.get_template(step.template_id).is_none() {
            return Err(MailflowError::Validation(format!(
                "sequence '{}' step {index} references unknown template {}",
                sequence.key, step.template_id
            )));
        }
        if let Some(condition) = step.condition.as_deref().filter(|c| !c.trim().is_empty()) {
            conditions.validate(condition).map_err(|e| {
                MailflowError::Validation(format!(
                    "sequence '{}' step {index} condition: {e}",
                    sequence.key
                ))
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailflow_core::event_bus::capture_sink;
    use mailflow_core::types::{Delay, JobStatus, SequenceStep, Template};
    use mailflow_core::{ManualClock, MemoryStore};
    use serde_json::json;

    fn setup() -> (Arc<MemoryStore>, SequencePlanner, Sequence, Contact) {
        let t0 = "2024-05-01T09:00:00Z".parse().unwrap();
        let store = Arc::new(MemoryStore::new());
        let welcome = Template::new("welcome", "Welcome", "Hi {{ first_name }}");
        let tips = Template::new("tips", "Tips", "Here are some tips");
        let sequence = Sequence::new("user-onboarding", "user.registered")
            .step(SequenceStep::new(welcome.id, Delay::minutes(0)))
            .step(SequenceStep::new(tips.id, Delay::days(1)))
            .step(SequenceStep::new(tips.id, Delay::hours(6)));
        store.insert_template(welcome).unwrap();
        store.insert_template(tips).unwrap();
        store.insert_sequence(sequence.clone()).unwrap();
        let contact = Contact::new("new@example.com", t0);
        store.insert_contact(contact.clone()).unwrap();
        let planner = SequencePlanner::new(store.clone(), Arc::new(ManualClock::new(t0)));
        (store, planner, sequence, contact)
    }

    #[test]
    fn test_delays_accumulate_from_trigger() {
        let (store, planner, sequence, contact) = setup();
        let t: DateTime<Utc> = "2024-05-01T09:00:00Z".parse().unwrap();
        let outcome = planner.plan(&sequence, &contact, t, Variables::new()).unwrap();

        let times: Vec<_> = outcome.steps.iter().map(|s| s.scheduled_for).collect();
        assert_eq!(
            times,
            vec![t, t + Duration::days(1), t + Duration::days(1) + Duration::hours(6)]
        );
        assert_eq!(outcome.scheduled(), 3);

        let jobs = store.jobs_for_sequence(contact.id, sequence.id);
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|j| j.status == JobStatus::Scheduled && j.attempts == 0));
    }

    #[test]
    fn test_replanning_is_idempotent() {
        let (store, planner, sequence, contact) = setup();
        let t = Utc::now();
        let mut vars = Variables::new();
        vars.insert("source".into(), json!("signup-form"));
        planner.plan(&sequence, &contact, t, vars.clone()).unwrap();
        let again = planner
            .plan(&sequence, &contact, t + Duration::minutes(3), vars)
            .unwrap();
        assert_eq!(again.scheduled(), 0);
        assert_eq!(again.skipped(), 3);
        assert_eq!(store.jobs_for_sequence(contact.id, sequence.id).len(), 3);
    }

    #[test]
    fn test_payload_travels_with_jobs() {
        let (store, planner, sequence, contact) = setup();
        let mut vars = Variables::new();
        vars.insert("coupon".into(), json!("WELCOME10"));
        planner.plan(&sequence, &contact, Utc::now(), vars).unwrap();
        for job in store.jobs_for_sequence(contact.id, sequence.id) {
            assert_eq!(job.variables["coupon"], "WELCOME10");
        }
    }

    #[test]
    fn test_rejects_inactive_and_broken_sequences() {
        let (store, planner, mut sequence, contact) = setup();
        sequence.active = false;
        let err = planner
            .plan(&sequence, &contact, Utc::now(), Variables::new())
            .unwrap_err();
        assert!(err.is_validation());

        sequence.active = true;
        sequence.steps[1].template_id = Uuid::new_v4();
        assert!(planner
            .plan(&sequence, &contact, Utc::now(), Variables::new())
            .unwrap_err()
            .is_validation());

        sequence.steps[1].template_id = sequence.steps[0].template_id;
        sequence.steps[1].condition = Some("contact.engagement >".into());
        assert!(validate_sequence(store.as_ref(), &sequence).is_err());
        assert_eq!(store.job_count(), 0);
    }

    #[test]
    fn test_emits_events() {
        let (store, _, sequence, contact) = setup();
        let sink = capture_sink();
        let planner = SequencePlanner::new(store, Arc::new(ManualClock::new(Utc::now())))
            .with_event_sink(sink.clone());
        planner
            .plan(&sequence, &contact, Utc::now(), Variables::new())
            .unwrap();
        assert_eq!(sink.count_type(EngineEventType::JobScheduled), 3);
        assert_eq!(sink.count_type(EngineEventType::SequenceTriggered), 1);
    }

    #[test]
    fn test_oversized_delays_are_rejected_without_jobs() {
        let (store, planner, sequence, contact) = setup();
        let template = sequence.steps[0].template_id;
        let forever = Sequence::new("forever", "user.registered")
            .step(SequenceStep::new(template, Delay::weeks(u32::MAX)));
        store.insert_sequence(forever.clone()).unwrap();

        assert!(validate_sequence(store.as_ref(), &forever).unwrap_err().is_validation());
        let err = planner
            .plan(&forever, &contact, Utc::now(), Variables::new())
            .unwrap_err();
        assert!(err.is_validation());
        assert!(store.jobs_for_sequence(contact.id, forever.id).is_empty());
    }

    #[test]
    fn test_span_limit_counts_accumulated_delays() {
        let (_, _, sequence, _) = setup();
        let template = sequence.steps[0].template_id;
        let half = (MAX_SEQUENCE_SPAN_DAYS / 2) as u32;
        let at_limit = Sequence::new("at-limit", "evt")
            .step(SequenceStep::new(template, Delay::days(half)))
            .step(SequenceStep::new(template, Delay::days(half)));
        let offsets = SequencePlanner::offsets(&at_limit).unwrap();
        assert_eq!(offsets[1], Duration::days(MAX_SEQUENCE_SPAN_DAYS));

        let past_limit = at_limit.clone().step(SequenceStep::new(template, Delay::minutes(1)));
        assert!(SequencePlanner::offsets(&past_limit).unwrap_err().is_validation());
    }

    #[test]
    fn test_trigger_near_end_of_time_is_rejected() {
        let (store, planner, sequence, contact) = setup();
        let err = planner
            .plan(&sequence, &contact, DateTime::<Utc>::MAX_UTC, Variables::new())
            .unwrap_err();
        assert!(err.is_validation());
        assert!(store.jobs_for_sequence(contact.id, sequence.id).is_empty());
    }
}
