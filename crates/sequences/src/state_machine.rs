use chrono::{DateTime, Utc};
use mailflow_core::error::{MailflowError, MailflowResult};
use mailflow_core::types::{Job, JobStatus};

/// Describes a single valid state transition for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTransition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub trigger: &'static str,
}

/// Guards job lifecycle by enforcing a finite set of valid status
/// transitions. Terminal statuses have no outgoing edges.
#[derive(Debug, Clone)]
pub struct JobStateMachine {
    pub transitions: Vec<JobTransition>,
}

impl JobStateMachine {
    pub fn new() -> Self {
        let transitions = vec![
            // Scheduled ->
            JobTransition {
                from: JobStatus::Scheduled,
                to: JobStatus::Processing,
                trigger: "claim",
            },
            JobTransition {
                from: JobStatus::Scheduled,
                to: JobStatus::Cancelled,
                trigger: "halt",
            },
            // Processing ->
            JobTransition {
                from: JobStatus::Processing,
                to: JobStatus::Sent,
                trigger: "delivered_to_transport",
            },
            JobTransition {
                from: JobStatus::Processing,
                to: JobStatus::Failed,
                trigger: "give_up",
            },
            JobTransition {
                from: JobStatus::Processing,
                to: JobStatus::Scheduled,
                trigger: "retry",
            },
            JobTransition {
                from: JobStatus::Processing,
                to: JobStatus::Cancelled,
                trigger: "skip",
            },
        ];
        Self { transitions }
    }

    pub fn can_transition(&self, from: JobStatus, to: JobStatus) -> bool {
        self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    /// Move `job` to `to`, stamping `updated_at`. Invalid moves leave the job
    /// untouched and return `Conflict`.
    pub fn transition(&self, job: &mut Job, to: JobStatus, now: DateTime<Utc>) -> MailflowResult<()> {
        if !self.can_transition(job.status, to) {
            return Err(MailflowError::Conflict(format!(
                "job {} cannot move from {:?} to {:?}",
                job.id, job.status, to
            )));
        }
        job.status = to;
        job.updated_at = now;
        if to != JobStatus::Processing {
            job.claimed_at = None;
        }
        Ok(())
    }
}

impl Default for JobStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailflow_core::types::{CampaignRef, Job};
    use uuid::Uuid;

    fn job() -> Job {
        let now = Utc::now();
        Job::for_campaign(
            Uuid::new_v4(),
            CampaignRef {
                campaign_id: Uuid::new_v4(),
                variant: None,
            },
            now,
            now,
        )
    }

    #[test]
    fn test_happy_path() {
        let sm = JobStateMachine::new();
        let mut j = job();
        sm.transition(&mut j, JobStatus::Processing, Utc::now()).unwrap();
        sm.transition(&mut j, JobStatus::Scheduled, Utc::now()).unwrap();
        sm.transition(&mut j, JobStatus::Processing, Utc::now()).unwrap();
        sm.transition(&mut j, JobStatus::Sent, Utc::now()).unwrap();
        assert_eq!(j.status, JobStatus::Sent);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let sm = JobStateMachine::new();
        for terminal in [JobStatus::Sent, JobStatus::Failed, JobStatus::Cancelled] {
            for to in [
                JobStatus::Scheduled,
                JobStatus::Processing,
                JobStatus::Sent,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                assert!(!sm.can_transition(terminal, to), "{terminal:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn test_invalid_transition_leaves_job_untouched() {
        let sm = JobStateMachine::new();
        let mut j = job();
        let err = sm.transition(&mut j, JobStatus::Sent, Utc::now()).unwrap_err();
        assert!(matches!(err, MailflowError::Conflict(_)));
        assert_eq!(j.status, JobStatus::Scheduled);
    }
}
