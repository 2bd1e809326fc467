//! Campaign broadcaster: resolves a campaign's audience, splits it across
//! A/B variants and queues one job per recipient for the scheduler.
//!
//! Campaign status moves `draft → scheduled → sending → sent`, or to
//! `cancelled` from draft/scheduled. Entering `sending` is a storage-level
//! check-and-set, so two concurrent sends broadcast once.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mailflow_core::clock::Clock;
use mailflow_core::error::{MailflowError, MailflowResult};
use mailflow_core::event_bus::{make_event, EngineEventType, EventSink};
use mailflow_core::store::Storage;
use mailflow_core::types::{Campaign, CampaignAnalytics, CampaignRef, CampaignStatus, Job, JobStatus};
use mailflow_segmentation::SegmentEvaluator;
use mailflow_sequences::JobStateMachine;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analytics::{self, DEFAULT_VARIANT};
use crate::variants::{assign_variant, validate_split};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub campaign_id: Uuid,
    /// Audience size before mailability filtering.
    pub resolved: usize,
    pub queued: usize,
    /// Recipients that already had a job for this campaign.
    pub already_queued: usize,
    /// Unsubscribed, suppressed or unknown contacts.
    pub skipped: usize,
    /// Newly queued jobs per variant.
    pub variants: BTreeMap<String, usize>,
}

pub struct CampaignBroadcaster {
    store: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    segments: SegmentEvaluator,
    machine: JobStateMachine,
    event_sink: Arc<dyn EventSink>,
}

impl CampaignBroadcaster {
    pub fn new(store: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            segments: SegmentEvaluator::new(),
            machine: JobStateMachine::new(),
            event_sink: mailflow_core::event_bus::noop_sink(),
        }
    }

    /// Attach an event sink for emitting analytics events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    fn load(&self, campaign_id: Uuid) -> MailflowResult<Campaign> {
        self.store
            .get_campaign(campaign_id)
            .ok_or_else(|| MailflowError::not_found("campaign", campaign_id))
    }

    /// Checks that must pass before a campaign may be scheduled or sent.
    fn check_ready(&self, campaign: &Campaign) -> MailflowResult<()> {
        if let Some(variants) = campaign.active_variants() {
            validate_split(variants)?;
        }
        if self.store.get_audience(campaign.audience_id).is_none() {
            return Err(MailflowError::Validation(format!(
                "campaign '{}' references unknown audience {}",
                campaign.name, campaign.audience_id
            )));
        }
        Ok(())
    }

    fn conflict(&self, campaign_id: Uuid, action: &str) -> MailflowError {
        let status = self
            .store
            .get_campaign(campaign_id)
            .map(|c| format!("{:?}", c.status).to_lowercase())
            .unwrap_or_else(|| "gone".into());
        MailflowError::Conflict(format!("cannot {action} campaign {campaign_id}: status is {status}"))
    }

    /// Broadcast now. Fails with `Conflict` when the campaign is not in
    /// draft or scheduled, which includes a concurrent send winning the race.
    pub fn send_campaign(&self, campaign_id: Uuid) -> MailflowResult<BroadcastReport> {
        let campaign = self.load(campaign_id)?;
        self.check_ready(&campaign)?;

        let now = self.clock.now();
        if !self.store.transition_campaign(
            campaign_id,
            &[CampaignStatus::Draft, CampaignStatus::Scheduled],
            CampaignStatus::Sending,
            now,
        )? {
            return Err(self.conflict(campaign_id, "send"));
        }
        self.store.update_campaign(campaign_id, &mut |c| c.started_at = Some(now))?;
        info!(campaign_id = %campaign_id, name = %campaign.name, "Campaign broadcast started");

        let report = match self.enqueue(&campaign, now) {
            Ok(report) => report,
            Err(err) => {
                error!(campaign_id = %campaign_id, error = %err, "Campaign broadcast aborted while queueing");
                self.roll_back_send(campaign_id, campaign.status, now);
                return Err(err);
            }
        };

        let recipients = (report.queued + report.already_queued) as u64;
        self.store.update_campaign(campaign_id, &mut |c| {
            c.analytics.recipients = recipients;
            c.completed_at = Some(now);
        })?;
        self.store.transition_campaign(
            campaign_id,
            &[CampaignStatus::Sending],
            CampaignStatus::Sent,
            now,
        )?;

        metrics::counter!("campaigns.broadcast_jobs").increment(report.queued as u64);
        info!(
            campaign_id = %campaign_id,
            resolved = report.resolved,
            queued = report.queued,
            already_queued = report.already_queued,
            skipped = report.skipped,
            "Campaign broadcast queued"
        );
        self.event_sink.emit(make_event(
            EngineEventType::CampaignBroadcast,
            campaign_id.to_string(),
            None,
            Some(format!("{} recipients", report.queued)),
        ));
        Ok(report)
    }

    /// Return an aborted broadcast to the status it was sent from so it can be
    /// sent again. Jobs already queued stay and are deduplicated on the retry.
    fn roll_back_send(&self, campaign_id: Uuid, prior: CampaignStatus, now: DateTime<Utc>) {
        let prior = match prior {
            CampaignStatus::Scheduled => CampaignStatus::Scheduled,
            _ => CampaignStatus::Draft,
        };
        let restored = self
            .store
            .transition_campaign(campaign_id, &[CampaignStatus::Sending], prior, now)
            .and_then(|moved| {
                if moved {
                    self.store.update_campaign(campaign_id, &mut |c| c.started_at = None)?;
                }
                Ok(moved)
            });
        match restored {
            Ok(true) => {
                warn!(campaign_id = %campaign_id, status = ?prior, "Campaign returned after failed broadcast")
            }
            Ok(false) => {}
            Err(err) => {
                error!(campaign_id = %campaign_id, error = %err, "Campaign left in sending after failed broadcast")
            }
        }
    }

    fn enqueue(&self, campaign: &Campaign, now: DateTime<Utc>) -> MailflowResult<BroadcastReport> {
        let audience = self
            .segments
            .resolve_stored(self.store.as_ref(), campaign.audience_id)?;
        let variants = campaign.active_variants();
        let mut report = BroadcastReport {
            campaign_id: campaign.id,
            resolved: audience.len(),
            queued: 0,
            already_queued: 0,
            skipped: 0,
            variants: BTreeMap::new(),
        };

        for contact_id in audience {
            let mailable = self
                .store
                .get_contact(contact_id)
                .is_some_and(|c| c.is_mailable());
            if !mailable {
                report.skipped += 1;
                continue;
            }
            let variant = variants
                .and_then(|vs| assign_variant(vs, contact_id))
                .map(|v| v.name.clone());
            let job = Job::for_campaign(
                contact_id,
                CampaignRef {
                    campaign_id: campaign.id,
                    variant: variant.clone(),
                },
                now,
                now,
            );
            match self.store.insert_job(job)? {
                Some(job_id) => {
                    report.queued += 1;
                    *report
                        .variants
                        .entry(variant.unwrap_or_else(|| DEFAULT_VARIANT.to_string()))
                        .or_default() += 1;
                    debug!(campaign_id = %campaign.id, job_id = %job_id, contact_id = %contact_id, "Campaign job queued");
                }
                None => report.already_queued += 1,
            }
        }
        Ok(report)
    }

    /// Park a draft (or re-time a scheduled) campaign for `at`.
    pub fn schedule_campaign(&self, campaign_id: Uuid, at: DateTime<Utc>) -> MailflowResult<Campaign> {
        let campaign = self.load(campaign_id)?;
        self.check_ready(&campaign)?;
        let now = self.clock.now();
        if !self.store.transition_campaign(
            campaign_id,
            &[CampaignStatus::Draft, CampaignStatus::Scheduled],
            CampaignStatus::Scheduled,
            now,
        )? {
            return Err(self.conflict(campaign_id, "schedule"));
        }
        let campaign = self
            .store
            .update_campaign(campaign_id, &mut |c| c.scheduled_at = Some(at))?;
        info!(campaign_id = %campaign_id, scheduled_at = %at, "Campaign scheduled");
        Ok(campaign)
    }

    /// Cancel a draft or scheduled campaign and any of its unclaimed jobs.
    pub fn cancel_campaign(&self, campaign_id: Uuid) -> MailflowResult<usize> {
        self.load(campaign_id)?;
        let now = self.clock.now();
        if !self.store.transition_campaign(
            campaign_id,
            &[CampaignStatus::Draft, CampaignStatus::Scheduled],
            CampaignStatus::Cancelled,
            now,
        )? {
            return Err(self.conflict(campaign_id, "cancel"));
        }

        let mut cancelled = 0;
        for job in self.store.jobs_for_campaign(campaign_id) {
            if job.status != JobStatus::Scheduled {
                continue;
            }
            let mut moved = false;
            self.store.update_job(job.id, &mut |j| {
                moved = self.machine.transition(j, JobStatus::Cancelled, now).is_ok();
                if moved {
                    j.error = Some("campaign cancelled".into());
                }
            })?;
            if moved {
                cancelled += 1;
                metrics::counter!("scheduler.jobs_cancelled").increment(1);
            }
        }
        info!(campaign_id = %campaign_id, jobs_cancelled = cancelled, "Campaign cancelled");
        Ok(cancelled)
    }

    /// Send every scheduled campaign whose time has come. A campaign another
    /// node already picked up is skipped.
    pub fn release_due(&self) -> Vec<BroadcastReport> {
        let now = self.clock.now();
        let due: Vec<Uuid> = self
            .store
            .list_campaigns()
            .into_iter()
            .filter(|c| c.status == CampaignStatus::Scheduled)
            .filter(|c| c.scheduled_at.is_some_and(|at| at <= now))
            .map(|c| c.id)
            .collect();

        let mut reports = Vec::with_capacity(due.len());
        for campaign_id in due {
            match self.send_campaign(campaign_id) {
                Ok(report) => reports.push(report),
                Err(MailflowError::Conflict(reason)) => {
                    debug!(campaign_id = %campaign_id, %reason, "Scheduled campaign already released")
                }
                Err(err) => {
                    warn!(campaign_id = %campaign_id, error = %err, "Failed to release scheduled campaign")
                }
            }
        }
        reports
    }

    pub fn refresh_analytics(&self, campaign_id: Uuid) -> MailflowResult<CampaignAnalytics> {
        analytics::refresh_analytics(self.store.as_ref(), campaign_id, self.clock.now())
    }
}
