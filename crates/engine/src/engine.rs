//! `MailEngine`, the entrypoints business flows and the HTTP layer call:
//! sequence triggers, campaign sends, webhook ingestion and reply signals.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mailflow_campaigns::{validate_split, BroadcastReport, CampaignBroadcaster};
use mailflow_core::clock::{system_clock, Clock};
use mailflow_core::config::{AppConfig, TransportKind};
use mailflow_core::error::{MailflowError, MailflowResult};
use mailflow_core::event_bus::EventSink;
use mailflow_core::store::Storage;
use mailflow_core::templates::Renderer;
use mailflow_core::types::{
    Audience, AudienceKind, Campaign, CampaignAnalytics, DeliveryEvent, Sequence, Template, Variables,
};
use mailflow_core::TemplateRenderer;
use mailflow_delivery::{
    DeliveryDispatcher, EventReconciler, LogTransport, ReconcileSummary, SmtpTransport, Transport,
};
use mailflow_scheduler::{JobScheduler, SchedulerSettings, TickSummary};
use mailflow_segmentation::SegmentEvaluator;
use mailflow_sequences::planner::validate_sequence;
use mailflow_sequences::{PlanOutcome, SequenceHalter, SequencePlanner};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::contacts::{upsert_contact, ContactInput};
use crate::workers::EngineWorkers;

/// Transport selected by `delivery.transport`.
pub fn build_transport(config: &AppConfig) -> MailflowResult<Arc<dyn Transport>> {
    match config.delivery.transport {
        TransportKind::Log => Ok(Arc::new(LogTransport)),
        TransportKind::Smtp => {
            let smtp = SmtpTransport::new(&config.smtp).map_err(|e| MailflowError::Config(e.to_string()))?;
            Ok(Arc::new(smtp))
        }
    }
}

pub struct EngineBuilder {
    config: AppConfig,
    store: Arc<dyn Storage>,
    transport: Option<Arc<dyn Transport>>,
    renderer: Option<Arc<dyn Renderer>>,
    clock: Option<Arc<dyn Clock>>,
    event_sink: Option<Arc<dyn EventSink>>,
}

impl EngineBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Wire every component. Without an explicit transport the one named in
    /// the config is built.
    pub fn build(self) -> MailflowResult<MailEngine> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => build_transport(&self.config)?,
        };
        let renderer: Arc<dyn Renderer> = match self.renderer {
            Some(renderer) => renderer,
            None => Arc::new(TemplateRenderer::new()),
        };
        let clock = self.clock.unwrap_or_else(system_clock);
        let sink = self
            .event_sink
            .unwrap_or_else(mailflow_core::event_bus::noop_sink);
        let store = self.store;

        let halter = Arc::new(
            SequenceHalter::new(store.clone(), clock.clone()).with_event_sink(sink.clone()),
        );
        let planner = SequencePlanner::new(store.clone(), clock.clone()).with_event_sink(sink.clone());
        let dispatcher = Arc::new(
            DeliveryDispatcher::new(
                store.clone(),
                transport,
                renderer,
                clock.clone(),
                (&self.config.delivery).into(),
            )
            .with_event_sink(sink.clone()),
        );
        let scheduler = Arc::new(
            JobScheduler::new(
                store.clone(),
                clock.clone(),
                dispatcher,
                halter.clone(),
                SchedulerSettings::from(&self.config.scheduler),
            )
            .with_event_sink(sink.clone()),
        );
        let reconciler = Arc::new(
            EventReconciler::new(store.clone(), halter.clone(), (&self.config.reconciler).into())
                .with_event_sink(sink.clone()),
        );
        let broadcaster = Arc::new(
            CampaignBroadcaster::new(store.clone(), clock.clone()).with_event_sink(sink),
        );

        info!(
            node_id = %self.config.node_id,
            workers = self.config.scheduler.workers,
            "Mail engine initialized"
        );
        Ok(MailEngine {
            config: self.config,
            store,
            clock,
            segments: SegmentEvaluator::new(),
            planner,
            halter,
            scheduler,
            reconciler,
            broadcaster,
        })
    }
}

pub struct MailEngine {
    config: AppConfig,
    store: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    segments: SegmentEvaluator,
    planner: SequencePlanner,
    halter: Arc<SequenceHalter>,
    scheduler: Arc<JobScheduler>,
    reconciler: Arc<EventReconciler>,
    broadcaster: Arc<CampaignBroadcaster>,
}

impl MailEngine {
    pub fn builder(config: AppConfig, store: Arc<dyn Storage>) -> EngineBuilder {
        EngineBuilder {
            config,
            store,
            transport: None,
            renderer: None,
            clock: None,
            event_sink: None,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Storage> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    pub fn broadcaster(&self) -> &Arc<CampaignBroadcaster> {
        &self.broadcaster
    }

    // ─── Definitions ────────────────────────────────────────────────────────

    pub fn create_template(&self, template: Template) -> MailflowResult<Uuid> {
        if template.key.trim().is_empty() {
            return Err(MailflowError::Validation("template key must not be empty".into()));
        }
        self.store.insert_template(template)
    }

    /// Steps must reference known templates and carry parseable conditions.
    pub fn create_sequence(&self, sequence: Sequence) -> MailflowResult<Uuid> {
        if sequence.key.trim().is_empty() {
            return Err(MailflowError::Validation("sequence key must not be empty".into()));
        }
        if sequence.steps.is_empty() {
            return Err(MailflowError::Validation(format!(
                "sequence '{}' has no steps",
                sequence.key
            )));
        }
        validate_sequence(self.store.as_ref(), &sequence)?;
        if let Some(audience_id) = sequence.audience_id {
            if self.store.get_audience(audience_id).is_none() {
                return Err(MailflowError::Validation(format!(
                    "sequence '{}' references unknown audience {audience_id}",
                    sequence.key
                )));
            }
        }
        self.store.insert_sequence(sequence)
    }

    pub fn create_audience(&self, audience: Audience) -> MailflowResult<Uuid> {
        if let AudienceKind::Dynamic { rules, .. } = &audience.kind {
            for rule in rules {
                rule.validate().map_err(MailflowError::Validation)?;
            }
        }
        self.store.insert_audience(audience)
    }

    pub fn create_campaign(&self, campaign: Campaign) -> MailflowResult<Uuid> {
        if let Some(variants) = campaign.active_variants() {
            validate_split(variants)?;
        }
        if self.store.get_audience(campaign.audience_id).is_none() {
            return Err(MailflowError::Validation(format!(
                "campaign '{}' references unknown audience {}",
                campaign.name, campaign.audience_id
            )));
        }
        self.store.insert_campaign(campaign)
    }

    // ─── Sequences ──────────────────────────────────────────────────────────

    /// Start `sequence_key` for the contact, creating the contact when the
    /// email is new.
    pub fn trigger(
        &self,
        sequence_key: &str,
        contact: &ContactInput,
        variables: Variables,
    ) -> MailflowResult<PlanOutcome> {
        let sequence = self
            .store
            .find_sequence_by_key(sequence_key)
            .ok_or_else(|| MailflowError::not_found("sequence", sequence_key))?;
        let now = self.clock.now();
        let contact = upsert_contact(self.store.as_ref(), contact, now)?;
        self.planner.plan(&sequence, &contact, now, variables)
    }

    /// Start every active sequence listening for `event` whose audience, if
    /// any, contains the contact.
    pub fn trigger_event(
        &self,
        event: &str,
        contact: &ContactInput,
        variables: Variables,
    ) -> MailflowResult<Vec<PlanOutcome>> {
        let now = self.clock.now();
        let contact = upsert_contact(self.store.as_ref(), contact, now)?;

        let mut outcomes = Vec::new();
        for sequence in self.store.list_sequences() {
            if !sequence.active || sequence.trigger_event != event {
                continue;
            }
            if let Some(audience_id) = sequence.audience_id {
                let Some(audience) = self.store.get_audience(audience_id) else {
                    warn!(sequence = %sequence.key, audience_id = %audience_id, "Sequence audience missing, skipping");
                    continue;
                };
                if !self.segments.is_member(&audience, &contact) {
                    debug!(sequence = %sequence.key, contact_id = %contact.id, "Contact outside sequence audience");
                    continue;
                }
            }
            outcomes.push(self.planner.plan(&sequence, &contact, now, variables.clone())?);
        }

        info!(event = %event, contact_id = %contact.id, sequences = outcomes.len(), "Event trigger processed");
        Ok(outcomes)
    }

    /// Record that the contact replied within a sequence and halt it when the
    /// sequence stops on reply. Returns the number of jobs cancelled.
    pub fn record_reply(&self, email: &str, sequence_key: &str) -> MailflowResult<usize> {
        let contact = self
            .store
            .find_contact_by_email(email)
            .ok_or_else(|| MailflowError::not_found("contact", email))?;
        let sequence = self
            .store
            .find_sequence_by_key(sequence_key)
            .ok_or_else(|| MailflowError::not_found("sequence", sequence_key))?;

        self.store.record_reply(contact.id, sequence.id, self.clock.now());
        info!(contact_id = %contact.id, sequence = %sequence.key, "Reply recorded");
        match self.halter.check(&sequence, &contact) {
            Some(reason) => self
                .halter
                .cancel_remaining(contact.id, sequence.id, reason.as_str()),
            None => Ok(0),
        }
    }

    // ─── Campaigns ──────────────────────────────────────────────────────────

    pub fn send_campaign(&self, campaign_id: Uuid) -> MailflowResult<BroadcastReport> {
        self.broadcaster.send_campaign(campaign_id)
    }

    pub fn schedule_campaign(&self, campaign_id: Uuid, at: DateTime<Utc>) -> MailflowResult<Campaign> {
        self.broadcaster.schedule_campaign(campaign_id, at)
    }

    pub fn cancel_campaign(&self, campaign_id: Uuid) -> MailflowResult<usize> {
        self.broadcaster.cancel_campaign(campaign_id)
    }

    pub fn refresh_analytics(&self, campaign_id: Uuid) -> MailflowResult<CampaignAnalytics> {
        self.broadcaster.refresh_analytics(campaign_id)
    }

    // ─── Delivery ───────────────────────────────────────────────────────────

    pub async fn ingest_events(&self, events: &[DeliveryEvent]) -> ReconcileSummary {
        self.reconciler.ingest_batch(events).await
    }

    /// One synchronous pass: release due campaigns, recover stale claims and
    /// process due jobs.
    pub async fn run_once(&self) -> MailflowResult<TickSummary> {
        self.broadcaster.release_due();
        self.scheduler.recover_stale_claims()?;
        Ok(self.scheduler.tick().await)
    }

    /// Start the scheduler pool plus the scheduled-campaign release loop.
    pub fn spawn_workers(&self, workers: usize) -> EngineWorkers {
        EngineWorkers::start(
            &self.config.node_id,
            workers,
            self.scheduler.clone(),
            self.broadcaster.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailflow_core::types::{CampaignContent, Delay, SequenceStep, Variant};
    use mailflow_core::{ManualClock, MemoryStore};
    use mailflow_delivery::RecordingTransport;
    use mailflow_segmentation::AudienceBuilder;

    fn engine() -> MailEngine {
        MailEngine::builder(AppConfig::default(), Arc::new(MemoryStore::new()))
            .transport(Arc::new(RecordingTransport::new()))
            .clock(Arc::new(ManualClock::new(Utc::now())))
            .build()
            .unwrap()
    }

    #[test]
    fn test_create_sequence_validates_references() {
        let engine = engine();
        let missing = Sequence::new("booking-followup", "booking.completed")
            .step(SequenceStep::new(Uuid::new_v4(), Delay::days(1)));
        assert!(engine.create_sequence(missing).unwrap_err().is_validation());

        let template = Template::new("thanks", "Thanks", "Thanks for booking");
        let template_id = engine.create_template(template).unwrap();
        let bad_condition = Sequence::new("booking-followup", "booking.completed")
            .step(SequenceStep::new(template_id, Delay::days(1)).when("engagement >"));
        assert!(engine.create_sequence(bad_condition).unwrap_err().is_validation());

        let ok = Sequence::new("booking-followup", "booking.completed")
            .step(SequenceStep::new(template_id, Delay::days(1)));
        assert!(engine.create_sequence(ok).is_ok());
        assert!(engine.create_sequence(Sequence::new("empty", "x")).is_err());
    }

    #[test]
    fn test_unreachable_delay_never_reaches_the_planner() {
        let engine = engine();
        let template_id = engine
            .create_template(Template::new("later", "Later", "See you"))
            .unwrap();
        let forever = Sequence::new("long", "evt")
            .step(SequenceStep::new(template_id, Delay::weeks(u32::MAX)));
        assert!(engine.create_sequence(forever.clone()).unwrap_err().is_validation());

        // Stored behind the engine's back, triggering still fails cleanly.
        engine.store().insert_sequence(forever).unwrap();
        let err = engine
            .trigger("long", &ContactInput::email("a@example.com"), Variables::new())
            .unwrap_err();
        assert!(err.is_validation());
        let contact = engine.store().find_contact_by_email("a@example.com").unwrap();
        assert!(engine.store().jobs_for_contact(contact.id).is_empty());
    }

    #[test]
    fn test_trigger_event_honours_sequence_audience() {
        let engine = engine();
        let template_id = engine
            .create_template(Template::new("hi", "Hi", "Hello"))
            .unwrap();
        let vip = engine
            .create_audience(AudienceBuilder::new("vips").tagged("vip").build().unwrap())
            .unwrap();

        let everyone = Sequence::new("purchase-thanks", "purchase.completed")
            .step(SequenceStep::new(template_id, Delay::minutes(0)));
        let mut vips_only = Sequence::new("vip-upsell", "purchase.completed")
            .step(SequenceStep::new(template_id, Delay::days(2)));
        vips_only.audience_id = Some(vip);
        let other = Sequence::new("welcome", "user.registered")
            .step(SequenceStep::new(template_id, Delay::minutes(0)));
        engine.create_sequence(everyone).unwrap();
        engine.create_sequence(vips_only).unwrap();
        engine.create_sequence(other).unwrap();

        let plain = engine
            .trigger_event("purchase.completed", &ContactInput::email("a@example.com"), Variables::new())
            .unwrap();
        assert_eq!(plain.len(), 1);

        let mut vip_contact = ContactInput::email("b@example.com");
        vip_contact.tags = vec!["vip".into()];
        let vip_plans = engine
            .trigger_event("purchase.completed", &vip_contact, Variables::new())
            .unwrap();
        assert_eq!(vip_plans.len(), 2);
    }

    #[test]
    fn test_trigger_unknown_sequence_is_not_found() {
        let engine = engine();
        let err = engine
            .trigger("nope", &ContactInput::email("a@example.com"), Variables::new())
            .unwrap_err();
        assert!(matches!(err, MailflowError::NotFound(_)));
    }

    #[test]
    fn test_create_campaign_checks_split() {
        let engine = engine();
        let audience = engine.create_audience(AudienceBuilder::everyone("all")).unwrap();
        let campaign = Campaign::new(
            "Launch",
            audience,
            CampaignContent::new("We launched", "Come see"),
            Utc::now(),
        )
        .with_variants(vec![Variant::new("a", "A", 70), Variant::new("b", "B", 20)]);
        assert!(engine.create_campaign(campaign).unwrap_err().is_validation());
    }
}
