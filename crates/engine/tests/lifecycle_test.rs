//! End-to-end lifecycle tests: trigger → schedule → dispatch → webhook, run
//! against the in-memory store with a manual clock and a recording transport.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, Utc};
    use mailflow_core::config::AppConfig;
    use mailflow_core::event_bus::{capture_sink, CaptureSink, EngineEventType};
    use mailflow_core::store::Storage;
    use mailflow_core::types::{
        Campaign, CampaignContent, CampaignStatus, Delay, DeliveryEvent, DeliveryEventKind, JobStatus,
        LogStatus, Sequence, SequenceStep, Template, Variables, Variant,
    };
    use mailflow_core::{ManualClock, MemoryStore};
    use mailflow_delivery::{RecordingTransport, TransportError};
    use mailflow_engine::{ContactInput, MailEngine};
    use mailflow_segmentation::{AudienceBuilder, SegmentEvaluator};
    use proptest::prelude::*;
    use serde_json::json;

    struct World {
        engine: MailEngine,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        transport: Arc<RecordingTransport>,
    }

    fn t0() -> DateTime<Utc> {
        "2024-05-01T09:00:00Z".parse().unwrap()
    }

    fn world_with(config: AppConfig) -> World {
        build_world(config, None)
    }

    fn build_world(config: AppConfig, sink: Option<Arc<CaptureSink>>) -> World {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let transport = Arc::new(RecordingTransport::new());
        let mut builder = MailEngine::builder(config, store.clone())
            .transport(transport.clone())
            .clock(clock.clone());
        if let Some(sink) = sink {
            builder = builder.event_sink(sink);
        }
        World {
            engine: builder.build().unwrap(),
            store,
            clock,
            transport,
        }
    }

    fn world() -> World {
        world_with(AppConfig::default())
    }

    /// `user-onboarding` = [(welcome, 0 min), (tips, 1 day), (survey, 1 day)].
    fn onboarding(w: &World, flags: fn(Sequence) -> Sequence) -> Sequence {
        let welcome = w
            .engine
            .create_template(Template::new("welcome", "Welcome, {{ first_name }}!", "Glad you joined."))
            .unwrap();
        let tips = w
            .engine
            .create_template(Template::new("tips", "Booking tips", "Try the demo reel filter."))
            .unwrap();
        let survey = w
            .engine
            .create_template(Template::new("survey", "How is it going?", "Two quick questions."))
            .unwrap();
        let sequence = flags(
            Sequence::new("user-onboarding", "user.registered")
                .step(SequenceStep::new(welcome, Delay::minutes(0)))
                .step(SequenceStep::new(tips, Delay::days(1)))
                .step(SequenceStep::new(survey, Delay::days(1))),
        );
        w.engine.create_sequence(sequence.clone()).unwrap();
        sequence
    }

    fn ana() -> ContactInput {
        let mut input = ContactInput::email("ana@example.com");
        input.first_name = Some("Ana".into());
        input
    }

    fn webhook(provider_id: &str, kind: DeliveryEventKind, at: DateTime<Utc>) -> DeliveryEvent {
        DeliveryEvent {
            provider_message_id: provider_id.into(),
            kind,
            timestamp: at,
            event_id: None,
        }
    }

    #[tokio::test]
    async fn test_onboarding_send_and_open() {
        let w = world();
        let sequence = onboarding(&w, |s| s);

        let plan = w.engine.trigger("user-onboarding", &ana(), Variables::new()).unwrap();
        assert_eq!(plan.scheduled(), 3);
        assert_eq!(plan.steps[0].scheduled_for, t0());
        assert_eq!(plan.steps[1].scheduled_for, t0() + Duration::days(1));

        w.clock.advance(Duration::seconds(5));
        let tick = w.engine.run_once().await.unwrap();
        assert_eq!(tick.sent, 1);

        let contact = w.store.find_contact_by_email("ana@example.com").unwrap();
        let jobs = w.store.jobs_for_sequence(contact.id, sequence.id);
        let step0 = jobs
            .iter()
            .find(|j| j.sequence.unwrap().step_index == 0)
            .unwrap();
        assert_eq!(step0.status, JobStatus::Sent);
        let log = w.store.get_log(step0.log_id.unwrap()).unwrap();
        assert_eq!(log.status, LogStatus::Sent);
        assert_eq!(log.subject, "Welcome, Ana!");
        assert_eq!(log.sent_at, Some(t0() + Duration::seconds(5)));

        let opened_at = t0() + Duration::minutes(30);
        let summary = w
            .engine
            .ingest_events(&[webhook(&log.provider_message_id, DeliveryEventKind::Opened, opened_at)])
            .await;
        assert_eq!(summary.applied, 1);

        let log = w.store.get_log(log.id).unwrap();
        assert_eq!(log.status, LogStatus::Opened);
        assert_eq!(log.open_count, 1);
        assert_eq!(log.opened_at, Some(opened_at));

        let contact = w.store.get_contact(contact.id).unwrap();
        assert_eq!(contact.engagement.total_sent, 1);
        assert_eq!(contact.engagement.total_opened, 1);
        assert_eq!(contact.last_activity, Some(opened_at));
    }

    #[tokio::test]
    async fn test_vip_audience_resolution() {
        let w = world();
        for (email, tags) in [
            ("a@example.com", vec!["vip"]),
            ("b@example.com", vec!["vip", "talent"]),
            ("c@example.com", vec!["talent"]),
            ("d@example.com", vec![]),
        ] {
            let mut input = ContactInput::email(email);
            input.tags = tags.into_iter().map(String::from).collect();
            mailflow_engine::upsert_contact(w.store.as_ref(), &input, t0()).unwrap();
        }
        let audience = AudienceBuilder::new("vips").tagged("vip").build().unwrap();
        let audience_id = w.engine.create_audience(audience).unwrap();

        let members = SegmentEvaluator::new()
            .resolve_stored(w.store.as_ref(), audience_id)
            .unwrap();
        let mut emails: Vec<String> = members
            .iter()
            .map(|id| w.store.get_contact(*id).unwrap().email)
            .collect();
        emails.sort();
        assert_eq!(emails, vec!["a@example.com", "b@example.com"]);
    }

    #[tokio::test]
    async fn test_timeouts_retry_with_backoff_then_fail() {
        let mut config = AppConfig::default();
        config.delivery.send_timeout_secs = 1;
        let w = world_with(config);
        let sequence = onboarding(&w, |s| s);
        w.engine.trigger("user-onboarding", &ana(), Variables::new()).unwrap();

        let contact = w.store.find_contact_by_email("ana@example.com").unwrap();
        let step0 = w
            .store
            .jobs_for_sequence(contact.id, sequence.id)
            .into_iter()
            .find(|j| j.sequence.unwrap().step_index == 0)
            .unwrap();
        w.store.update_job(step0.id, &mut |j| j.attempts = 2).unwrap();

        w.transport.set_delay(Some(std::time::Duration::from_millis(1_500)));
        let tick = w.engine.run_once().await.unwrap();
        assert_eq!(tick.retried, 1);

        let job = w.store.get_job(step0.id).unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.scheduled_for, t0() + Duration::seconds(300 * 8));
        assert!(job.error.as_deref().unwrap_or_default().contains("timed out"));

        w.clock.set(job.scheduled_for);
        let tick = w.engine.run_once().await.unwrap();
        assert_eq!(tick.failed, 1);

        let job = w.store.get_job(step0.id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 4);
        assert!(job.log_id.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_mid_sequence_cancels_the_rest() {
        let sink = capture_sink();
        let w = build_world(AppConfig::default(), Some(sink.clone()));
        let sequence = onboarding(&w, |s| s.stop_on_unsubscribe(true));
        w.engine.trigger("user-onboarding", &ana(), Variables::new()).unwrap();
        w.engine.run_once().await.unwrap();

        let contact = w.store.find_contact_by_email("ana@example.com").unwrap();
        let sent = w.transport.sent();
        assert_eq!(sent.len(), 1);

        let at = t0() + Duration::hours(3);
        w.engine
            .ingest_events(&[webhook(&sent[0].provider_message_id, DeliveryEventKind::Unsubscribed, at)])
            .await;

        let contact = w.store.get_contact(contact.id).unwrap();
        assert!(!contact.subscribed);
        assert_eq!(contact.unsubscribed_at, Some(at));

        let jobs = w.store.jobs_for_sequence(contact.id, sequence.id);
        let statuses: Vec<(u32, JobStatus)> = {
            let mut s: Vec<_> = jobs
                .iter()
                .map(|j| (j.sequence.unwrap().step_index, j.status))
                .collect();
            s.sort_by_key(|(i, _)| *i);
            s
        };
        assert_eq!(
            statuses,
            vec![
                (0, JobStatus::Sent),
                (1, JobStatus::Cancelled),
                (2, JobStatus::Cancelled)
            ]
        );
        assert_eq!(sink.count_type(EngineEventType::JobCancelled), 2);
        assert_eq!(sink.count_type(EngineEventType::ContactUnsubscribed), 1);

        // Nothing left to send, even days later.
        w.clock.advance(Duration::days(3));
        assert_eq!(w.engine.run_once().await.unwrap().due, 0);
        assert_eq!(w.transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_reply_halts_sequence() {
        let w = world();
        let sequence = onboarding(&w, |s| s.stop_on_reply(true));
        w.engine.trigger("user-onboarding", &ana(), Variables::new()).unwrap();
        w.engine.run_once().await.unwrap();

        let cancelled = w
            .engine
            .record_reply("ana@example.com", "user-onboarding")
            .unwrap();
        assert_eq!(cancelled, 2);

        let contact = w.store.find_contact_by_email("ana@example.com").unwrap();
        let live = w
            .store
            .jobs_for_sequence(contact.id, sequence.id)
            .into_iter()
            .filter(|j| j.status == JobStatus::Scheduled)
            .count();
        assert_eq!(live, 0);
    }

    #[tokio::test]
    async fn test_retrigger_does_not_duplicate_jobs() {
        let w = world();
        let sequence = onboarding(&w, |s| s);
        w.engine.trigger("user-onboarding", &ana(), Variables::new()).unwrap();
        let again = w.engine.trigger("user-onboarding", &ana(), Variables::new()).unwrap();
        assert_eq!(again.scheduled(), 0);

        let contact = w.store.find_contact_by_email("ana@example.com").unwrap();
        assert_eq!(w.store.jobs_for_sequence(contact.id, sequence.id).len(), 3);
    }

    #[tokio::test]
    async fn test_conditional_step_skips_low_engagement() {
        let w = world();
        let welcome = w
            .engine
            .create_template(Template::new("welcome", "Welcome", "Hi"))
            .unwrap();
        let upsell = w
            .engine
            .create_template(Template::new("upsell", "Go premium, {{ first_name }}", "{{ offer }}"))
            .unwrap();
        w.engine
            .create_sequence(
                Sequence::new("booking-followup", "booking.completed")
                    .step(SequenceStep::new(welcome, Delay::minutes(0)))
                    .step(
                        SequenceStep::new(upsell, Delay::minutes(0))
                            .when("plan == \"free\" && bookings >= 3"),
                    ),
            )
            .unwrap();

        let mut vars = Variables::new();
        vars.insert("bookings".into(), json!(5));
        vars.insert("offer".into(), json!("20% off"));
        let mut free = ana();
        free.custom_fields.insert("plan".into(), json!("free"));
        w.engine.trigger("booking-followup", &free, vars.clone()).unwrap();

        let mut pro = ContactInput::email("bo@example.com");
        pro.custom_fields.insert("plan".into(), json!("pro"));
        w.engine.trigger("booking-followup", &pro, vars).unwrap();

        let tick = w.engine.run_once().await.unwrap();
        assert_eq!(tick.sent, 3);
        assert_eq!(tick.cancelled, 1);

        let upsells: Vec<_> = w
            .transport
            .sent()
            .into_iter()
            .filter(|m| m.message.subject.starts_with("Go premium"))
            .collect();
        assert_eq!(upsells.len(), 1);
        assert_eq!(upsells[0].message.to, "ana@example.com");
        assert_eq!(upsells[0].message.body, "20% off");
    }

    #[tokio::test]
    async fn test_campaign_broadcast_and_analytics() {
        let w = world();
        for i in 0..6 {
            let mut input = ContactInput::email(format!("talent{i}@example.com"));
            input.tags = vec!["voice-actor".into()];
            mailflow_engine::upsert_contact(w.store.as_ref(), &input, t0()).unwrap();
        }
        let audience = w
            .engine
            .create_audience(AudienceBuilder::new("talent").tagged("voice-actor").build().unwrap())
            .unwrap();
        let campaign = Campaign::new(
            "Casting call",
            audience,
            CampaignContent::new("New roles", "Auditions open now"),
            t0(),
        )
        .with_variants(vec![
            Variant::new("a", "New roles this week", 50),
            Variant::new("b", "Auditions are open", 50),
        ]);
        let campaign_id = w.engine.create_campaign(campaign).unwrap();

        let report = w.engine.send_campaign(campaign_id).unwrap();
        assert_eq!(report.queued, 6);
        assert!(w.engine.send_campaign(campaign_id).is_err());

        let tick = w.engine.run_once().await.unwrap();
        assert_eq!(tick.sent, 6);

        let sent = w.transport.sent();
        for message in &sent {
            assert!(
                message.message.subject == "New roles this week"
                    || message.message.subject == "Auditions are open"
            );
        }
        w.engine
            .ingest_events(&[
                webhook(&sent[0].provider_message_id, DeliveryEventKind::Delivered, t0()),
                webhook(&sent[0].provider_message_id, DeliveryEventKind::Opened, t0()),
                webhook(&sent[0].provider_message_id, DeliveryEventKind::Opened, t0()),
                webhook(&sent[1].provider_message_id, DeliveryEventKind::Clicked, t0()),
            ])
            .await;

        let analytics = w.engine.refresh_analytics(campaign_id).unwrap();
        assert_eq!(analytics.recipients, 6);
        assert_eq!(analytics.totals.sent, 6);
        assert_eq!(analytics.totals.delivered, 1);
        assert_eq!(analytics.totals.opened, 1);
        assert_eq!(analytics.totals.clicked, 1);
        assert_eq!(
            analytics.variants.values().map(|v| v.sent).sum::<u64>(),
            6
        );

        let stored = w.store.get_campaign(campaign_id).unwrap();
        assert_eq!(stored.status, CampaignStatus::Sent);
        assert_eq!(stored.analytics, analytics);
    }

    #[tokio::test]
    async fn test_invalid_recipient_suppresses_future_mail() {
        let w = world();
        onboarding(&w, |s| s);
        w.engine.trigger("user-onboarding", &ana(), Variables::new()).unwrap();
        w.transport
            .fail_next(TransportError::InvalidRecipient("550 mailbox unavailable".into()));
        let tick = w.engine.run_once().await.unwrap();
        assert_eq!(tick.failed, 1);

        let contact = w.store.find_contact_by_email("ana@example.com").unwrap();
        assert!(w
            .store
            .jobs_for_contact(contact.id)
            .iter()
            .all(|j| j.status.is_terminal()));
        assert!(!contact.is_mailable());
    }

    fn kind_strategy() -> impl Strategy<Value = DeliveryEventKind> {
        prop_oneof![
            Just(DeliveryEventKind::Delivered),
            Just(DeliveryEventKind::Opened),
            Just(DeliveryEventKind::Clicked),
            Just(DeliveryEventKind::Bounced),
            Just(DeliveryEventKind::Complained),
            Just(DeliveryEventKind::Unsubscribed),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_webhook_history_is_monotone(kinds in proptest::collection::vec(kind_strategy(), 1..12)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let w = world();
                onboarding(&w, |s| s);
                w.engine.trigger("user-onboarding", &ana(), Variables::new()).unwrap();
                w.engine.run_once().await.unwrap();
                let provider_id = w.transport.sent()[0].provider_message_id.clone();

                let mut expected = LogStatus::Sent;
                let mut first_open: Option<DateTime<Utc>> = None;
                for (i, kind) in kinds.iter().enumerate() {
                    let at = t0() + Duration::minutes(i as i64 + 1);
                    w.engine.ingest_events(&[webhook(&provider_id, *kind, at)]).await;
                    expected = expected.advance(kind.log_status());
                    if *kind == DeliveryEventKind::Opened && first_open.is_none() {
                        first_open = Some(at);
                    }
                    let log = w.store.find_log_by_provider_id(&provider_id).unwrap();
                    assert_eq!(log.status, expected);
                    assert_eq!(log.opened_at, first_open);
                }

                let opens = kinds.iter().filter(|k| **k == DeliveryEventKind::Opened).count() as u64;
                let log = w.store.find_log_by_provider_id(&provider_id).unwrap();
                assert_eq!(log.open_count, opens);
            });
        }
    }
}
