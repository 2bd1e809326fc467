//! Event reconciler: folds provider webhook events into Log and Contact
//! state.
//!
//! Handles delivered, opened, clicked, bounced, complained and unsubscribed
//! events. Timestamps are write-once, counters are per event, and a repeated
//! provider event id is ignored.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mailflow_core::config::ReconcilerConfig;
use mailflow_core::error::MailflowResult;
use mailflow_core::event_bus::{make_event, EngineEventType, EventSink};
use mailflow_core::store::Storage;
use mailflow_core::types::{ContactStatus, DeliveryEvent, DeliveryEventKind, Log};
use mailflow_sequences::SequenceHalter;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub unknown_event_retries: u32,
    pub retry_delay: Duration,
}

impl From<&ReconcilerConfig> for ReconcileSettings {
    fn from(config: &ReconcilerConfig) -> Self {
        Self {
            unknown_event_retries: config.unknown_event_retries,
            retry_delay: Duration::from_millis(config.unknown_event_retry_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied,
    Duplicate,
    /// No Log carries the provider message id; the event was dropped.
    Unknown,
    /// Storage refused the update; the event was dropped.
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub applied: usize,
    pub duplicates: usize,
    pub unknown: usize,
    pub failed: usize,
}

impl ReconcileSummary {
    fn record(&mut self, outcome: ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Applied => self.applied += 1,
            ReconcileOutcome::Duplicate => self.duplicates += 1,
            ReconcileOutcome::Unknown => self.unknown += 1,
            ReconcileOutcome::Failed => self.failed += 1,
        }
    }
}

pub fn kind_label(kind: DeliveryEventKind) -> &'static str {
    match kind {
        DeliveryEventKind::Delivered => "delivered",
        DeliveryEventKind::Opened => "opened",
        DeliveryEventKind::Clicked => "clicked",
        DeliveryEventKind::Bounced => "bounced",
        DeliveryEventKind::Complained => "complained",
        DeliveryEventKind::Unsubscribed => "unsubscribed",
    }
}

/// What an event changed on its Log row.
#[derive(Debug, Default)]
struct LogChange {
    duplicate: bool,
    first_occurrence: bool,
}

fn set_once(slot: &mut Option<DateTime<Utc>>, at: DateTime<Utc>) -> bool {
    if slot.is_some() {
        return false;
    }
    *slot = Some(at);
    true
}

fn apply_to_log(log: &mut Log, event: &DeliveryEvent) -> LogChange {
    if let Some(event_id) = &event.event_id {
        if !log.applied_event_ids.insert(event_id.clone()) {
            return LogChange {
                duplicate: true,
                first_occurrence: false,
            };
        }
    }
    let at = event.timestamp;
    let first_occurrence = match event.kind {
        DeliveryEventKind::Delivered => set_once(&mut log.delivered_at, at),
        DeliveryEventKind::Opened => {
            log.open_count += 1;
            set_once(&mut log.opened_at, at)
        }
        DeliveryEventKind::Clicked => {
            log.click_count += 1;
            set_once(&mut log.clicked_at, at)
        }
        DeliveryEventKind::Bounced => set_once(&mut log.bounced_at, at),
        DeliveryEventKind::Complained => set_once(&mut log.complained_at, at),
        DeliveryEventKind::Unsubscribed => set_once(&mut log.unsubscribed_at, at),
    };
    log.status = log.status.advance(event.kind.log_status());
    LogChange {
        duplicate: false,
        first_occurrence,
    }
}

pub struct EventReconciler {
    store: Arc<dyn Storage>,
    halter: Arc<SequenceHalter>,
    event_sink: Arc<dyn EventSink>,
    settings: ReconcileSettings,
}

impl EventReconciler {
    pub fn new(store: Arc<dyn Storage>, halter: Arc<SequenceHalter>, settings: ReconcileSettings) -> Self {
        Self {
            store,
            halter,
            event_sink: mailflow_core::event_bus::noop_sink(),
            settings,
        }
    }

    /// Attach an event sink for emitting analytics events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Reconcile one event. Never fails: unknown ids are retried briefly and
    /// then dropped, storage errors are logged.
    pub async fn ingest(&self, event: &DeliveryEvent) -> ReconcileOutcome {
        let kind = kind_label(event.kind);
        let mut lookups = 0;
        let log = loop {
            if let Some(log) = self.store.find_log_by_provider_id(&event.provider_message_id) {
                break log;
            }
            if lookups >= self.settings.unknown_event_retries {
                warn!(
                    provider_message_id = %event.provider_message_id,
                    event_type = kind,
                    "Delivery event for unknown message, dropping"
                );
                metrics::counter!("reconciler.events", "type" => kind, "outcome" => "unknown").increment(1);
                return ReconcileOutcome::Unknown;
            }
            lookups += 1;
            debug!(
                provider_message_id = %event.provider_message_id,
                attempt = lookups,
                "Delivery event for unknown message, retrying lookup"
            );
            tokio::time::sleep(self.settings.retry_delay).await;
        };

        let outcome = match self.apply(&log, event) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    log_id = %log.id,
                    event_type = kind,
                    error = %err,
                    "Failed to apply delivery event"
                );
                ReconcileOutcome::Failed
            }
        };
        let label = match outcome {
            ReconcileOutcome::Applied => "applied",
            ReconcileOutcome::Duplicate => "duplicate",
            ReconcileOutcome::Unknown => "unknown",
            ReconcileOutcome::Failed => "failed",
        };
        metrics::counter!("reconciler.events", "type" => kind, "outcome" => label).increment(1);
        outcome
    }

    pub async fn ingest_batch(&self, events: &[DeliveryEvent]) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        for event in events {
            summary.record(self.ingest(event).await);
        }
        info!(
            applied = summary.applied,
            duplicates = summary.duplicates,
            unknown = summary.unknown,
            failed = summary.failed,
            "Delivery events reconciled"
        );
        summary
    }

    /// Apply an event to a known Log and its contact.
    pub fn apply(&self, log: &Log, event: &DeliveryEvent) -> MailflowResult<ReconcileOutcome> {
        let mut change = LogChange::default();
        self.store.update_log(log.id, &mut |row| {
            change = apply_to_log(row, event);
        })?;
        if change.duplicate {
            debug!(log_id = %log.id, event_id = ?event.event_id, "Duplicate delivery event ignored");
            return Ok(ReconcileOutcome::Duplicate);
        }

        self.apply_to_contact(log, event, change.first_occurrence)?;

        self.event_sink.emit(make_event(
            EngineEventType::DeliveryEvent,
            log.id.to_string(),
            Some(log.contact_id),
            Some(kind_label(event.kind).to_string()),
        ));
        Ok(ReconcileOutcome::Applied)
    }

    fn apply_to_contact(&self, log: &Log, event: &DeliveryEvent, first: bool) -> MailflowResult<()> {
        let contact_id = log.contact_id;
        let at = event.timestamp;
        match event.kind {
            DeliveryEventKind::Delivered => {}
            DeliveryEventKind::Opened | DeliveryEventKind::Clicked => {
                self.store.update_contact(contact_id, &mut |c| {
                    if first {
                        match event.kind {
                            DeliveryEventKind::Opened => c.engagement.total_opened += 1,
                            _ => c.engagement.total_clicked += 1,
                        }
                        c.engagement.recompute_score();
                    }
                    if c.last_activity.map_or(true, |prev| prev < at) {
                        c.last_activity = Some(at);
                    }
                })?;
            }
            DeliveryEventKind::Bounced | DeliveryEventKind::Complained => {
                let status = if event.kind == DeliveryEventKind::Bounced {
                    ContactStatus::Bounced
                } else {
                    ContactStatus::Complained
                };
                self.store.update_contact(contact_id, &mut |c| {
                    // A complaint outranks a bounce; suppression outranks both.
                    let keep = matches!(
                        (c.status, status),
                        (ContactStatus::Suppressed, _) | (ContactStatus::Complained, ContactStatus::Bounced)
                    );
                    if !keep {
                        c.status = status;
                    }
                })?;
                info!(contact_id = %contact_id, status = ?status, "Contact suppressed by delivery event");
                self.halter
                    .cancel_all_for_contact(contact_id, &format!("contact {}", kind_label(event.kind)))?;
            }
            DeliveryEventKind::Unsubscribed => {
                self.store.update_contact(contact_id, &mut |c| {
                    c.subscribed = false;
                    if c.unsubscribed_at.is_none() {
                        c.unsubscribed_at = Some(at);
                    }
                })?;
                info!(contact_id = %contact_id, log_id = %log.id, "Contact unsubscribed");
                self.event_sink.emit(make_event(
                    EngineEventType::ContactUnsubscribed,
                    contact_id.to_string(),
                    Some(contact_id),
                    None,
                ));
                self.halter.halt_contact(contact_id)?;
            }
        }
        Ok(())
    }
}
