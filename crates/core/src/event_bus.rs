//! Engine event bus: trait for emitting lifecycle events from any component.
//!
//! Components accept an `Arc<dyn EventSink>` and report what happened to jobs,
//! logs and campaigns. Sinks forward to analytics pipelines or audit storage.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineEventType {
    SequenceTriggered,
    JobScheduled,
    EmailSent,
    EmailFailed,
    JobRetried,
    JobCancelled,
    DeliveryEvent,
    ContactUnsubscribed,
    CampaignBroadcast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_id: Uuid,
    pub event_type: EngineEventType,
    /// Id of the job, log, sequence or campaign the event is about.
    pub subject_id: String,
    pub contact_id: Option<Uuid>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Trait for emitting engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Sink that drops everything.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: EngineEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience builder for an `EngineEvent`.
pub fn make_event(
    event_type: EngineEventType,
    subject_id: impl Into<String>,
    contact_id: Option<Uuid>,
    detail: Option<String>,
) -> EngineEvent {
    EngineEvent {
        event_id: Uuid::new_v4(),
        event_type,
        subject_id: subject_id.into(),
        contact_id,
        detail,
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
