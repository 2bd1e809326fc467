//! Delivery dispatcher: renders a job's content and hands it to the
//! transport. Emits `EmailSent` on success; failures are classified and
//! returned to the scheduler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mailflow_core::clock::Clock;
use mailflow_core::config::DeliveryConfig;
use mailflow_core::error::MailflowError;
use mailflow_core::event_bus::{make_event, EngineEventType, EventSink};
use mailflow_core::store::Storage;
use mailflow_core::templates::{render_message, Renderer};
use mailflow_core::types::{Contact, Job, Log, LogStatus, TemplateVariable};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::transport::{OutboundMessage, Transport, TransportError};

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub default_from: String,
    pub default_reply_to: Option<String>,
    pub send_timeout: Duration,
}

impl From<&DeliveryConfig> for DispatchSettings {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            default_from: config.default_from.clone(),
            default_reply_to: config.default_reply_to.clone(),
            send_timeout: Duration::from_secs(config.send_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub log_id: Uuid,
    pub provider_message_id: String,
    pub latency_ms: u64,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Content could not be produced. Never retried, transport not called.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Bookkeeping failed after or around the send.
    #[error("dispatch bookkeeping failed: {0}")]
    Internal(#[source] MailflowError),
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Validation(_) => false,
            DispatchError::Transport(e) => e.is_retryable(),
            // The provider may already have the message.
            DispatchError::Internal(_) => false,
        }
    }
}

/// Subject, body and sender overrides a job resolves to.
struct Content {
    subject: String,
    body: String,
    declared: Vec<TemplateVariable>,
    from: Option<String>,
    reply_to: Option<String>,
}

pub struct DeliveryDispatcher {
    store: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    renderer: Arc<dyn Renderer>,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    settings: DispatchSettings,
}

impl DeliveryDispatcher {
    pub fn new(
        store: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        renderer: Arc<dyn Renderer>,
        clock: Arc<dyn Clock>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            transport,
            renderer,
            clock,
            event_sink: mailflow_core::event_bus::noop_sink(),
            settings,
        }
    }

    /// Attach an event sink for emitting analytics events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Render and send one job to `contact`. On success the Log row exists
    /// and the contact's send counter has been bumped.
    pub async fn dispatch(&self, job: &Job, contact: &Contact) -> Result<DispatchOutcome, DispatchError> {
        let content = self.resolve_content(job)?;

        let mut context = contact.attributes();
        for (name, value) in &job.variables {
            context.insert(name.clone(), value.clone());
        }
        let rendered = render_message(
            self.renderer.as_ref(),
            &content.subject,
            &content.body,
            &context,
            &content.declared,
        )
        .map_err(|e| DispatchError::Validation(e.to_string()))?;

        let message = OutboundMessage {
            job_id: job.id,
            to: contact.email.clone(),
            from: content.from.unwrap_or_else(|| self.settings.default_from.clone()),
            reply_to: content.reply_to.or_else(|| self.settings.default_reply_to.clone()),
            subject: rendered.subject,
            body: rendered.body,
        };

        let start = Instant::now();
        let sent = tokio::time::timeout(self.settings.send_timeout, self.transport.send(&message)).await;
        let latency_ms = start.elapsed().as_millis() as u64;
        metrics::histogram!(
            "delivery.send_latency_ms",
            "transport" => self.transport.name()
        )
        .record(latency_ms as f64);

        let provider_message_id = match sent {
            Ok(Ok(id)) => id,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                return Err(TransportError::Transient(format!(
                    "send timed out after {}ms",
                    self.settings.send_timeout.as_millis()
                ))
                .into())
            }
        };

        let log_id = self.record_send(job, contact, &message.subject, &provider_message_id)?;
        debug!(
            job_id = %job.id,
            log_id = %log_id,
            provider_message_id = %provider_message_id,
            latency_ms,
            "Email dispatched"
        );
        self.event_sink.emit(make_event(
            EngineEventType::EmailSent,
            job.id.to_string(),
            Some(contact.id),
            Some(provider_message_id.clone()),
        ));

        Ok(DispatchOutcome {
            log_id,
            provider_message_id,
            latency_ms,
        })
    }

    fn resolve_content(&self, job: &Job) -> Result<Content, DispatchError> {
        if let Some(campaign_ref) = &job.campaign {
            let campaign = self.store.get_campaign(campaign_ref.campaign_id).ok_or_else(|| {
                DispatchError::Validation(format!("unknown campaign {}", campaign_ref.campaign_id))
            })?;
            let variant = campaign_ref.variant.as_deref().and_then(|name| {
                campaign
                    .active_variants()
                    .and_then(|variants| variants.iter().find(|v| v.name == name))
            });
            let (subject, body) = match variant {
                Some(v) => (
                    v.subject.clone(),
                    v.body.clone().unwrap_or_else(|| campaign.content.body.clone()),
                ),
                None => (campaign.content.subject.clone(), campaign.content.body.clone()),
            };
            return Ok(Content {
                subject,
                body,
                declared: campaign.content.variables.clone(),
                from: campaign.content.from.clone(),
                reply_to: campaign.content.reply_to.clone(),
            });
        }

        let template_id = job
            .template_id
            .ok_or_else(|| DispatchError::Validation(format!("job {} has no content", job.id)))?;
        let template = self
            .store
            .get_template(template_id)
            .ok_or_else(|| DispatchError::Validation(format!("unknown template {template_id}")))?;
        Ok(Content {
            subject: template.subject,
            body: template.body,
            declared: template.variables,
            from: template.from,
            reply_to: template.reply_to,
        })
    }

    fn record_send(
        &self,
        job: &Job,
        contact: &Contact,
        subject: &str,
        provider_message_id: &str,
    ) -> Result<Uuid, DispatchError> {
        let now = self.clock.now();
        let log = Log {
            id: Uuid::new_v4(),
            contact_id: contact.id,
            job_id: job.id,
            template_id: job.template_id,
            sequence: job.sequence,
            campaign: job.campaign.clone(),
            subject: subject.to_string(),
            status: LogStatus::Sent,
            provider_message_id: provider_message_id.to_string(),
            sent_at: Some(now),
            delivered_at: None,
            opened_at: None,
            clicked_at: None,
            bounced_at: None,
            complained_at: None,
            unsubscribed_at: None,
            open_count: 0,
            click_count: 0,
            applied_event_ids: Default::default(),
            created_at: now,
        };
        let log_id = self.store.insert_log(log).map_err(DispatchError::Internal)?;

        if let Err(err) = self.store.update_contact(contact.id, &mut |c| {
            c.engagement.total_sent += 1;
            c.engagement.recompute_score();
        }) {
            // The email is out; a lost counter must not turn into a resend.
            warn!(contact_id = %contact.id, error = %err, "Failed to bump send counter");
        }
        Ok(log_id)
    }
}
