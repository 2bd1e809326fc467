//! Outbound email transport abstraction.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// A fully rendered message ready to hand to a provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub job_id: Uuid,
    pub to: String,
    pub from: String,
    pub reply_to: Option<String>,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Network failure, provider 5xx or timeout. Worth retrying.
    #[error("transient transport failure: {0}")]
    Transient(String),
    /// Provider 4xx style rejection of the message.
    #[error("permanent transport rejection: {0}")]
    Permanent(String),
    /// The recipient address is unusable.
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

/// Email-sending provider. Returns the provider message id used to
/// correlate later webhook events.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, message: &OutboundMessage) -> Result<String, TransportError>;
}

/// Development transport: logs the message and reports success.
#[derive(Debug, Default)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<String, TransportError> {
        let provider_id = format!("log-{}", Uuid::new_v4());
        info!(
            job_id = %message.job_id,
            to = %message.to,
            from = %message.from,
            subject = %message.subject,
            provider_message_id = %provider_id,
            "Email (log transport)"
        );
        Ok(provider_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentMessage {
    pub provider_message_id: String,
    pub message: OutboundMessage,
}

/// Test transport that records every successful send. Failures can be queued
/// and are returned in order before sends start succeeding again; a delay
/// makes every call slow enough to trip a timeout.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentMessage>>,
    failures: Mutex<VecDeque<TransportError>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicU64,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: TransportError) {
        self.failures.lock().push_back(error);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Calls made, successful or not.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<String, TransportError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        let provider_message_id = format!("rec-{n}");
        self.sent.lock().push(SentMessage {
            provider_message_id: provider_message_id.clone(),
            message: message.clone(),
        });
        Ok(provider_message_id)
    }
}
