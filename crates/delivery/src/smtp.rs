//! SMTP transport over async lettre.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use mailflow_core::config::SmtpConfig;
use tracing::{debug, info};
use uuid::Uuid;

use crate::transport::{OutboundMessage, Transport, TransportError};

pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    /// Domain used for generated `Message-ID`s.
    id_domain: String,
}

impl SmtpTransport {
    pub fn new(config: &SmtpConfig) -> Result<Self, TransportError> {
        let relay = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| TransportError::Permanent(format!("SMTP relay: {e}")))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };
        let mut builder = relay.port(config.port);

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        info!(
            host = %config.host,
            port = config.port,
            starttls = config.starttls,
            "SMTP transport initialized"
        );
        Ok(Self {
            mailer: builder.build(),
            id_domain: config.host.clone(),
        })
    }

    fn build_message(&self, message: &OutboundMessage, message_id: &str) -> Result<Message, TransportError> {
        let from: Mailbox = message
            .from
            .parse()
            .map_err(|e| TransportError::Permanent(format!("Invalid from: {e}")))?;
        let to: Mailbox = message
            .to
            .parse()
            .map_err(|e| TransportError::InvalidRecipient(format!("{}: {e}", message.to)))?;

        let mut builder = Message::builder()
            .message_id(Some(message_id.to_string()))
            .from(from)
            .to(to)
            .subject(message.subject.clone())
            .header(content_type(&message.body));

        if let Some(reply_to) = &message.reply_to {
            let reply_to: Mailbox = reply_to
                .parse()
                .map_err(|e| TransportError::Permanent(format!("Invalid reply-to: {e}")))?;
            builder = builder.reply_to(reply_to);
        }

        builder
            .body(message.body.clone())
            .map_err(|e| TransportError::Permanent(format!("Build email: {e}")))
    }
}

fn content_type(body: &str) -> ContentType {
    if body.trim_start().starts_with('<') {
        ContentType::TEXT_HTML
    } else {
        ContentType::TEXT_PLAIN
    }
}

fn classify(err: lettre::transport::smtp::Error) -> TransportError {
    if err.is_permanent() {
        TransportError::Permanent(format!("SMTP send: {err}"))
    } else {
        TransportError::Transient(format!("SMTP send: {err}"))
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<String, TransportError> {
        let message_id = format!("<{}@{}>", Uuid::new_v4(), self.id_domain);
        let email = self.build_message(message, &message_id)?;
        self.mailer.send(email).await.map_err(classify)?;
        debug!(job_id = %message.job_id, to = %message.to, %message_id, "Email sent via SMTP");
        Ok(message_id)
    }
}
