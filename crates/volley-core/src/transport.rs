//! Outbound SMTP transport

use async_trait::async_trait;
use chrono::Utc;
use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;
use volley_common::config::SmtpConfig;
use volley_common::{Error, Result};

/// One fully rendered outbound message
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub from: String,
    pub reply_to: Option<String>,
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: Option<String>,
    /// One-click unsubscribe target for the List-Unsubscribe headers
    pub unsubscribe_url: Option<String>,
}

/// Transport failure with the provider's error text, which the retry
/// classifier inspects
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Outbound delivery seam; swapped for a mock in tests
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one message, returning its Message-ID
    async fn send(&self, email: &OutboundEmail) -> std::result::Result<String, TransportError>;
}

#[derive(Debug, Clone)]
struct ListUnsubscribe(String);

impl Header for ListUnsubscribe {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("List-Unsubscribe")
    }

    fn parse(s: &str) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

#[derive(Debug, Clone)]
struct ListUnsubscribePost(String);

impl Header for ListUnsubscribePost {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("List-Unsubscribe-Post")
    }

    fn parse(s: &str) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// Lettre-backed SMTP sender
pub struct SmtpSender {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    hostname: String,
}

impl SmtpSender {
    /// Build the transport from configuration
    pub fn new(config: &SmtpConfig, hostname: &str, send_timeout: Duration) -> Result<Self> {
        let builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| Error::Transport(format!("Failed to create SMTP transport: {}", e)))?
        } else if config.use_starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| Error::Transport(format!("Failed to create SMTP transport: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };

        let mut builder = builder.port(config.port);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        let mailer = builder.timeout(Some(send_timeout)).build();

        Ok(Self {
            mailer,
            hostname: hostname.to_string(),
        })
    }

    fn build_message(&self, email: &OutboundEmail, message_id: &str) -> Result<Message> {
        let from: Mailbox = email
            .from
            .parse()
            .map_err(|e| Error::Validation(format!("Invalid from address: {}", e)))?;
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|e| Error::Validation(format!("Invalid to address: {}", e)))?;

        let from_address = from.email.to_string();
        let mut builder = Message::builder()
            .from(from)
            .to(to)
            .subject(&email.subject)
            .message_id(Some(message_id.to_string()));

        if let Some(reply_to) = &email.reply_to {
            let mailbox: Mailbox = reply_to
                .parse()
                .map_err(|e| Error::Validation(format!("Invalid reply-to address: {}", e)))?;
            builder = builder.reply_to(mailbox);
        }

        if let Some(url) = &email.unsubscribe_url {
            // RFC 2369 wants a mailto fallback next to the URL entry
            builder = builder
                .header(ListUnsubscribe(format!(
                    "<{}>, <mailto:{}?subject=unsubscribe>",
                    url, from_address
                )))
                .header(ListUnsubscribePost("List-Unsubscribe=One-Click".to_string()));
        }

        let message = match &email.text_body {
            Some(text) => builder.multipart(
                MultiPart::alternative()
                    .singlepart(SinglePart::plain(text.clone()))
                    .singlepart(SinglePart::html(email.html_body.clone())),
            ),
            None => builder
                .header(ContentType::TEXT_HTML)
                .body(email.html_body.clone()),
        };

        message.map_err(|e| Error::Transport(format!("Failed to build message: {}", e)))
    }
}

#[async_trait]
impl Transport for SmtpSender {
    async fn send(&self, email: &OutboundEmail) -> std::result::Result<String, TransportError> {
        let message_id = format!(
            "<{}.{}@{}>",
            Uuid::new_v4(),
            Utc::now().timestamp(),
            self.hostname
        );

        let message = self
            .build_message(email, &message_id)
            .map_err(|e| TransportError(e.to_string()))?;

        match self.mailer.send(message).await {
            Ok(response) => {
                debug!(to = %email.to, "Message accepted: {:?}", response);
                Ok(message_id)
            }
            Err(e) => Err(TransportError(e.to_string())),
        }
    }
}
