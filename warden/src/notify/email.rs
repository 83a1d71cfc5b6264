// warden/src/notify/email.rs
//
// SMTP delivery through lettre on the tokio runtime.
//
//   starttls = false   plain session to a local relay
//   starttls = true    EHLO → STARTTLS (rustls, webpki roots) → EHLO; a relay
//                      that does not offer STARTTLS fails the attempt
//   username/password  AUTH after the upgrade (PLAIN or LOGIN, as offered)
//
// Header values are built from alert text, so CR and LF are folded to spaces
// before they reach the message builder.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::{Mailbox, Message};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::extension::ClientId;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use sysinfo::System;

use super::{DeliveryError, NotificationChannel};
use crate::events::{Notification, Urgency};

/// Where and how to reach the relay.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host:        String,
    pub port:        u16,
    pub starttls:    bool,
    pub credentials: Option<(String, String)>,
    pub timeout:     Duration,
}

impl SmtpSettings {
    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, starttls: false, credentials: None, timeout: Duration::from_secs(10) }
    }
}

pub struct EmailChannel {
    transport:   AsyncSmtpTransport<Tokio1Executor>,
    sender:      Mailbox,
    recipients:  Vec<Mailbox>,
    min_urgency: Urgency,
}

impl EmailChannel {
    pub fn new(settings: SmtpSettings, sender: &str, recipients: &[String]) -> Result<Self, DeliveryError> {
        if recipients.is_empty() {
            return Err(DeliveryError::Config("email channel needs at least one recipient".into()));
        }
        let sender = mailbox(sender)?;
        let recipients = recipients.iter().map(|r| mailbox(r)).collect::<Result<Vec<_>, _>>()?;

        let builder = if settings.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
                .map_err(|e| DeliveryError::Config(format!("smtp tls setup: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(settings.host.as_str())
        };
        let helo = System::host_name().unwrap_or_else(|| "warden".into());
        let mut builder = builder
            .port(settings.port)
            .timeout(Some(settings.timeout))
            .hello_name(ClientId::Domain(helo));
        if let Some((user, pass)) = settings.credentials {
            builder = builder.credentials(Credentials::new(user, pass));
        }

        Ok(Self { transport: builder.build(), sender, recipients, min_urgency: Urgency::Low })
    }

    pub fn with_min_urgency(mut self, u: Urgency) -> Self {
        self.min_urgency = u;
        self
    }
}

fn mailbox(addr: &str) -> Result<Mailbox, DeliveryError> {
    header_value(addr)
        .parse::<Mailbox>()
        .map_err(|e| DeliveryError::Config(format!("bad address {:?}: {}", addr, e)))
}

/// Single-line header text.
pub fn header_value(s: &str) -> String {
    s.chars().map(|c| if c == '\r' || c == '\n' { ' ' } else { c }).collect()
}

#[derive(Debug, Clone, Copy)]
struct XPriority;

impl Header for XPriority {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-Priority")
    }

    fn parse(_: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self)
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), "1".to_string())
    }
}

/// Plain-text message for one notification. High urgency and above is
/// flagged with `X-Priority: 1`.
pub fn build_message(sender: &Mailbox, recipients: &[Mailbox], n: &Notification) -> Result<Message, DeliveryError> {
    let mut builder = Message::builder()
        .from(sender.clone())
        .subject(header_value(&n.title))
        .date_now()
        .header(ContentType::TEXT_PLAIN);
    for rcpt in recipients {
        builder = builder.to(rcpt.clone());
    }
    if n.urgency >= Urgency::High {
        builder = builder.header(XPriority);
    }
    builder.body(n.body.clone()).map_err(|e| DeliveryError::Config(format!("message: {}", e)))
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str { "email" }

    fn min_urgency(&self) -> Urgency { self.min_urgency }

    async fn send(&self, n: &Notification) -> Result<(), DeliveryError> {
        let message = build_message(&self.sender, &self.recipients, n)?;
        self.transport.send(message).await.map_err(|e| DeliveryError::Smtp(e.to_string()))?;
        Ok(())
    }
}
