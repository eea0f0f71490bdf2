//! Transcript delivery: e-mail with the full text attached, or a log line when SMTP is off.

use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::EmailConfig;
use crate::error::{ScribeError, ScribeResult};
use crate::webhook::ResolutionMethod;

/// Characters of transcript quoted in the message body.
pub const PREVIEW_CHARS: usize = 400;

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    pub attachment_name: String,
    pub attachment: String,
}

pub fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

pub fn compose_notification(
    event_type: &str,
    method: ResolutionMethod,
    name: &str,
    transcript: &str,
) -> Notification {
    let body = format!(
        "A new transcript is ready.\n\n\
         Name: {name}\n\
         Event: {event_type}\n\
         Source: {method}\n\
         Length: {} characters\n\n\
         Preview:\n{}\n\n\
         The full transcript is attached.",
        transcript.chars().count(),
        preview(transcript),
    );
    Notification {
        subject: format!("Transcript ready: {name}"),
        body,
        attachment_name: format!("{name}.txt"),
        attachment: transcript.to_string(),
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, notification: &Notification) -> ScribeResult<()>;
}

/// Writes the notification to the log instead of sending it.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, notification: &Notification) -> ScribeResult<()> {
        tracing::info!(
            target: "scribe::notify",
            "{} ({} chars attached as {})",
            notification.subject,
            notification.attachment.chars().count(),
            notification.attachment_name
        );
        Ok(())
    }
}

pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

fn mailbox(field: &str, value: &str) -> ScribeResult<Mailbox> {
    value
        .trim()
        .parse()
        .map_err(|e| ScribeError::Config(format!("email.{field} '{value}': {e}")))
}

impl SmtpNotifier {
    /// `None` unless host, sender and recipient are all configured.
    pub fn from_config(config: &EmailConfig) -> ScribeResult<Option<Self>> {
        let (Some(host), Some(from), Some(to)) = (
            config.smtp_host.as_deref().filter(|h| !h.trim().is_empty()),
            config.from.as_deref(),
            config.to.as_deref(),
        ) else {
            return Ok(None);
        };

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host.trim())?
            .port(config.smtp_port);
        if let (Some(user), Some(pass)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Some(Self {
            transport: builder.build(),
            from: mailbox("from", from)?,
            to: mailbox("to", to)?,
        }))
    }

    fn build_message(&self, notification: &Notification) -> ScribeResult<Message> {
        let attachment = Attachment::new(notification.attachment_name.clone())
            .body(notification.attachment.clone(), ContentType::TEXT_PLAIN);
        let message = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(notification.subject.clone())
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(notification.body.clone()))
                    .singlepart(attachment),
            )?;
        Ok(message)
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, notification: &Notification) -> ScribeResult<()> {
        let message = self.build_message(notification)?;
        self.transport.send(message).await?;
        tracing::info!(target: "scribe::notify", "sent '{}' to {}", notification.subject, self.to);
        Ok(())
    }
}

/// SMTP when fully configured, otherwise the log notifier.
pub fn create_notifier(config: &EmailConfig) -> ScribeResult<Arc<dyn Notifier>> {
    match SmtpNotifier::from_config(config)? {
        Some(smtp) => Ok(Arc::new(smtp)),
        None => {
            tracing::warn!(target: "scribe::notify", "SMTP not configured; transcripts will only be logged");
            Ok(Arc::new(LogNotifier))
        }
    }
}
