//! Test doubles and fixtures.
//!
//! Reusable by downstream crates to observe the send pipeline without a
//! network or filesystem.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::encryption::Encrypter;
use crate::errors::{MailerError, MailerErrorKind, MailerResult};
use crate::message::Email;
use crate::mime::MimeMessage;
use crate::plugins::{Plugin, Preprocessor};
use crate::signing::Signer;
use crate::transport::{SentMessage, SentMessages, Transport};

#[derive(Debug, Clone, Copy)]
enum FailureMode {
    Error,
    Refuse,
}

/// Transport that never delivers.
#[derive(Debug, Clone)]
pub struct FailingTransport {
    name: String,
    mode: FailureMode,
    attempts: Arc<AtomicUsize>,
}

impl FailingTransport {
    /// Fails every send with a `DeliveryFailed` error.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_mode(name, FailureMode::Error)
    }

    /// Reports every send as refused (`ok == false`) without erroring.
    pub fn refusing(name: impl Into<String>) -> Self {
        Self::with_mode(name, FailureMode::Refuse)
    }

    fn with_mode(name: impl Into<String>, mode: FailureMode) -> Self {
        Self {
            name: name.into(),
            mode,
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of sends attempted so far, shared between clones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FailingTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, _message: &MimeMessage) -> MailerResult<SentMessage> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            FailureMode::Error => Err(MailerError::new(
                MailerErrorKind::DeliveryFailed,
                format!("Transport \"{}\" is unavailable.", self.name),
            )),
            FailureMode::Refuse => Ok(SentMessage::failure(
                self.name.clone(),
                format!("{} refused the message", self.name),
            )),
        }
    }
}

/// Ordered record of pipeline events, shared between doubles.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an event.
    pub fn push(&self, event: impl Into<String>) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.into());
    }

    /// Recorded events in order.
    pub fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Plugin recording each hook invocation as `<name>.<hook>`.
#[derive(Debug, Clone)]
pub struct RecordingPlugin {
    name: String,
    log: EventLog,
}

impl RecordingPlugin {
    /// Creates a plugin writing into `log`.
    pub fn new(name: impl Into<String>, log: EventLog) -> Self {
        Self {
            name: name.into(),
            log,
        }
    }
}

#[async_trait]
impl Plugin for RecordingPlugin {
    async fn process_email(&self, email: Email) -> MailerResult<Email> {
        self.log.push(format!("{}.process_email", self.name));
        Ok(email)
    }

    async fn on_before_send(&self, message: &MimeMessage) -> MailerResult<()> {
        let stages: Vec<&str> = message.headers().get_all("X-Stage").collect();
        self.log
            .push(format!("{}.on_before_send[{}]", self.name, stages.join(",")));
        Ok(())
    }

    async fn on_after_send(&self, _message: &MimeMessage, sent: &SentMessages) -> MailerResult<()> {
        self.log
            .push(format!("{}.on_after_send[{}]", self.name, sent.len()));
        Ok(())
    }

    async fn on_send_error(&self, _message: &MimeMessage, error: &MailerError) -> MailerResult<()> {
        self.log
            .push(format!("{}.on_send_error[{}]", self.name, error.kind()));
        Ok(())
    }
}

/// Pipeline stage that records its invocation and appends an `X-Stage` header.
///
/// Implements [`Preprocessor`], [`Encrypter`] and [`Signer`], so one type can
/// stand in for every wire-message stage.
#[derive(Debug, Clone)]
pub struct RecordingStage {
    name: String,
    log: EventLog,
}

impl RecordingStage {
    /// Creates a stage writing into `log`.
    pub fn new(name: impl Into<String>, log: EventLog) -> Self {
        Self {
            name: name.into(),
            log,
        }
    }

    fn apply(&self, mut message: MimeMessage) -> MailerResult<MimeMessage> {
        self.log.push(self.name.clone());
        message.append_header("X-Stage", self.name.clone())?;
        Ok(message)
    }
}

#[async_trait]
impl Preprocessor for RecordingStage {
    async fn process(&self, message: MimeMessage) -> MailerResult<MimeMessage> {
        self.apply(message)
    }
}

#[async_trait]
impl Encrypter for RecordingStage {
    async fn encrypt(&self, message: MimeMessage) -> MailerResult<MimeMessage> {
        self.apply(message)
    }
}

#[async_trait]
impl Signer for RecordingStage {
    async fn sign(&self, message: MimeMessage) -> MailerResult<MimeMessage> {
        self.apply(message)
    }
}

/// Creates a test email.
pub fn test_email() -> MailerResult<Email> {
    Ok(Email::new()
        .with_from("sender@example.com")?
        .with_to("recipient@example.com")?
        .with_subject("Test Subject")
        .with_text("Test body"))
}

/// Creates a test email with HTML.
pub fn test_email_html() -> MailerResult<Email> {
    Ok(test_email()?
        .with_text("Plain text version")
        .with_html("<html><body><h1>HTML version</h1></body></html>"))
}

/// Creates a test email with attachment.
pub fn test_email_with_attachment() -> MailerResult<Email> {
    let mut email = test_email()?.with_subject("Test with Attachment").with_text("See attached");
    email.attach(&b"Hello, World!"[..], Some("test.txt"), Some("text/plain"));
    Ok(email)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failing_transport_modes() {
        let message = MimeMessage::text("plain", "x", "utf-8").unwrap();

        let down = FailingTransport::new("down");
        let err = down.send(&message).await.unwrap_err();
        assert!(err.message().contains("down"));

        let refusing = FailingTransport::refusing("picky");
        let clone = refusing.clone();
        let sent = refusing.send(&message).await.unwrap();
        assert!(!sent.ok);
        assert_eq!(clone.attempts(), 1);
    }

    #[tokio::test]
    async fn test_recording_stage_appends_header() {
        let log = EventLog::new();
        let stage = RecordingStage::new("sign", log.clone());
        let message = MimeMessage::text("plain", "x", "utf-8").unwrap();

        let signed = Signer::sign(&stage, message).await.unwrap();
        assert_eq!(signed.header("X-Stage"), Some("sign"));
        assert_eq!(log.events(), vec!["sign"]);
    }

    #[test]
    fn test_fixtures_build() {
        let email = test_email().unwrap();
        assert_eq!(email.from_address.to_string(), "sender@example.com");
        assert_eq!(email.to.len(), 1);

        let mut email = test_email_with_attachment().unwrap();
        assert_eq!(email.attachments().len(), 1);
        assert!(email.build().unwrap().is_multipart());
    }
}
