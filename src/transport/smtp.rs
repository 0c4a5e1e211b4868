use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::{SentMessage, Transport};
use crate::config::{EmailUrl, SmtpConfig};
use crate::errors::{MailerError, MailerErrorKind, MailerResult};
use crate::mime::MimeMessage;
use crate::smtp::{SmtpClient, SmtpConnector, SmtpEnvelope};

/// Headers never transmitted in the DATA payload.
const STRIPPED_HEADERS: [&str; 2] = ["Bcc", "Return-Path"];

/// Submits messages through an [`SmtpClient`].
///
/// The envelope sender is `Return-Path`, else `Sender`, else the first `From`
/// address; recipients are every `To`, `Cc` and `Bcc` address. Refusals
/// reported by the client become a failed [`SentMessage`] rather than an error.
#[derive(Clone)]
pub struct SmtpTransport {
    client: Arc<dyn SmtpClient>,
    label: String,
}

impl SmtpTransport {
    /// Creates a transport connecting with `config`.
    pub fn new(config: SmtpConfig) -> MailerResult<Self> {
        let label = config.address();
        let client = SmtpConnector::new(config)?;
        Ok(Self {
            client: Arc::new(client),
            label,
        })
    }

    /// Creates a transport from an `smtp://` URL.
    pub fn from_url(url: &EmailUrl) -> MailerResult<Self> {
        Self::new(SmtpConfig::from_url(url)?)
    }

    /// Creates a transport over a custom client.
    pub fn with_client(client: impl SmtpClient + 'static) -> Self {
        Self {
            client: Arc::new(client),
            label: "custom".to_string(),
        }
    }

    /// Derives the SMTP envelope from the message headers.
    pub fn envelope(message: &MimeMessage) -> MailerResult<SmtpEnvelope> {
        let from = ["Return-Path", "Sender", "From"]
            .into_iter()
            .filter_map(|name| message.header(name))
            .flat_map(mailbox_addresses)
            .next()
            .ok_or_else(|| {
                MailerError::new(
                    MailerErrorKind::MissingSender,
                    "Message has no Return-Path, Sender or From address.",
                )
            })?;

        let recipients: Vec<String> = ["To", "Cc", "Bcc"]
            .into_iter()
            .flat_map(|name| message.headers().get_all(name))
            .flat_map(mailbox_addresses)
            .collect();
        if recipients.is_empty() {
            return Err(MailerError::bad_address("Message has no recipients."));
        }

        Ok(SmtpEnvelope { from, recipients })
    }
}

/// Extracts bare addresses from an address-list header value.
fn mailbox_addresses(value: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angle = false;

    for c in value.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angle = true,
            '>' if !in_quotes => in_angle = false,
            ',' if !in_quotes && !in_angle => {
                items.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    items.push(current);

    items
        .iter()
        .filter_map(|item| {
            let item = item.trim();
            let address = match (item.rfind('<'), item.rfind('>')) {
                (Some(start), Some(end)) if start < end => &item[start + 1..end],
                _ => item,
            };
            let address = address.trim();
            (!address.is_empty()).then(|| address.to_string())
        })
        .collect()
}

impl fmt::Debug for SmtpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpTransport")
            .field("server", &self.label)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, message: &MimeMessage) -> MailerResult<SentMessage> {
        let envelope = Self::envelope(message)?;

        let mut wire = message.clone();
        for name in STRIPPED_HEADERS {
            wire.remove_header(name);
        }

        match self.client.send(&envelope, &wire.to_bytes()).await {
            Ok(reply) => {
                tracing::info!(
                    server = %self.label,
                    recipients = envelope.recipients.len(),
                    reply = %reply,
                    "SMTP server accepted message"
                );
                Ok(SentMessage::success(self.name()))
            }
            Err(e) => {
                tracing::warn!(server = %self.label, error = %e, "SMTP delivery failed");
                Ok(SentMessage::failure(self.name(), e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smtp::{MockSmtpClient, SmtpResponse};

    fn message() -> MimeMessage {
        let mut message = MimeMessage::text("plain", "Hello", "utf-8").unwrap();
        let headers = [
            ("From", "Alice <alice@example.com>"),
            ("To", "\"Doe, John\" <john@example.com>, bob@example.com"),
            ("Cc", "carol@example.com"),
            ("Bcc", "secret@example.com"),
        ];
        for (name, value) in headers {
            message.set_header(name, value).unwrap();
        }
        message
    }

    #[test]
    fn test_envelope_from_headers() {
        let envelope = SmtpTransport::envelope(&message()).unwrap();
        assert_eq!(envelope.from, "alice@example.com");
        assert_eq!(
            envelope.recipients,
            vec![
                "john@example.com",
                "bob@example.com",
                "carol@example.com",
                "secret@example.com"
            ]
        );
    }

    #[test]
    fn test_envelope_sender_precedence() {
        let mut msg = message();
        msg.set_header("Sender", "agent@example.com").unwrap();
        assert_eq!(SmtpTransport::envelope(&msg).unwrap().from, "agent@example.com");

        msg.set_header("Return-Path", "<bounces@example.com>").unwrap();
        assert_eq!(SmtpTransport::envelope(&msg).unwrap().from, "bounces@example.com");
    }

    #[test]
    fn test_envelope_requires_sender_and_recipients() {
        let mut msg = message();
        msg.remove_header("From");
        assert_eq!(
            SmtpTransport::envelope(&msg).unwrap_err().kind(),
            MailerErrorKind::MissingSender
        );

        let mut msg = message();
        for name in ["To", "Cc", "Bcc"] {
            msg.remove_header(name);
        }
        assert!(SmtpTransport::envelope(&msg).is_err());
    }

    #[tokio::test]
    async fn test_send_strips_bcc_and_return_path() {
        let mut client = MockSmtpClient::new();
        client
            .expect_send()
            .withf(|envelope, data| {
                let data = String::from_utf8_lossy(data);
                envelope.recipients.len() == 4
                    && !data.contains("Bcc:")
                    && !data.contains("Return-Path:")
                    && data.contains("To: ")
            })
            .times(1)
            .returning(|_, _| Ok(SmtpResponse::new(250, "Queued")));

        let mut msg = message();
        msg.set_header("Return-Path", "bounces@example.com").unwrap();
        let sent = SmtpTransport::with_client(client).send(&msg).await.unwrap();
        assert!(sent.ok);
        assert_eq!(sent.transport, "smtp");
    }

    #[tokio::test]
    async fn test_client_error_reported_as_failed_outcome() {
        let mut client = MockSmtpClient::new();
        client
            .expect_send()
            .returning(|_, _| Err(MailerError::from_smtp_response(550, "Mailbox unavailable")));

        let sent = SmtpTransport::with_client(client).send(&message()).await.unwrap();
        assert!(!sent.ok);
        assert!(sent.error.unwrap().contains("Mailbox unavailable"));
    }
}
