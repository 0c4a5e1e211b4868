use async_trait::async_trait;

use super::{SentMessage, Transport};
use crate::errors::MailerResult;
use crate::mime::MimeMessage;

/// Accepts and discards every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTransport;

impl NullTransport {
    /// Creates the transport.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for NullTransport {
    fn name(&self) -> &str {
        "null"
    }

    async fn send(&self, message: &MimeMessage) -> MailerResult<SentMessage> {
        tracing::debug!(message_id = ?message.header("Message-ID"), "Discarding message");
        Ok(SentMessage::success(self.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_always_succeeds() {
        let message = MimeMessage::text("plain", "ignored", "utf-8").unwrap();
        let sent = NullTransport::new().send(&message).await.unwrap();
        assert!(sent.ok);
        assert_eq!(sent.transport, "null");
    }
}
