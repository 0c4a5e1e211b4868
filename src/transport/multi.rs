use std::sync::Arc;

use async_trait::async_trait;

use super::{SentMessage, Transport};
use crate::errors::{MailerError, MailerErrorKind, MailerResult};
use crate::mime::MimeMessage;

/// Tries child transports in order until one delivers.
///
/// Raises `MultiDeliveryFailed`, carrying one cause per child, when every
/// child fails.
#[derive(Debug, Clone)]
pub struct MultiTransport {
    transports: Vec<Arc<dyn Transport>>,
}

impl MultiTransport {
    /// Creates a transport over `transports`.
    pub fn new(transports: impl IntoIterator<Item = Arc<dyn Transport>>) -> Self {
        Self {
            transports: transports.into_iter().collect(),
        }
    }

    /// Returns the children.
    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }
}

/// Turns a refused attempt into an error carrying the refusal text.
pub(crate) fn refusal_error(outcome: &SentMessage) -> MailerError {
    MailerError::new(
        MailerErrorKind::DeliveryFailed,
        format!(
            "Transport \"{}\" refused the message: {}",
            outcome.transport,
            outcome.error.as_deref().unwrap_or("unknown error")
        ),
    )
}

#[async_trait]
impl Transport for MultiTransport {
    fn name(&self) -> &str {
        "multi"
    }

    async fn send(&self, message: &MimeMessage) -> MailerResult<SentMessage> {
        let mut causes = Vec::with_capacity(self.transports.len());

        for transport in &self.transports {
            match transport.send(message).await {
                Ok(outcome) if outcome.ok => return Ok(outcome),
                Ok(outcome) => causes.push(refusal_error(&outcome)),
                Err(e) => causes.push(e),
            }
            tracing::debug!(transport = transport.name(), "Child transport failed, trying next");
        }

        Err(MailerError::multi_delivery(causes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::FailingTransport;
    use crate::transport::{InMemoryTransport, NullTransport};

    #[tokio::test]
    async fn test_first_success_wins() {
        let memory = InMemoryTransport::new();
        let multi = MultiTransport::new([
            Arc::new(FailingTransport::new("down")) as Arc<dyn Transport>,
            Arc::new(memory.clone()),
            Arc::new(NullTransport::new()),
        ]);

        let message = MimeMessage::text("plain", "x", "utf-8").unwrap();
        let sent = multi.send(&message).await.unwrap();
        assert_eq!(sent.transport, "memory");
        assert_eq!(memory.mailbox().len(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_collects_every_cause() {
        let multi = MultiTransport::new([
            Arc::new(FailingTransport::new("first")) as Arc<dyn Transport>,
            Arc::new(FailingTransport::refusing("second")),
        ]);

        let message = MimeMessage::text("plain", "x", "utf-8").unwrap();
        let err = multi.send(&message).await.unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::MultiDeliveryFailed);
        assert_eq!(err.causes().len(), 2);
        assert!(err.causes()[1].message().contains("second"));
    }
}
