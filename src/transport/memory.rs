use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{SentMessage, Transport};
use crate::errors::MailerResult;
use crate::mime::MimeMessage;

/// Shared, ordered message store.
///
/// Clones share the same storage, so a test can keep one handle while a
/// transport appends through another.
#[derive(Debug, Clone, Default)]
pub struct Mailbox {
    messages: Arc<Mutex<Vec<MimeMessage>>>,
}

impl Mailbox {
    /// Creates an empty mailbox.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<MimeMessage>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a message.
    pub fn push(&self, message: MimeMessage) {
        self.lock().push(message);
    }

    /// Returns a copy of the stored messages.
    pub fn messages(&self) -> Vec<MimeMessage> {
        self.lock().clone()
    }

    /// Returns the number of stored messages.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns the most recent message.
    pub fn last(&self) -> Option<MimeMessage> {
        self.lock().last().cloned()
    }

    /// Removes and returns every stored message.
    pub fn take(&self) -> Vec<MimeMessage> {
        std::mem::take(&mut *self.lock())
    }

    /// Removes every stored message.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Appends messages to a [`Mailbox`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    mailbox: Mailbox,
}

impl InMemoryTransport {
    /// Creates a transport with its own mailbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport appending to `mailbox`.
    pub fn with_mailbox(mailbox: Mailbox) -> Self {
        Self { mailbox }
    }

    /// Returns a handle to the mailbox.
    pub fn mailbox(&self) -> Mailbox {
        self.mailbox.clone()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, message: &MimeMessage) -> MailerResult<SentMessage> {
        self.mailbox.push(message.clone());
        tracing::debug!(stored = self.mailbox.len(), "Stored message in memory");
        Ok(SentMessage::success(self.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_shares_injected_mailbox() {
        let mailbox = Mailbox::new();
        let transport = InMemoryTransport::with_mailbox(mailbox.clone());

        let message = MimeMessage::text("plain", "one", "utf-8").unwrap();
        assert!(transport.send(&message).await.unwrap().ok);
        assert!(transport.send(&message).await.unwrap().ok);

        assert_eq!(mailbox.len(), 2);
        assert_eq!(transport.mailbox().len(), 2);
        assert_eq!(mailbox.take().len(), 2);
        assert!(mailbox.is_empty());
    }
}
