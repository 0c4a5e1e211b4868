//! Delivery backends.
//!
//! Every backend implements [`Transport`]: one `send` per finished wire
//! message, independent of earlier calls. Backends:
//! - [`NullTransport`]: discards messages
//! - [`InMemoryTransport`]: appends to a shared [`Mailbox`]
//! - [`FileTransport`]: writes one `.eml` file per message
//! - [`StreamTransport`] and [`ConsoleTransport`]: write the message text to a sink
//! - [`SmtpTransport`]: submits through an [`SmtpClient`](crate::smtp::SmtpClient)
//! - [`MultiTransport`]: tries children in order
//!
//! [`TransportRegistry`] builds backends from connection-string URLs.

mod file;
mod memory;
mod multi;
mod null;
mod registry;
mod smtp;
mod stream;

pub use file::FileTransport;
pub use memory::{InMemoryTransport, Mailbox};
pub use multi::MultiTransport;
pub(crate) use multi::refusal_error;
pub use null::NullTransport;
pub use registry::{create_transport_from_url, TransportFactory, TransportRegistry};
pub use smtp::SmtpTransport;
pub use stream::{ConsoleStream, ConsoleTransport, StreamTransport};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::MailerResult;
use crate::mime::MimeMessage;

/// A delivery backend.
///
/// `Ok` with `ok == false` reports a refusal the backend observed; `Err` is
/// raised for failures it could not report.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Name used in outcomes and logs.
    fn name(&self) -> &str;

    /// Delivers one message.
    async fn send(&self, message: &MimeMessage) -> MailerResult<SentMessage>;
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Whether the transport delivered the message.
    pub ok: bool,
    /// Name of the transport that made the attempt.
    pub transport: String,
    /// Failure description.
    pub error: Option<String>,
}

impl SentMessage {
    /// A successful attempt.
    pub fn success(transport: impl Into<String>) -> Self {
        Self {
            ok: true,
            transport: transport.into(),
            error: None,
        }
    }

    /// A failed attempt.
    pub fn failure(transport: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            transport: transport.into(),
            error: Some(error.into()),
        }
    }
}

/// Outcomes of every attempt made for one message, in attempt order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SentMessages {
    attempts: Vec<SentMessage>,
    duration: Duration,
}

impl SentMessages {
    /// Creates an empty outcome set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an attempt.
    pub fn push(&mut self, attempt: SentMessage) {
        self.attempts.push(attempt);
    }

    /// True when the last attempt delivered the message.
    pub fn ok(&self) -> bool {
        self.attempts.last().is_some_and(|a| a.ok)
    }

    /// Number of attempts.
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    /// True when nothing was attempted.
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// All attempts.
    pub fn attempts(&self) -> &[SentMessage] {
        &self.attempts
    }

    /// Name of the transport that delivered the message.
    pub fn delivered_by(&self) -> Option<&str> {
        self.attempts
            .iter()
            .find(|a| a.ok)
            .map(|a| a.transport.as_str())
    }

    /// Failure descriptions of the failed attempts.
    pub fn errors(&self) -> impl Iterator<Item = &str> {
        self.attempts.iter().filter_map(|a| a.error.as_deref())
    }

    /// Time spent delivering.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub(crate) fn set_duration(&mut self, duration: Duration) {
        self.duration = duration;
    }
}
