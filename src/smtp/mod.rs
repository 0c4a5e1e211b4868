//! SMTP client used by the SMTP transport.
//!
//! [`SmtpClient`] is the seam between message delivery and the wire: the
//! transport hands it an envelope and the finished message bytes.
//! [`SmtpConnector`] is the network implementation: it opens one connection
//! per message, negotiates implicit TLS or STARTTLS with rustls, authenticates
//! (PLAIN, LOGIN, CRAM-MD5) and runs the MAIL/RCPT/DATA transaction.

mod auth;
mod client;
mod protocol;

pub use auth::{AuthMethod, Credentials};
pub use client::SmtpConnector;
pub use protocol::{codes, EsmtpCapabilities, SmtpCommand, SmtpResponse};

use async_trait::async_trait;

use crate::errors::MailerResult;

/// Envelope addresses of one SMTP transaction, without angle brackets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpEnvelope {
    /// Reverse path for MAIL FROM.
    pub from: String,
    /// Forward paths for RCPT TO.
    pub recipients: Vec<String>,
}

/// Submits finished messages to an SMTP server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SmtpClient: Send + Sync {
    /// Delivers `data` to every recipient, returning the server's final reply.
    async fn send(&self, envelope: &SmtpEnvelope, data: &[u8]) -> MailerResult<SmtpResponse>;
}
