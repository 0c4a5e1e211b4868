use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{SentMessage, Transport};
use crate::errors::{MailerError, MailerResult};
use crate::mime::MimeMessage;

type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// Writes the text form of each message to a sink.
#[derive(Clone)]
pub struct StreamTransport {
    name: String,
    sink: Arc<Mutex<Sink>>,
}

impl StreamTransport {
    /// Creates a transport writing to `sink`.
    pub fn new(sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self::named("stream", sink)
    }

    fn named(name: &str, sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            name: name.to_string(),
            sink: Arc::new(Mutex::new(Box::new(sink))),
        }
    }
}

impl fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTransport")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &MimeMessage) -> MailerResult<SentMessage> {
        let text = message.to_string();
        let mut sink = self.sink.lock().await;
        sink.write_all(text.as_bytes()).await?;
        sink.flush().await?;
        Ok(SentMessage::success(self.name()))
    }
}

/// Standard stream selected by a [`ConsoleTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsoleStream {
    /// Standard output.
    #[default]
    Stdout,
    /// Standard error.
    Stderr,
}

impl FromStr for ConsoleStream {
    type Err = MailerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(ConsoleStream::Stdout),
            "stderr" => Ok(ConsoleStream::Stderr),
            other => Err(MailerError::configuration(format!(
                "Unsupported console stream type: {}.",
                other
            ))),
        }
    }
}

/// Prints messages to stdout or stderr.
#[derive(Debug, Clone)]
pub struct ConsoleTransport {
    stream: ConsoleStream,
    inner: StreamTransport,
}

impl ConsoleTransport {
    /// Creates a transport printing to `stream`.
    pub fn new(stream: ConsoleStream) -> Self {
        let inner = match stream {
            ConsoleStream::Stdout => StreamTransport::named("console", tokio::io::stdout()),
            ConsoleStream::Stderr => StreamTransport::named("console", tokio::io::stderr()),
        };
        Self { stream, inner }
    }

    /// Returns the selected stream.
    pub fn stream(&self) -> ConsoleStream {
        self.stream
    }
}

#[async_trait]
impl Transport for ConsoleTransport {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send(&self, message: &MimeMessage) -> MailerResult<SentMessage> {
        self.inner.send(message).await
    }
}
