//! The send pipeline.
//!
//! A [`Mailer`] runs every send through the same fixed sequence:
//! 1. sender resolution (the draft's `From`/`Sender`, else the mailer default)
//! 2. plugin draft processing
//! 3. build (skipped for pre-built wire messages)
//! 4. preprocessors
//! 5. encryption
//! 6. signing
//! 7. `on_before_send` hooks, then dispatch to the transports in order
//! 8. `on_after_send` hooks on delivery, `on_send_error` hooks otherwise
//!
//! With one transport a failure surfaces as `DeliveryFailed` wrapping the
//! transport's error. With several, failures fall back to the next transport
//! and only exhaustion raises `MultiDeliveryFailed`.

mod registry;

pub use registry::MailerRegistry;

use std::fmt;
use std::sync::Arc;

use crate::encryption::Encrypter;
use crate::errors::{MailerError, MailerErrorKind, MailerResult};
use crate::message::Email;
use crate::mime::MimeMessage;
use crate::observability::{MailerMetrics, Timer};
use crate::plugins::{Plugin, Preprocessor};
use crate::signing::Signer;
use crate::transport::{
    create_transport_from_url, refusal_error, SentMessage, SentMessages, Transport,
};
use crate::types::{AddressList, IntoAddresses};

/// Input accepted by [`Mailer::send`].
#[derive(Debug, Clone)]
pub enum Sendable {
    /// A draft, built by the mailer.
    Draft(Email),
    /// A finished wire message, sent as-is apart from wire stages.
    Wire(MimeMessage),
}

impl From<Email> for Sendable {
    fn from(email: Email) -> Self {
        Sendable::Draft(email)
    }
}

impl From<MimeMessage> for Sendable {
    fn from(message: MimeMessage) -> Self {
        Sendable::Wire(message)
    }
}

/// Mail composition and delivery façade.
pub struct Mailer {
    transports: Vec<Arc<dyn Transport>>,
    from_address: AddressList,
    plugins: Vec<Arc<dyn Plugin>>,
    preprocessors: Vec<Arc<dyn Preprocessor>>,
    encrypter: Option<Arc<dyn Encrypter>>,
    signer: Option<Arc<dyn Signer>>,
    metrics: Arc<MailerMetrics>,
}

impl Mailer {
    /// Creates a builder.
    pub fn builder() -> MailerBuilder {
        MailerBuilder::default()
    }

    /// Creates a mailer over a single transport.
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::from_transports(vec![Arc::new(transport) as Arc<dyn Transport>], AddressList::new())
    }

    /// Creates a mailer whose transport is built from a URL.
    pub fn from_url(url: &str) -> MailerResult<Self> {
        Ok(Self::from_transports(
            vec![create_transport_from_url(url)?],
            AddressList::new(),
        ))
    }

    fn from_transports(transports: Vec<Arc<dyn Transport>>, from_address: AddressList) -> Self {
        Self {
            transports,
            from_address,
            plugins: Vec::new(),
            preprocessors: Vec::new(),
            encrypter: None,
            signer: None,
            metrics: Arc::new(MailerMetrics::new()),
        }
    }

    /// Configured transports, in attempt order.
    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }

    /// Default `From` injected into drafts without one.
    pub fn from_address(&self) -> &AddressList {
        &self.from_address
    }

    /// Delivery counters.
    pub fn metrics(&self) -> &Arc<MailerMetrics> {
        &self.metrics
    }

    /// Sends a draft or a pre-built wire message.
    pub async fn send(&self, message: impl Into<Sendable>) -> MailerResult<SentMessages> {
        let timer = Timer::start("mailer.send");
        let message = self.prepare(message.into()).await?;

        for plugin in &self.plugins {
            plugin.on_before_send(&message).await?;
        }

        match self.dispatch(&message).await {
            Ok(mut sent) => {
                sent.set_duration(timer.stop());
                self.metrics.record_send_success();
                for plugin in &self.plugins {
                    plugin.on_after_send(&message, &sent).await?;
                }
                Ok(sent)
            }
            Err(e) => {
                self.metrics.record_send_failure();
                for plugin in &self.plugins {
                    plugin.on_send_error(&message, &e).await?;
                }
                Err(e)
            }
        }
    }

    /// Blocking variant of [`Mailer::send`].
    ///
    /// Runs the send on a private current-thread runtime. Must not be called
    /// from inside an async task; doing so returns `ImproperlyConfigured`.
    pub fn send_blocking(&self, message: impl Into<Sendable>) -> MailerResult<SentMessages> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(MailerError::configuration(
                "send_blocking cannot run inside an async runtime; await send instead.",
            ));
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.send(message))
    }

    /// Builds a draft from the arguments and the mailer defaults, then sends it.
    pub async fn send_simple(
        &self,
        to: impl IntoAddresses,
        subject: &str,
        text: Option<&str>,
        html: Option<&str>,
    ) -> MailerResult<SentMessages> {
        let mut email = Email::new().with_to(to)?.with_subject(subject);
        email.text = text.map(str::to_string);
        email.html = html.map(str::to_string);
        self.send(email).await
    }

    /// Sends several messages one after another, collecting every result.
    pub async fn send_batch<I, M>(&self, messages: I) -> Vec<MailerResult<SentMessages>>
    where
        I: IntoIterator<Item = M>,
        M: Into<Sendable>,
    {
        let mut results = Vec::new();
        for message in messages {
            results.push(self.send(message).await);
        }
        results
    }

    /// Steps 1 to 6: everything up to the final wire message.
    async fn prepare(&self, message: Sendable) -> MailerResult<MimeMessage> {
        let mut message = match message {
            Sendable::Draft(mut email) => {
                self.resolve_sender(&mut email)?;
                for plugin in &self.plugins {
                    email = plugin.process_email(email).await?;
                }
                email.build()?
            }
            Sendable::Wire(mut message) => {
                self.resolve_wire_sender(&mut message)?;
                message
            }
        };

        for preprocessor in &self.preprocessors {
            message = preprocessor.process(message).await?;
        }
        if let Some(encrypter) = &self.encrypter {
            message = encrypter.encrypt(message).await?;
        }
        if let Some(signer) = &self.signer {
            message = signer.sign(message).await?;
        }
        Ok(message)
    }

    fn resolve_sender(&self, email: &mut Email) -> MailerResult<()> {
        if email.from_address.is_empty() && !self.from_address.is_empty() {
            email.from_address = self.from_address.clone();
        }
        if !email.has_sender() {
            return Err(missing_sender());
        }
        Ok(())
    }

    fn resolve_wire_sender(&self, message: &mut MimeMessage) -> MailerResult<()> {
        if message.header("From").is_some() || message.header("Sender").is_some() {
            return Ok(());
        }
        if self.from_address.is_empty() {
            return Err(missing_sender());
        }
        message.set_header("From", self.from_address.to_string())
    }

    /// Step 7: tries the transports in order.
    async fn dispatch(&self, message: &MimeMessage) -> MailerResult<SentMessages> {
        let mut sent = SentMessages::new();
        let mut causes = Vec::with_capacity(self.transports.len());

        for (index, transport) in self.transports.iter().enumerate() {
            if index > 0 {
                self.metrics.record_fallback();
                tracing::debug!(transport = transport.name(), "Falling back to next transport");
            }
            tracing::debug!(transport = transport.name(), "Sending message");

            let cause = match transport.send(message).await {
                Ok(outcome) if outcome.ok => {
                    self.metrics.record_attempt(true);
                    tracing::info!(
                        transport = transport.name(),
                        attempts = sent.len() + 1,
                        "Message delivered"
                    );
                    sent.push(outcome);
                    return Ok(sent);
                }
                Ok(outcome) => {
                    let cause = refusal_error(&outcome);
                    sent.push(outcome);
                    cause
                }
                Err(e) => {
                    sent.push(SentMessage::failure(transport.name(), e.to_string()));
                    e
                }
            };
            self.metrics.record_attempt(false);
            tracing::warn!(transport = transport.name(), error = %cause, "Transport failed");
            causes.push(cause);
        }

        match (self.transports.as_slice(), causes.pop()) {
            ([transport], Some(cause)) if causes.is_empty() => {
                Err(MailerError::delivery(transport.name(), cause))
            }
            (_, last) => {
                causes.extend(last);
                tracing::warn!(attempts = causes.len(), "Every transport failed");
                Err(MailerError::multi_delivery(causes))
            }
        }
    }
}

fn missing_sender() -> MailerError {
    MailerError::new(
        MailerErrorKind::MissingSender,
        "Email must have a From or Sender address, or the mailer a default from address.",
    )
}

impl fmt::Debug for Mailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailer")
            .field("transports", &self.transports)
            .field("from_address", &self.from_address.to_string())
            .field("plugins", &self.plugins.len())
            .field("preprocessors", &self.preprocessors.len())
            .field("encrypter", &self.encrypter.is_some())
            .field("signer", &self.signer.is_some())
            .finish()
    }
}

/// Builder for [`Mailer`].
#[derive(Default)]
pub struct MailerBuilder {
    transports: Vec<Arc<dyn Transport>>,
    from_address: AddressList,
    plugins: Vec<Arc<dyn Plugin>>,
    preprocessors: Vec<Arc<dyn Preprocessor>>,
    encrypter: Option<Arc<dyn Encrypter>>,
    signer: Option<Arc<dyn Signer>>,
    metrics: Option<Arc<MailerMetrics>>,
}

impl MailerBuilder {
    /// Adds a transport. Transports are tried in the order added.
    pub fn transport(self, transport: impl Transport + 'static) -> Self {
        self.shared_transport(Arc::new(transport))
    }

    /// Adds an already shared transport.
    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Adds a transport built from a URL.
    pub fn transport_url(self, url: &str) -> MailerResult<Self> {
        Ok(self.shared_transport(create_transport_from_url(url)?))
    }

    /// Sets the default `From` for drafts without one.
    pub fn from_address(mut self, from: impl IntoAddresses) -> MailerResult<Self> {
        self.from_address.set(from)?;
        Ok(self)
    }

    /// Adds a plugin.
    pub fn plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Adds a preprocessor.
    pub fn preprocessor(mut self, preprocessor: impl Preprocessor + 'static) -> Self {
        self.preprocessors.push(Arc::new(preprocessor));
        self
    }

    /// Sets the encrypter.
    pub fn encrypter(mut self, encrypter: impl Encrypter + 'static) -> Self {
        self.encrypter = Some(Arc::new(encrypter));
        self
    }

    /// Sets the signer.
    pub fn signer(mut self, signer: impl Signer + 'static) -> Self {
        self.signer = Some(Arc::new(signer));
        self
    }

    /// Shares a metrics collector with other components.
    pub fn metrics(mut self, metrics: Arc<MailerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds the mailer.
    pub fn build(self) -> MailerResult<Mailer> {
        if self.transports.is_empty() {
            return Err(MailerError::configuration(
                "Mailer requires at least one transport.",
            ));
        }
        Ok(Mailer {
            transports: self.transports,
            from_address: self.from_address,
            plugins: self.plugins,
            preprocessors: self.preprocessors,
            encrypter: self.encrypter,
            signer: self.signer,
            metrics: self.metrics.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{test_email, EventLog, FailingTransport, RecordingPlugin, RecordingStage};
    use crate::transport::{InMemoryTransport, NullTransport};

    #[tokio::test]
    async fn test_send_through_memory() {
        let memory = InMemoryTransport::new();
        let mailer = Mailer::new(memory.clone());

        let email = Email::new()
            .with_to("a@x.com")
            .unwrap()
            .with_subject("S")
            .with_from("b@x.com")
            .unwrap()
            .with_text("T");
        let sent = mailer.send(email).await.unwrap();

        assert!(sent.ok());
        let stored = memory.mailbox().messages();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].header("Subject"), Some("S"));
        assert_eq!(stored[0].header("To"), Some("a@x.com"));
        assert_eq!(stored[0].header("From"), Some("b@x.com"));
    }

    #[tokio::test]
    async fn test_missing_sender_before_transport() {
        let memory = InMemoryTransport::new();
        let mailer = Mailer::new(memory.clone());

        let email = Email::new().with_to("a@x.com").unwrap().with_text("T");
        let err = mailer.send(email).await.unwrap_err();

        assert_eq!(err.kind(), MailerErrorKind::MissingSender);
        assert!(memory.mailbox().is_empty());
    }

    #[tokio::test]
    async fn test_default_from_injected_but_sender_kept() {
        let memory = InMemoryTransport::new();
        let mailer = Mailer::builder()
            .transport(memory.clone())
            .from_address("Robot <robot@example.com>")
            .unwrap()
            .build()
            .unwrap();

        let email = Email::new()
            .with_to("a@x.com")
            .unwrap()
            .with_sender("agent@x.com")
            .unwrap()
            .with_text("T");
        mailer.send(email).await.unwrap();

        let stored = memory.mailbox().last().unwrap();
        assert_eq!(stored.header("From"), Some("Robot <robot@example.com>"));
        assert_eq!(stored.header("Sender"), Some("agent@x.com"));
    }

    #[tokio::test]
    async fn test_fallback_records_both_attempts() {
        let memory = InMemoryTransport::new();
        let mailer = Mailer::builder()
            .transport(FailingTransport::new("down"))
            .transport(memory.clone())
            .build()
            .unwrap();

        let sent = mailer.send(test_email().unwrap()).await.unwrap();

        assert!(sent.ok());
        assert_eq!(sent.len(), 2);
        assert_eq!(sent.delivered_by(), Some("memory"));
        assert_eq!(memory.mailbox().len(), 1);

        let metrics = mailer.metrics().snapshot();
        assert_eq!(metrics.transport_attempts, 2);
        assert_eq!(metrics.transport_failures, 1);
        assert_eq!(metrics.fallbacks, 1);
        assert_eq!(metrics.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_raises_aggregate() {
        let mailer = Mailer::builder()
            .transport(FailingTransport::new("one"))
            .transport(FailingTransport::refusing("two"))
            .transport(FailingTransport::new("three"))
            .build()
            .unwrap();

        let err = mailer.send(test_email().unwrap()).await.unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::MultiDeliveryFailed);
        assert_eq!(err.causes().len(), 3);
        assert!(err.causes()[1].message().contains("two"));
        assert_eq!(mailer.metrics().snapshot().messages_failed, 1);
    }

    #[tokio::test]
    async fn test_single_transport_failure_wraps_cause() {
        let mailer = Mailer::new(FailingTransport::new("only"));
        let err = mailer.send(test_email().unwrap()).await.unwrap_err();

        assert_eq!(err.kind(), MailerErrorKind::DeliveryFailed);
        assert!(err.message().contains("only"));
        assert!(std::error::Error::source(&err).is_some());

        let mailer = Mailer::new(FailingTransport::refusing("picky"));
        let err = mailer.send(test_email().unwrap()).await.unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::DeliveryFailed);
    }

    #[tokio::test]
    async fn test_hook_order() {
        let log = EventLog::new();
        let mailer = Mailer::builder()
            .transport(NullTransport::new())
            .plugin(RecordingPlugin::new("plugin", log.clone()))
            .preprocessor(RecordingStage::new("preprocess", log.clone()))
            .encrypter(RecordingStage::new("encrypt", log.clone()))
            .signer(RecordingStage::new("sign", log.clone()))
            .build()
            .unwrap();

        mailer.send(test_email().unwrap()).await.unwrap();

        assert_eq!(
            log.events(),
            vec![
                "plugin.process_email",
                "preprocess",
                "encrypt",
                "sign",
                "plugin.on_before_send[preprocess,encrypt,sign]",
                "plugin.on_after_send[1]",
            ]
        );
    }

    #[tokio::test]
    async fn test_send_error_hook_on_exhaustion() {
        let log = EventLog::new();
        let mailer = Mailer::builder()
            .transport(FailingTransport::new("down"))
            .plugin(RecordingPlugin::new("plugin", log.clone()))
            .build()
            .unwrap();

        mailer.send(test_email().unwrap()).await.unwrap_err();
        let events = log.events();
        assert_eq!(events.last().unwrap(), "plugin.on_send_error[Delivery failed]");
        assert!(!events.iter().any(|e| e.contains("on_after_send")));
    }

    #[tokio::test]
    async fn test_wire_message_skips_build_and_draft_plugins() {
        let log = EventLog::new();
        let memory = InMemoryTransport::new();
        let mailer = Mailer::builder()
            .transport(memory.clone())
            .plugin(RecordingPlugin::new("plugin", log.clone()))
            .from_address("default@example.com")
            .unwrap()
            .build()
            .unwrap();

        let wire = MimeMessage::text("plain", "prebuilt", "utf-8").unwrap();
        mailer.send(wire).await.unwrap();

        assert!(!log.events().iter().any(|e| e.contains("process_email")));
        let stored = memory.mailbox().last().unwrap();
        assert_eq!(stored.header("From"), Some("default@example.com"));
        assert_eq!(stored.payload_text().as_deref(), Some("prebuilt"));
    }

    #[tokio::test]
    async fn test_send_blocking_refuses_inside_runtime() {
        let mailer = Mailer::new(NullTransport::new());
        let err = mailer.send_blocking(test_email().unwrap()).unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::ImproperlyConfigured);
    }

    #[test]
    fn test_send_blocking() {
        let memory = InMemoryTransport::new();
        let mailer = Mailer::new(memory.clone());
        let sent = mailer.send_blocking(test_email().unwrap()).unwrap();
        assert!(sent.ok());
        assert_eq!(memory.mailbox().len(), 1);
    }

    #[tokio::test]
    async fn test_send_simple_and_batch() {
        let memory = InMemoryTransport::new();
        let mailer = Mailer::builder()
            .transport(memory.clone())
            .from_address("robot@example.com")
            .unwrap()
            .build()
            .unwrap();

        mailer
            .send_simple(["a@x.com", "b@x.com"], "Hi", Some("text"), None)
            .await
            .unwrap();
        assert_eq!(memory.mailbox().last().unwrap().header("To"), Some("a@x.com, b@x.com"));

        let results = mailer.send_batch([test_email().unwrap(), Email::new()]).await;
        assert!(results[0].is_ok());
        assert_eq!(results[1].as_ref().unwrap_err().kind(), MailerErrorKind::EmptyBody);
    }

    #[test]
    fn test_builder_requires_transport() {
        let err = Mailer::builder().build().unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::ImproperlyConfigured);
    }
}
