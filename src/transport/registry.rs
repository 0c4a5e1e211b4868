use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{
    ConsoleStream, ConsoleTransport, FileTransport, InMemoryTransport, NullTransport,
    SmtpTransport, Transport,
};
use crate::config::EmailUrl;
use crate::errors::{MailerError, MailerErrorKind, MailerResult};

/// Builds a transport from a parsed URL.
pub type TransportFactory =
    Arc<dyn Fn(&EmailUrl) -> MailerResult<Arc<dyn Transport>> + Send + Sync>;

/// Maps URL schemes to transport factories.
///
/// The table is open: callers bind new schemes, or rebind built-in ones, at runtime.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    factories: HashMap<String, TransportFactory>,
}

impl TransportRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with `smtp`, `file`, `memory`, `null` and `console` bound.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.bind("smtp", |url| {
            Ok(Arc::new(SmtpTransport::from_url(url)?) as Arc<dyn Transport>)
        });
        registry.bind("file", |url| {
            Ok(Arc::new(FileTransport::new(url.path())?) as Arc<dyn Transport>)
        });
        registry.bind("memory", |_| {
            Ok(Arc::new(InMemoryTransport::new()) as Arc<dyn Transport>)
        });
        registry.bind("null", |_| Ok(Arc::new(NullTransport::new()) as Arc<dyn Transport>));
        registry.bind("console", |url| {
            let stream = url.options().get("stream").cloned().ok_or_else(|| {
                MailerError::configuration("console:// requires a \"stream\" option.")
            })?;
            let stream: ConsoleStream = stream.parse()?;
            Ok(Arc::new(ConsoleTransport::new(stream)) as Arc<dyn Transport>)
        });
        registry
    }

    /// Binds `scheme` to `factory`, replacing any previous binding.
    pub fn bind<F>(&mut self, scheme: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&EmailUrl) -> MailerResult<Arc<dyn Transport>> + Send + Sync + 'static,
    {
        self.factories.insert(scheme.into(), Arc::new(factory));
        self
    }

    /// Binds several schemes at once.
    pub fn bind_many<I, S>(&mut self, bindings: I) -> &mut Self
    where
        I: IntoIterator<Item = (S, TransportFactory)>,
        S: Into<String>,
    {
        self.factories
            .extend(bindings.into_iter().map(|(scheme, f)| (scheme.into(), f)));
        self
    }

    /// Returns true if `scheme` is bound.
    pub fn contains(&self, scheme: &str) -> bool {
        self.factories.contains_key(scheme)
    }

    /// Bound schemes, sorted.
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    /// Builds the transport for a parsed URL.
    pub fn create(&self, url: &EmailUrl) -> MailerResult<Arc<dyn Transport>> {
        let scheme = url.transport();
        let factory = self.factories.get(scheme).ok_or_else(|| {
            MailerError::new(
                MailerErrorKind::UnregisteredTransport,
                format!("No transport found with scheme \"{}\".", scheme),
            )
        })?;
        tracing::debug!(scheme, url = %url.redacted(), "Creating transport from URL");
        factory(url)
    }

    /// Parses `url` and builds its transport.
    pub fn create_from_str(&self, url: &str) -> MailerResult<Arc<dyn Transport>> {
        self.create(&EmailUrl::parse(url)?)
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

/// Builds a transport from a URL using the built-in schemes.
pub fn create_transport_from_url(url: &str) -> MailerResult<Arc<dyn Transport>> {
    TransportRegistry::with_defaults().create_from_str(url)
}
