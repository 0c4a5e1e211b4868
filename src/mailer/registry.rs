use std::collections::HashMap;
use std::sync::Arc;

use super::Mailer;
use crate::errors::{MailerError, MailerErrorKind, MailerResult};
use crate::message::Email;
use crate::transport::{SentMessages, TransportRegistry};
use crate::types::IntoAddresses;

/// Named mailers, owned by the caller.
///
/// Build one at startup and pass it where mail is sent; tests create their own.
#[derive(Debug)]
pub struct MailerRegistry {
    mailers: HashMap<String, Arc<Mailer>>,
    transports: TransportRegistry,
}

impl MailerRegistry {
    /// Creates an empty registry resolving URLs with the built-in schemes.
    pub fn new() -> Self {
        Self::with_transports(TransportRegistry::with_defaults())
    }

    /// Creates an empty registry resolving URLs with `transports`.
    pub fn with_transports(transports: TransportRegistry) -> Self {
        Self {
            mailers: HashMap::new(),
            transports,
        }
    }

    /// Registers `mailer` under `name`, returning the mailer it replaced.
    pub fn register(&mut self, name: impl Into<String>, mailer: Mailer) -> Option<Arc<Mailer>> {
        self.mailers.insert(name.into(), Arc::new(mailer))
    }

    /// Builds a single-transport mailer from `url` and registers it.
    pub fn register_url(&mut self, name: impl Into<String>, url: &str) -> MailerResult<()> {
        let transport = self.transports.create_from_str(url)?;
        let mailer = Mailer::builder().shared_transport(transport).build()?;
        self.register(name, mailer);
        Ok(())
    }

    /// Returns the mailer registered under `name`.
    pub fn get(&self, name: &str) -> MailerResult<Arc<Mailer>> {
        self.mailers.get(name).cloned().ok_or_else(|| {
            MailerError::new(
                MailerErrorKind::MailerNotRegistered,
                format!("Mailer with name \"{}\" not registered.", name),
            )
        })
    }

    /// Removes and returns the mailer registered under `name`.
    pub fn remove(&mut self, name: &str) -> Option<Arc<Mailer>> {
        self.mailers.remove(name)
    }

    /// Removes every mailer.
    pub fn clear(&mut self) {
        self.mailers.clear();
    }

    /// Returns true if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.mailers.contains_key(name)
    }

    /// Number of registered mailers.
    pub fn len(&self) -> usize {
        self.mailers.len()
    }

    /// Returns true if no mailer is registered.
    pub fn is_empty(&self) -> bool {
        self.mailers.is_empty()
    }

    /// Sets the recipients of `email` and sends it through the mailer `name`.
    pub async fn send_mail(
        &self,
        name: &str,
        to: impl IntoAddresses,
        mut email: Email,
    ) -> MailerResult<SentMessages> {
        let mailer = self.get(name)?;
        email.to.set(to)?;
        mailer.send(email).await
    }
}

impl Default for MailerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::test_email;
    use crate::transport::{InMemoryTransport, Transport};

    #[test]
    fn test_register_get_remove() {
        let mut registry = MailerRegistry::new();
        assert!(registry.is_empty());

        registry.register_url("default", "null://").unwrap();
        registry.register_url("audit", "memory://").unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("audit"));
        assert_eq!(registry.get("audit").unwrap().transports()[0].name(), "memory");

        assert!(registry.remove("audit").is_some());
        let err = registry.get("audit").unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::MailerNotRegistered);
        assert_eq!(err.message(), "Mailer with name \"audit\" not registered.");

        registry.clear();
        assert!(!registry.contains("default"));
    }

    #[test]
    fn test_register_url_rejects_unknown_scheme() {
        let mut registry = MailerRegistry::new();
        let err = registry.register_url("x", "fax://office").unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::UnregisteredTransport);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registries_are_isolated() {
        let mut first = MailerRegistry::new();
        let second = MailerRegistry::new();
        first.register("default", Mailer::new(InMemoryTransport::new()));
        assert!(!second.contains("default"));
    }

    #[tokio::test]
    async fn test_send_mail_overrides_recipients() {
        let memory = InMemoryTransport::new();
        let mut registry = MailerRegistry::new();
        registry.register("default", Mailer::new(memory.clone()));

        registry
            .send_mail("default", "override@example.com", test_email().unwrap())
            .await
            .unwrap();
        assert_eq!(
            memory.mailbox().last().unwrap().header("To"),
            Some("override@example.com")
        );

        let err = registry
            .send_mail("missing", "a@x.com", test_email().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::MailerNotRegistered);
    }
}
