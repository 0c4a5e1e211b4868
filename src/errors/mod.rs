//! Error types for message building and delivery.
//!
//! Every failure surfaces as a [`MailerError`] carrying a [`MailerErrorKind`].
//! Kinds fall into three categories:
//! - validation failures, raised before any transport is touched
//! - delivery failures, raised by transports (potentially retryable by the caller)
//! - pipeline failures, raised by plugins, signers and encrypters

use std::fmt;
use thiserror::Error;

/// Result type for mailer operations.
pub type MailerResult<T> = Result<T, MailerError>;

/// Mailer error kinds categorizing different failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MailerErrorKind {
    // Validation errors
    /// An address could not be parsed.
    BadAddress,
    /// The message has no text, no HTML and no attachments.
    EmptyBody,
    /// A header name or value contains forbidden characters.
    HeaderInjection,
    /// The message domain could not be derived from the sender.
    MissingDomain,
    /// Neither the message nor the mailer provides a sender.
    MissingSender,
    /// No transport is bound to the URL scheme.
    UnregisteredTransport,
    /// A configuration URL could not be parsed.
    InvalidUrl,
    /// A component was constructed with invalid settings.
    ImproperlyConfigured,
    /// No mailer is registered under the requested name.
    MailerNotRegistered,

    // Delivery errors
    /// A single transport failed to deliver.
    DeliveryFailed,
    /// Every configured transport failed.
    MultiDeliveryFailed,
    /// The SMTP exchange failed.
    Smtp,
    /// A filesystem or stream operation failed.
    Io,

    // Pipeline errors
    /// A plugin or preprocessor failed.
    Plugin,
    /// Message signing failed.
    Signing,
    /// Message encryption failed.
    Encryption,
    /// Template rendering failed.
    Template,
}

/// Broad failure category of an error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller mistake, never retryable.
    Validation,
    /// Environment or transport failure.
    Delivery,
    /// Hook failure inside the send pipeline.
    Pipeline,
}

impl MailerErrorKind {
    /// Returns the category this kind belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            MailerErrorKind::BadAddress
            | MailerErrorKind::EmptyBody
            | MailerErrorKind::HeaderInjection
            | MailerErrorKind::MissingDomain
            | MailerErrorKind::MissingSender
            | MailerErrorKind::UnregisteredTransport
            | MailerErrorKind::InvalidUrl
            | MailerErrorKind::ImproperlyConfigured
            | MailerErrorKind::MailerNotRegistered => ErrorCategory::Validation,

            MailerErrorKind::DeliveryFailed
            | MailerErrorKind::MultiDeliveryFailed
            | MailerErrorKind::Smtp
            | MailerErrorKind::Io => ErrorCategory::Delivery,

            MailerErrorKind::Plugin
            | MailerErrorKind::Signing
            | MailerErrorKind::Encryption
            | MailerErrorKind::Template => ErrorCategory::Pipeline,
        }
    }

    /// Returns true if the caller may reasonably retry the operation.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Delivery
    }
}

impl fmt::Display for MailerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailerErrorKind::BadAddress => write!(f, "Bad address"),
            MailerErrorKind::EmptyBody => write!(f, "Empty body"),
            MailerErrorKind::HeaderInjection => write!(f, "Header injection"),
            MailerErrorKind::MissingDomain => write!(f, "Missing domain"),
            MailerErrorKind::MissingSender => write!(f, "Missing sender"),
            MailerErrorKind::UnregisteredTransport => write!(f, "Unregistered transport"),
            MailerErrorKind::InvalidUrl => write!(f, "Invalid URL"),
            MailerErrorKind::ImproperlyConfigured => write!(f, "Improperly configured"),
            MailerErrorKind::MailerNotRegistered => write!(f, "Mailer not registered"),
            MailerErrorKind::DeliveryFailed => write!(f, "Delivery failed"),
            MailerErrorKind::MultiDeliveryFailed => write!(f, "Multi delivery failed"),
            MailerErrorKind::Smtp => write!(f, "SMTP error"),
            MailerErrorKind::Io => write!(f, "I/O error"),
            MailerErrorKind::Plugin => write!(f, "Plugin error"),
            MailerErrorKind::Signing => write!(f, "Signing error"),
            MailerErrorKind::Encryption => write!(f, "Encryption error"),
            MailerErrorKind::Template => write!(f, "Template error"),
        }
    }
}

/// Mailer error with detailed information.
#[derive(Error, Debug)]
pub struct MailerError {
    kind: MailerErrorKind,
    message: String,
    /// SMTP reply code, when the failure came from a server reply.
    smtp_code: Option<u16>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Per-transport failures of an aggregate error, in attempt order.
    causes: Vec<MailerError>,
}

impl MailerError {
    /// Creates a new error.
    pub fn new(kind: MailerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            cause: None,
            causes: Vec::new(),
        }
    }

    /// Sets the SMTP reply code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Sets the per-transport failures of an aggregate error.
    pub fn with_causes(mut self, causes: Vec<MailerError>) -> Self {
        self.causes = causes;
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> MailerErrorKind {
        self.kind
    }

    /// Returns the category of the error kind.
    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP reply code if available.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns the per-transport failures of an aggregate error.
    pub fn causes(&self) -> &[MailerError] {
        &self.causes
    }

    /// Returns true if this is a validation error.
    pub fn is_validation(&self) -> bool {
        self.category() == ErrorCategory::Validation
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        if let Some(code) = self.smtp_code {
            return (400..500).contains(&code);
        }
        self.kind.is_retryable()
    }

    // Convenience constructors

    /// Creates a bad address error.
    pub fn bad_address(message: impl Into<String>) -> Self {
        Self::new(MailerErrorKind::BadAddress, message)
    }

    /// Creates a header injection error.
    pub fn header_injection(message: impl Into<String>) -> Self {
        Self::new(MailerErrorKind::HeaderInjection, message)
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(MailerErrorKind::ImproperlyConfigured, message)
    }

    /// Creates an SMTP protocol error.
    pub fn smtp(message: impl Into<String>) -> Self {
        Self::new(MailerErrorKind::Smtp, message)
    }

    /// Creates an error from an SMTP reply.
    pub fn from_smtp_response(code: u16, message: impl Into<String>) -> Self {
        Self::new(MailerErrorKind::Smtp, message).with_smtp_code(code)
    }

    /// Wraps a transport failure into a uniform delivery error.
    pub fn delivery(transport: &str, cause: MailerError) -> Self {
        Self::new(
            MailerErrorKind::DeliveryFailed,
            format!("Failed to deliver message via \"{}\": {}", transport, cause),
        )
        .with_cause(cause)
    }

    /// Creates the aggregate error raised when every transport failed.
    pub fn multi_delivery(causes: Vec<MailerError>) -> Self {
        Self::new(
            MailerErrorKind::MultiDeliveryFailed,
            "Failed to deliver message via configured mailers.",
        )
        .with_causes(causes)
    }
}

impl fmt::Display for MailerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        if !self.causes.is_empty() {
            write!(f, " ({} attempts failed)", self.causes.len())?;
        }
        Ok(())
    }
}

impl From<std::io::Error> for MailerError {
    fn from(err: std::io::Error) -> Self {
        MailerError::new(MailerErrorKind::Io, err.to_string()).with_cause(err)
    }
}

impl From<url::ParseError> for MailerError {
    fn from(err: url::ParseError) -> Self {
        MailerError::new(MailerErrorKind::InvalidUrl, err.to_string()).with_cause(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_kind_category() {
        assert_eq!(MailerErrorKind::EmptyBody.category(), ErrorCategory::Validation);
        assert_eq!(MailerErrorKind::Smtp.category(), ErrorCategory::Delivery);
        assert_eq!(MailerErrorKind::Signing.category(), ErrorCategory::Pipeline);
    }

    #[test]
    fn test_validation_never_retryable() {
        assert!(!MailerErrorKind::MissingSender.is_retryable());
        assert!(!MailerErrorKind::HeaderInjection.is_retryable());
        assert!(MailerErrorKind::Io.is_retryable());
        assert!(MailerError::bad_address("x").is_validation());
    }

    #[test]
    fn test_smtp_code_retryable() {
        assert!(MailerError::from_smtp_response(451, "try later").is_retryable());
        assert!(!MailerError::from_smtp_response(550, "no such user").is_retryable());
    }

    #[test]
    fn test_delivery_preserves_cause() {
        let err = MailerError::delivery("file", MailerError::from(std::io::Error::other("disk full")));
        assert_eq!(err.kind(), MailerErrorKind::DeliveryFailed);
        assert!(err.to_string().contains("disk full"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_multi_delivery_display() {
        let err = MailerError::multi_delivery(vec![
            MailerError::smtp("refused"),
            MailerError::smtp("timeout"),
        ]);
        assert_eq!(err.causes().len(), 2);
        assert_eq!(err.category(), ErrorCategory::Delivery);
        assert_eq!(err.causes()[0].category(), ErrorCategory::Delivery);
        assert_eq!(
            err.to_string(),
            "Multi delivery failed: Failed to deliver message via configured mailers. (2 attempts failed)"
        );
    }
}
