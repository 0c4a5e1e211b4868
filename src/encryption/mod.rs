//! Message encryption.
//!
//! The mailer runs its [`Encrypter`] after preprocessing and before signing,
//! so a configured signer covers the ciphertext actually transmitted.

use async_trait::async_trait;

use crate::errors::MailerResult;
use crate::mime::MimeMessage;

/// Wraps or replaces a finished wire message.
#[async_trait]
pub trait Encrypter: Send + Sync {
    /// Returns the encrypted message.
    async fn encrypt(&self, message: MimeMessage) -> MailerResult<MimeMessage>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{MailerError, MailerErrorKind};

    /// Replaces the body with an opaque `multipart/encrypted` envelope.
    struct Envelope;

    #[async_trait]
    impl Encrypter for Envelope {
        async fn encrypt(&self, message: MimeMessage) -> MailerResult<MimeMessage> {
            let mut encrypted = MimeMessage::multipart("encrypted", None)?;
            encrypted.push_part(MimeMessage::binary(
                "application",
                "octet-stream",
                message.body_bytes().into_iter().rev().collect(),
            )?)?;
            Ok(encrypted)
        }
    }

    struct Broken;

    #[async_trait]
    impl Encrypter for Broken {
        async fn encrypt(&self, _message: MimeMessage) -> MailerResult<MimeMessage> {
            Err(MailerError::new(MailerErrorKind::Encryption, "no recipient key"))
        }
    }

    #[tokio::test]
    async fn test_encrypter_object_safe() {
        let encrypters: Vec<Box<dyn Encrypter>> = vec![Box::new(Envelope), Box::new(Broken)];
        let message = MimeMessage::text("plain", "secret", "utf-8").unwrap();

        let encrypted = encrypters[0].encrypt(message.clone()).await.unwrap();
        assert_eq!(encrypted.content_type().subtype(), "encrypted");
        assert!(!encrypted.to_string().contains("secret"));

        let err = encrypters[1].encrypt(message).await.unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::Encryption);
    }
}
