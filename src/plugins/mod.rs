//! Pipeline extension points.
//!
//! A [`Plugin`] sees the draft before it is built and the wire message around
//! dispatch. A [`Preprocessor`] rewrites the wire message after build and
//! before encryption and signing. Any `Fn(MimeMessage) -> MailerResult<MimeMessage>`
//! is a preprocessor, e.g. [`remove_html_comments`].

mod template;

pub use template::{SimpleTemplateEngine, TemplateEngine, TemplateRenderer};

use async_trait::async_trait;

use crate::errors::{MailerError, MailerResult};
use crate::message::Email;
use crate::mime::MimeMessage;
use crate::transport::SentMessages;

/// Hooks invoked by the mailer during a send.
///
/// Every hook defaults to a no-op. Errors returned by a hook abort the send.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Transforms the draft before it is built. Not called for pre-built messages.
    async fn process_email(&self, email: Email) -> MailerResult<Email> {
        Ok(email)
    }

    /// Called with the final wire message right before dispatch.
    async fn on_before_send(&self, _message: &MimeMessage) -> MailerResult<()> {
        Ok(())
    }

    /// Called after a transport delivered the message.
    async fn on_after_send(&self, _message: &MimeMessage, _sent: &SentMessages) -> MailerResult<()> {
        Ok(())
    }

    /// Called when no transport delivered the message.
    async fn on_send_error(&self, _message: &MimeMessage, _error: &MailerError) -> MailerResult<()> {
        Ok(())
    }
}

/// Rewrites a built wire message.
#[async_trait]
pub trait Preprocessor: Send + Sync {
    /// Returns the rewritten message.
    async fn process(&self, message: MimeMessage) -> MailerResult<MimeMessage>;
}

#[async_trait]
impl<F> Preprocessor for F
where
    F: Fn(MimeMessage) -> MailerResult<MimeMessage> + Send + Sync,
{
    async fn process(&self, message: MimeMessage) -> MailerResult<MimeMessage> {
        self(message)
    }
}

/// Strips `<!-- ... -->` comments from HTML bodies.
///
/// Descends into `multipart/alternative`, `multipart/mixed` and
/// `multipart/related` containers; HTML parts carrying a `Content-Disposition`
/// are attachments and stay untouched.
pub fn remove_html_comments(mut message: MimeMessage) -> MailerResult<MimeMessage> {
    strip_comments_in_place(&mut message)?;
    Ok(message)
}

fn strip_comments_in_place(entity: &mut MimeMessage) -> MailerResult<()> {
    let content_type = entity.content_type();
    match (content_type.type_().as_str(), content_type.subtype().as_str()) {
        ("text", "html") if entity.header("Content-Disposition").is_none() => {
            let stripped = match entity.payload_text() {
                Some(html) => {
                    let stripped = strip_comments(&html);
                    (stripped.len() != html.len()).then_some(stripped)
                }
                None => None,
            };
            if let Some(stripped) = stripped {
                entity.set_text_payload(&stripped)?;
            }
        }
        ("multipart", "alternative" | "mixed" | "related") => {
            for part in entity.parts_mut() {
                strip_comments_in_place(part)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn strip_comments(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(start) = rest.find("<!--") {
        out.push_str(&rest[..start]);
        match rest[start + 4..].find("-->") {
            Some(end) => rest = &rest[start + 4 + end + 3..],
            // Unterminated comment
            None => {
                rest = &rest[start..];
                break;
            }
        }
    }
    out.push_str(rest);
    out
}
