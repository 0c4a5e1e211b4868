//! The message draft and its MIME assembly.
//!
//! An [`Email`] accumulates recipients, bodies and attachments. [`Email::build`]
//! turns it into a wire-ready [`MimeMessage`]:
//! - text only or HTML only drafts become a single `text/*` entity
//! - text plus HTML become `multipart/alternative`
//! - inline parts wrap the HTML body in `multipart/related`
//! - raw extra parts and regular attachments follow the body inside
//!   `multipart/mixed`, so clients previewing the first part show text

mod template;

pub use template::EmailTemplate;

use std::path::Path;

use chrono::{DateTime, FixedOffset, Local};
use tracing::{debug, warn};

use crate::errors::{MailerError, MailerErrorKind, MailerResult};
use crate::mime::{
    format_date, format_param, make_message_id, message_id_domain, random_token, Headers,
    MimeMessage,
};
use crate::types::{guess_content_type, Address, AddressList, Attachment, AttachmentBody, IntoAddresses};

/// Default charset of text and HTML bodies.
pub const DEFAULT_CHARSET: &str = "utf-8";

/// Mutable message draft.
#[derive(Debug, Clone)]
pub struct Email {
    /// Primary recipients.
    pub to: AddressList,
    /// Carbon-copy recipients.
    pub cc: AddressList,
    /// Blind carbon-copy recipients.
    pub bcc: AddressList,
    /// Reply-To addresses.
    pub reply_to: AddressList,
    /// Author addresses (the `From` header).
    pub from_address: AddressList,
    /// Agent responsible for transmission (the `Sender` header).
    pub sender: Option<Address>,
    /// Bounce address.
    pub return_path: Option<String>,
    /// Subject line.
    pub subject: Option<String>,
    /// Plain text body.
    pub text: Option<String>,
    /// Charset of the text body.
    pub text_charset: String,
    /// HTML body.
    pub html: Option<String>,
    /// Charset of the HTML body.
    pub html_charset: String,
    /// Message id, generated on first build when unset.
    pub message_id: Option<String>,
    /// Origination date.
    pub date: DateTime<FixedOffset>,
    /// Boundary of the outermost multipart container.
    pub boundary: Option<String>,
    /// Templates rendered by a template plugin before build.
    pub template: Option<EmailTemplate>,
    headers: Vec<(String, String)>,
    attachments: Vec<Attachment>,
}

impl Default for Email {
    fn default() -> Self {
        Self {
            to: AddressList::new(),
            cc: AddressList::new(),
            bcc: AddressList::new(),
            reply_to: AddressList::new(),
            from_address: AddressList::new(),
            sender: None,
            return_path: None,
            subject: None,
            text: None,
            text_charset: DEFAULT_CHARSET.to_string(),
            html: None,
            html_charset: DEFAULT_CHARSET.to_string(),
            message_id: None,
            date: Local::now().into(),
            boundary: None,
            template: None,
            headers: Vec::new(),
            attachments: Vec::new(),
        }
    }
}

impl Email {
    /// Creates an empty draft dated now.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the primary recipients.
    pub fn with_to(mut self, to: impl IntoAddresses) -> MailerResult<Self> {
        self.to.set(to)?;
        Ok(self)
    }

    /// Sets the carbon-copy recipients.
    pub fn with_cc(mut self, cc: impl IntoAddresses) -> MailerResult<Self> {
        self.cc.set(cc)?;
        Ok(self)
    }

    /// Sets the blind carbon-copy recipients.
    pub fn with_bcc(mut self, bcc: impl IntoAddresses) -> MailerResult<Self> {
        self.bcc.set(bcc)?;
        Ok(self)
    }

    /// Sets the Reply-To addresses.
    pub fn with_reply_to(mut self, reply_to: impl IntoAddresses) -> MailerResult<Self> {
        self.reply_to.set(reply_to)?;
        Ok(self)
    }

    /// Sets the author addresses.
    pub fn with_from(mut self, from: impl IntoAddresses) -> MailerResult<Self> {
        self.from_address.set(from)?;
        Ok(self)
    }

    /// Sets the `Sender` address.
    pub fn with_sender(mut self, sender: &str) -> MailerResult<Self> {
        self.sender = Some(Address::parse(sender)?);
        Ok(self)
    }

    /// Sets the bounce address.
    pub fn with_return_path(mut self, return_path: impl Into<String>) -> Self {
        self.return_path = Some(return_path.into());
        self
    }

    /// Sets the subject.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Sets the plain text body.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Sets the charset of the text body.
    pub fn with_text_charset(mut self, charset: impl Into<String>) -> Self {
        self.text_charset = charset.into();
        self
    }

    /// Sets the HTML body.
    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    /// Sets the charset of the HTML body.
    pub fn with_html_charset(mut self, charset: impl Into<String>) -> Self {
        self.html_charset = charset.into();
        self
    }

    /// Sets an explicit message id.
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Sets the origination date.
    pub fn with_date(mut self, date: DateTime<FixedOffset>) -> Self {
        self.date = date;
        self
    }

    /// Sets the boundary of the outermost container.
    pub fn with_boundary(mut self, boundary: impl Into<String>) -> Self {
        self.boundary = Some(boundary.into());
        self
    }

    /// Adds or replaces an extra header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Attaches templates for a template plugin to render.
    pub fn with_template(mut self, template: EmailTemplate) -> Self {
        self.template = Some(template);
        self
    }

    /// Adds or replaces an extra header. Values are validated at build time.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name, value)),
        }
    }

    /// Extra headers in insertion order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Stored attachments, embeds and raw parts in insertion order.
    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    /// Stores a prepared attachment as-is.
    pub fn push_attachment(&mut self, attachment: Attachment) {
        self.attachments.push(attachment);
    }

    /// Adds a regular attachment. Text content is stored UTF-8 encoded.
    pub fn attach(
        &mut self,
        content: impl Into<AttachmentBody>,
        name: Option<&str>,
        content_type: Option<&str>,
    ) {
        let body = match content.into() {
            AttachmentBody::Text(text) => AttachmentBody::Bytes(text.into_bytes()),
            bytes => bytes,
        };
        self.attachments.push(Attachment::new(body, name, content_type));
    }

    /// Adds an inline part, referenced from the HTML body by `cid:`.
    pub fn embed(
        &mut self,
        content: impl Into<AttachmentBody>,
        name: Option<&str>,
        content_type: Option<&str>,
    ) {
        self.attachments
            .push(Attachment::new(content, name, content_type).inline());
    }

    /// Reads a file and adds it as a regular attachment.
    pub async fn attach_from_path(
        &mut self,
        path: impl AsRef<Path>,
        name: Option<&str>,
        content_type: Option<&str>,
    ) -> MailerResult<()> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await.map_err(|e| read_error(path, e))?;
        let (name, content_type) = describe_path(path, name, content_type);
        self.attach(data, Some(&name), Some(&content_type));
        Ok(())
    }

    /// Blocking variant of [`Email::attach_from_path`].
    pub fn attach_from_path_blocking(
        &mut self,
        path: impl AsRef<Path>,
        name: Option<&str>,
        content_type: Option<&str>,
    ) -> MailerResult<()> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| read_error(path, e))?;
        let (name, content_type) = describe_path(path, name, content_type);
        self.attach(data, Some(&name), Some(&content_type));
        Ok(())
    }

    /// Reads a file and adds it as an inline part.
    pub async fn embed_from_path(
        &mut self,
        path: impl AsRef<Path>,
        name: Option<&str>,
        content_type: Option<&str>,
    ) -> MailerResult<()> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await.map_err(|e| read_error(path, e))?;
        let (name, content_type) = describe_path(path, name, content_type);
        self.embed(data, Some(&name), Some(&content_type));
        Ok(())
    }

    /// Blocking variant of [`Email::embed_from_path`].
    pub fn embed_from_path_blocking(
        &mut self,
        path: impl AsRef<Path>,
        name: Option<&str>,
        content_type: Option<&str>,
    ) -> MailerResult<()> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| read_error(path, e))?;
        let (name, content_type) = describe_path(path, name, content_type);
        self.embed(data, Some(&name), Some(&content_type));
        Ok(())
    }

    /// Stores a pre-built part that is attached verbatim.
    pub fn attach_part(&mut self, part: MimeMessage) {
        self.attachments.push(Attachment::from_part(part));
    }

    /// Returns true if the draft has a `From` or `Sender`.
    pub fn has_sender(&self) -> bool {
        !self.from_address.is_empty() || self.sender.is_some()
    }

    fn has_text(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.is_empty())
    }

    fn has_html(&self) -> bool {
        self.html.as_deref().is_some_and(|h| !h.is_empty())
    }

    /// Checks that the draft carries content.
    pub fn validate(&self) -> MailerResult<()> {
        if !self.has_text() && !self.has_html() && self.attachments.is_empty() {
            return Err(MailerError::new(
                MailerErrorKind::EmptyBody,
                "Email message must have a text, or HTML part or attachments.",
            ));
        }
        Ok(())
    }

    /// Assembles the wire message.
    ///
    /// The only mutation is backfilling `message_id` when it is unset.
    /// Inline attachments need an HTML body to be wrapped with it in
    /// `multipart/related`; without one they go into the outer
    /// `multipart/mixed` container as inline parts.
    pub fn build(&mut self) -> MailerResult<MimeMessage> {
        self.validate()?;

        if self.message_id.is_none() {
            self.message_id = Some(make_message_id(self.message_domain()));
        }
        let message_id = self.message_id.clone().unwrap_or_default();
        let domain = message_id_domain(&message_id).to_string();

        let envelope = self.envelope_headers(&message_id)?;

        let inline: Vec<&Attachment> = self
            .attachments
            .iter()
            .filter(|a| a.inline && a.part.is_none())
            .collect();
        let regular: Vec<&Attachment> = self
            .attachments
            .iter()
            .filter(|a| !a.inline && a.part.is_none())
            .collect();
        let extra: Vec<&MimeMessage> = self
            .attachments
            .iter()
            .filter_map(|a| a.part.as_ref())
            .collect();

        let has_text = self.has_text();
        let has_html = self.has_html();
        let no_attachments = inline.is_empty() && regular.is_empty();

        if has_text && !has_html && no_attachments {
            warn_dropped(extra.len());
            let text = self.text.as_deref().unwrap_or_default();
            return MimeMessage::text("plain", text, &self.text_charset)?.with_envelope(envelope);
        }

        if has_html && !has_text && no_attachments {
            warn_dropped(extra.len());
            let html = self.html.as_deref().unwrap_or_default();
            return MimeMessage::text("html", html, &self.html_charset)?.with_envelope(envelope);
        }

        let mut orphan_inline = Vec::new();
        let html_part = match self.html.as_deref().filter(|_| has_html) {
            Some(html) => {
                let html_part = MimeMessage::text("html", html, &self.html_charset)?;
                if inline.is_empty() {
                    Some(html_part)
                } else {
                    let mut related = MimeMessage::multipart("related", None)?;
                    related.push_part(html_part)?;
                    for attachment in &inline {
                        related.push_part(inline_part(attachment, &domain)?)?;
                    }
                    Some(related)
                }
            }
            None => {
                orphan_inline.extend(inline.iter().copied());
                None
            }
        };
        let text_part = match self.text.as_deref().filter(|_| has_text) {
            Some(text) => Some(MimeMessage::text("plain", text, &self.text_charset)?),
            None => None,
        };

        let body = match (text_part, html_part) {
            (Some(text), Some(html)) => {
                let mut alternative = MimeMessage::multipart("alternative", None)?;
                alternative.push_part(text)?;
                alternative.push_part(html)?;
                Some(alternative)
            }
            (text, html) => text.or(html),
        };

        let needs_mixed = !extra.is_empty() || !regular.is_empty() || !orphan_inline.is_empty();
        let message = match body {
            Some(body) if !needs_mixed => body,
            body => {
                let mut mixed = MimeMessage::multipart("mixed", None)?;
                if let Some(body) = body {
                    mixed.push_part(body)?;
                }
                for part in extra {
                    mixed.push_part(part.clone())?;
                }
                for attachment in orphan_inline {
                    mixed.push_part(inline_part(attachment, &domain)?)?;
                }
                for attachment in regular {
                    mixed.push_part(attachment_part(attachment)?)?;
                }
                mixed
            }
        };

        let message = match &self.boundary {
            Some(boundary) => with_boundary(message, boundary)?,
            None => message,
        };

        debug!(
            message_id = %message_id,
            inline = inline.len(),
            multipart = message.is_multipart(),
            "Built email message"
        );
        message.with_envelope(envelope)
    }

    /// Domain used to generate the message id: the sender's, else the first
    /// from address's. Parsed addresses always carry a domain.
    fn message_domain(&self) -> &str {
        self.sender
            .as_ref()
            .or_else(|| self.from_address.first())
            .map(Address::domain)
            .unwrap_or_default()
    }

    /// Header block in fixed order, extra headers last. Empty values are omitted.
    fn envelope_headers(&self, message_id: &str) -> MailerResult<Headers> {
        let mut entries: Vec<(String, String)> = vec![
            ("From".into(), self.from_address.to_string()),
            ("To".into(), self.to.to_string()),
            ("Cc".into(), self.cc.to_string()),
            ("Bcc".into(), self.bcc.to_string()),
            ("Reply-To".into(), self.reply_to.to_string()),
            ("Return-Path".into(), self.return_path.clone().unwrap_or_default()),
            (
                "Sender".into(),
                self.sender.as_ref().map(Address::to_header).unwrap_or_default(),
            ),
            ("Message-ID".into(), message_id.to_string()),
            ("Date".into(), format_date(&self.date)),
            ("Subject".into(), self.subject.clone().unwrap_or_default()),
        ];

        for (name, value) in &self.headers {
            match entries
                .iter_mut()
                .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            {
                Some(entry) => entry.1 = value.clone(),
                None => entries.push((name.clone(), value.clone())),
            }
        }

        let mut headers = Headers::new();
        for (name, value) in entries {
            if value.is_empty() {
                continue;
            }
            headers.append(&name, value)?;
        }
        Ok(headers)
    }
}

/// Builds an inline part carrying its content id.
fn inline_part(attachment: &Attachment, domain: &str) -> MailerResult<MimeMessage> {
    let (main_type, sub_type) = attachment.mime_type_parts();
    let cid = attachment
        .content_id
        .clone()
        .or_else(|| attachment.name.clone())
        .unwrap_or_else(|| format!("{}@{}", random_token(16), domain));

    let mut part = match &attachment.body {
        AttachmentBody::Text(text) => {
            let subtype = if sub_type == "html" || sub_type == "plain" {
                sub_type.as_str()
            } else {
                "plain"
            };
            MimeMessage::text(subtype, text, DEFAULT_CHARSET)?
        }
        AttachmentBody::Bytes(bytes) => MimeMessage::binary(&main_type, &sub_type, bytes.clone())?,
    };

    part.set_header("Content-Disposition", disposition("inline", attachment.name.as_deref()))?;
    part.set_header("Content-ID", format!("<{}>", cid))?;
    part.set_header("X-Attachment-ID", cid)?;
    for (name, value) in &attachment.headers {
        part.append_header(name, value.clone())?;
    }
    Ok(part)
}

/// Builds an attachment-disposition part.
fn attachment_part(attachment: &Attachment) -> MailerResult<MimeMessage> {
    let (main_type, sub_type) = attachment.mime_type_parts();
    let mut part = match &attachment.body {
        AttachmentBody::Text(text) if main_type == "text" => {
            MimeMessage::text(&sub_type, text, DEFAULT_CHARSET)?
        }
        body => MimeMessage::binary(&main_type, &sub_type, body.as_bytes().to_vec())?,
    };

    part.set_header(
        "Content-Disposition",
        disposition("attachment", attachment.name.as_deref()),
    )?;
    for (name, value) in &attachment.headers {
        part.append_header(name, value.clone())?;
    }
    Ok(part)
}

fn disposition(kind: &str, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("{}; {}", kind, format_param("filename", name)),
        None => kind.to_string(),
    }
}

/// Rebuilds a container with an explicit boundary.
fn with_boundary(message: MimeMessage, boundary: &str) -> MailerResult<MimeMessage> {
    if !message.is_multipart() {
        return Ok(message);
    }
    let subtype = message.content_type().subtype().as_str().to_string();
    let mut rebuilt = MimeMessage::multipart(&subtype, Some(boundary))?;
    for part in message.parts() {
        rebuilt.push_part(part.clone())?;
    }
    Ok(rebuilt)
}

fn warn_dropped(count: usize) {
    if count > 0 {
        warn!(
            dropped = count,
            "Single-part message ignores raw parts added with attach_part"
        );
    }
}

fn describe_path(path: &Path, name: Option<&str>, content_type: Option<&str>) -> (String, String) {
    let name = name.map(str::to_string).unwrap_or_else(|| {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    let content_type = content_type
        .map(str::to_string)
        .unwrap_or_else(|| guess_content_type(path));
    (name, content_type)
}

fn read_error(path: &Path, err: std::io::Error) -> MailerError {
    MailerError::new(
        MailerErrorKind::Io,
        format!("Failed to read {}: {}", path.display(), err),
    )
    .with_cause(err)
}
