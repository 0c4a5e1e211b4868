//! Wire-ready MIME messages.
//!
//! A [`MimeMessage`] is a recursive tree of ordered headers and either a
//! single body or a list of child parts. It is what `Email::build()` produces
//! and what preprocessors, signers, encrypters and transports consume.
//!
//! Header values are validated on insertion: a value containing CR or LF is
//! rejected with a `HeaderInjection` error, so no caller-supplied string can
//! smuggle extra header lines into the serialized message.

mod encoding;

pub use encoding::{
    decode_charset, encode_charset, encode_header_value, fold_header, format_date, format_param, make_boundary,
    make_message_id, message_id_domain, normalize_line_endings, prepare_data_content,
    random_token, TransferEncoding,
};

use std::borrow::Cow;
use std::fmt;

use crate::errors::{MailerError, MailerResult};

/// Ordered list of message headers with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the first value of the named header.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns every value of the named header, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns true if the named header is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces the first occurrence of the header, or appends it.
    /// Later occurrences of the same name are removed.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> MailerResult<()> {
        let value = value.into();
        validate_header(name, &value)?;

        match self.entries.iter().position(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(index) => {
                self.entries[index].1 = value;
                let mut seen = 0usize;
                self.entries.retain(|(n, _)| {
                    if n.eq_ignore_ascii_case(name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.entries.push((name.to_string(), value)),
        }
        Ok(())
    }

    /// Appends a header, keeping existing ones with the same name.
    pub fn append(&mut self, name: &str, value: impl Into<String>) -> MailerResult<()> {
        let value = value.into();
        validate_header(name, &value)?;
        self.entries.push((name.to_string(), value));
        Ok(())
    }

    /// Inserts a header before all others.
    pub fn prepend(&mut self, name: &str, value: impl Into<String>) -> MailerResult<()> {
        let value = value.into();
        validate_header(name, &value)?;
        self.entries.insert(0, (name.to_string(), value));
        Ok(())
    }

    /// Removes every occurrence of the named header. Returns how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    /// Iterates over `(name, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of header lines.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no headers.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends all headers of `other` after these.
    fn extend(&mut self, other: Headers) {
        self.entries.extend(other.entries);
    }

    /// Serializes the headers as folded, RFC 2047 encoded lines.
    pub fn write_to(&self, output: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            let line = format!("{}: {}", name, encode_header_value(value));
            output.extend_from_slice(fold_header(&line).as_bytes());
            output.extend_from_slice(b"\r\n");
        }
    }
}

/// Validates a header name and value.
fn validate_header(name: &str, value: &str) -> MailerResult<()> {
    if name.is_empty() || name.bytes().any(|b| !(33..=126).contains(&b) || b == b':') {
        return Err(MailerError::header_injection(format!(
            "Invalid header name: {:?}",
            name
        )));
    }
    if value.contains(|c: char| c == '\r' || c == '\n') {
        return Err(MailerError::header_injection(format!(
            "Header values may not contain line breaks (got {:?} for {})",
            value, name
        )));
    }
    Ok(())
}

fn validate_boundary(boundary: &str) -> MailerResult<()> {
    const SPECIALS: &[u8] = b"'()+_,-./:=? ";
    let valid = (1..=70).contains(&boundary.len())
        && !boundary.ends_with(' ')
        && boundary
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || SPECIALS.contains(&b));
    if valid {
        Ok(())
    } else {
        Err(MailerError::configuration(format!(
            "Invalid multipart boundary: {:?}",
            boundary
        )))
    }
}

/// Body of a MIME entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MimeBody {
    /// Leaf body: raw (decoded) bytes plus the encoding used on the wire.
    Single {
        /// Decoded payload.
        data: Vec<u8>,
        /// Transfer encoding applied on serialization.
        encoding: TransferEncoding,
    },
    /// Container body.
    Multipart {
        /// Boundary delimiter.
        boundary: String,
        /// Child parts in order.
        parts: Vec<MimeMessage>,
    },
}

/// A MIME entity: headers plus body. The top-level entity is the wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeMessage {
    headers: Headers,
    body: MimeBody,
}

impl MimeMessage {
    /// Creates a `text/<subtype>` part with `content` encoded in `charset`.
    pub fn text(subtype: &str, content: &str, charset: &str) -> MailerResult<Self> {
        let data = encode_charset(content, charset)?.into_owned();
        let encoding = TransferEncoding::for_bytes(&data);
        let mut headers = Headers::new();
        headers.set(
            "Content-Type",
            format!("text/{}; {}", subtype, format_param("charset", charset)),
        )?;
        headers.set("Content-Transfer-Encoding", encoding.header_value())?;
        Ok(Self {
            headers,
            body: MimeBody::Single { data, encoding },
        })
    }

    /// Creates a base64-encoded part of the given media type.
    pub fn binary(main_type: &str, sub_type: &str, data: Vec<u8>) -> MailerResult<Self> {
        let mut headers = Headers::new();
        headers.set("Content-Type", format!("{}/{}", main_type, sub_type))?;
        headers.set(
            "Content-Transfer-Encoding",
            TransferEncoding::Base64.header_value(),
        )?;
        Ok(Self {
            headers,
            body: MimeBody::Single {
                data,
                encoding: TransferEncoding::Base64,
            },
        })
    }

    /// Creates an empty `multipart/<subtype>` container.
    ///
    /// An explicit boundary must be 1 to 70 RFC 2046 boundary characters and
    /// must not end in a space.
    pub fn multipart(subtype: &str, boundary: Option<&str>) -> MailerResult<Self> {
        let boundary = match boundary {
            Some(boundary) => {
                validate_boundary(boundary)?;
                boundary.to_string()
            }
            None => make_boundary(),
        };
        let mut headers = Headers::new();
        headers.set(
            "Content-Type",
            format!("multipart/{}; {}", subtype, format_param("boundary", &boundary)),
        )?;
        Ok(Self {
            headers,
            body: MimeBody::Multipart {
                boundary,
                parts: Vec::new(),
            },
        })
    }

    /// Creates an entity from raw parts.
    pub fn from_parts(headers: Headers, body: MimeBody) -> Self {
        Self { headers, body }
    }

    /// Places `envelope` headers before this entity's content headers and marks it
    /// as a top-level MIME message.
    pub fn with_envelope(self, envelope: Headers) -> MailerResult<Self> {
        let mut headers = envelope;
        headers.set("MIME-Version", "1.0")?;
        headers.extend(self.headers);
        Ok(Self {
            headers,
            body: self.body,
        })
    }

    /// Appends a child part. Fails on single-part entities.
    pub fn push_part(&mut self, part: MimeMessage) -> MailerResult<()> {
        match &mut self.body {
            MimeBody::Multipart { parts, .. } => {
                parts.push(part);
                Ok(())
            }
            MimeBody::Single { .. } => Err(MailerError::configuration(
                "Cannot add a part to a single-part entity",
            )),
        }
    }

    /// Returns the headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the first value of a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Replaces or adds a header.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) -> MailerResult<()> {
        self.headers.set(name, value)
    }

    /// Appends a header.
    pub fn append_header(&mut self, name: &str, value: impl Into<String>) -> MailerResult<()> {
        self.headers.append(name, value)
    }

    /// Inserts a header at the top of the header block.
    pub fn prepend_header(&mut self, name: &str, value: impl Into<String>) -> MailerResult<()> {
        self.headers.prepend(name, value)
    }

    /// Removes a header. Returns how many lines were removed.
    pub fn remove_header(&mut self, name: &str) -> usize {
        self.headers.remove(name)
    }

    /// Parsed media type. Entities without a Content-Type are `text/plain`.
    pub fn content_type(&self) -> mime::Mime {
        self.header("Content-Type")
            .and_then(|value| value.parse::<mime::Mime>().ok())
            .unwrap_or(mime::TEXT_PLAIN)
    }

    /// Returns true for container entities.
    pub fn is_multipart(&self) -> bool {
        matches!(self.body, MimeBody::Multipart { .. })
    }

    /// Returns the body.
    pub fn body(&self) -> &MimeBody {
        &self.body
    }

    /// Child parts (empty for single-part entities).
    pub fn parts(&self) -> &[MimeMessage] {
        match &self.body {
            MimeBody::Multipart { parts, .. } => parts,
            MimeBody::Single { .. } => &[],
        }
    }

    /// Mutable child parts (empty for single-part entities).
    pub fn parts_mut(&mut self) -> &mut [MimeMessage] {
        match &mut self.body {
            MimeBody::Multipart { parts, .. } => parts,
            MimeBody::Single { .. } => &mut [],
        }
    }

    /// Decoded payload of a single-part entity.
    pub fn payload_bytes(&self) -> Option<&[u8]> {
        match &self.body {
            MimeBody::Single { data, .. } => Some(data),
            MimeBody::Multipart { .. } => None,
        }
    }

    /// Charset declared in `Content-Type`, `utf-8` when absent.
    pub fn charset(&self) -> String {
        self.content_type()
            .get_param(mime::CHARSET)
            .map(|charset| charset.as_str().to_string())
            .unwrap_or_else(|| "utf-8".to_string())
    }

    /// Payload decoded from the declared charset.
    pub fn payload_text(&self) -> Option<Cow<'_, str>> {
        let charset = self.charset();
        self.payload_bytes().and_then(|data| decode_charset(data, &charset))
    }

    /// Replaces the payload of a single-part entity with `content` in the
    /// declared charset, re-selecting its transfer encoding.
    pub fn set_text_payload(&mut self, content: &str) -> MailerResult<()> {
        let bytes = encode_charset(content, &self.charset())?.into_owned();
        match &mut self.body {
            MimeBody::Single { data, encoding } => {
                *encoding = TransferEncoding::for_bytes(&bytes);
                *data = bytes;
                let value = encoding.header_value();
                self.headers.set("Content-Transfer-Encoding", value)
            }
            MimeBody::Multipart { .. } => Err(MailerError::configuration(
                "Cannot set a text payload on a multipart entity",
            )),
        }
    }

    /// Every entity in the tree, depth-first, starting with this one.
    pub fn walk(&self) -> Vec<&MimeMessage> {
        let mut out = vec![self];
        for part in self.parts() {
            out.extend(part.walk());
        }
        out
    }

    /// Serializes the body only (everything after the blank line).
    pub fn body_bytes(&self) -> Vec<u8> {
        let mut output = Vec::new();
        self.write_body(&mut output);
        output
    }

    /// Serializes the entity to RFC 5322 bytes with CRLF line endings.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut output = Vec::new();
        self.write_to(&mut output);
        output
    }

    fn write_to(&self, output: &mut Vec<u8>) {
        self.headers.write_to(output);
        output.extend_from_slice(b"\r\n");
        self.write_body(output);
    }

    fn write_body(&self, output: &mut Vec<u8>) {
        match &self.body {
            MimeBody::Single { data, encoding } => {
                output.extend_from_slice(&encoding.encode(data));
            }
            MimeBody::Multipart { boundary, parts } => {
                for part in parts {
                    output.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
                    part.write_to(output);
                    if !output.ends_with(b"\r\n") {
                        output.extend_from_slice(b"\r\n");
                    }
                }
                output.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
            }
        }
    }
}

impl fmt::Display for MimeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.to_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::MailerErrorKind;

    #[test]
    fn test_header_injection_rejected() {
        let mut headers = Headers::new();
        let err = headers.set("Subject", "hi\r\nBcc: victim@example.com").unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::HeaderInjection);

        let err = headers.append("X-Bad: name", "value").unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::HeaderInjection);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_headers_case_insensitive_set() {
        let mut headers = Headers::new();
        headers.append("X-Tag", "one").unwrap();
        headers.append("x-tag", "two").unwrap();
        headers.set("X-TAG", "three").unwrap();

        assert_eq!(headers.get("x-tag"), Some("three"));
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.remove("X-Tag"), 1);
    }

    #[test]
    fn test_text_part() {
        let part = MimeMessage::text("plain", "Hello", "utf-8").unwrap();
        assert_eq!(part.content_type().essence_str(), "text/plain");
        assert_eq!(part.header("Content-Transfer-Encoding"), Some("7bit"));
        assert_eq!(part.payload_text().as_deref(), Some("Hello"));
        assert!(!part.is_multipart());
    }

    #[test]
    fn test_multipart_serialization() {
        let mut container = MimeMessage::multipart("alternative", Some("XYZ")).unwrap();
        container
            .push_part(MimeMessage::text("plain", "text", "utf-8").unwrap())
            .unwrap();
        container
            .push_part(MimeMessage::text("html", "<b>html</b>", "utf-8").unwrap())
            .unwrap();

        let wire = container.to_string();
        assert!(wire.starts_with("Content-Type: multipart/alternative; boundary=\"XYZ\"\r\n\r\n--XYZ\r\n"));
        assert!(wire.contains("\r\n--XYZ\r\nContent-Type: text/html"));
        assert!(wire.ends_with("--XYZ--\r\n"));
        assert_eq!(container.walk().len(), 3);
    }

    #[test]
    fn test_text_part_in_declared_charset() {
        let mut part = MimeMessage::text("plain", "café", "iso-8859-1").unwrap();
        assert_eq!(part.payload_bytes(), Some(&b"caf\xe9"[..]));
        assert_eq!(part.charset(), "iso-8859-1");
        assert_eq!(part.payload_text().as_deref(), Some("café"));
        assert!(part.to_string().contains("caf=E9"));

        part.set_text_payload("crème").unwrap();
        assert_eq!(part.payload_bytes(), Some(&b"cr\xe8me"[..]));
        assert!(part.set_text_payload("日本").is_err());

        assert!(MimeMessage::text("plain", "日本", "iso-8859-1").is_err());
    }

    #[rstest::rstest]
    #[case("simple")]
    #[case("=_Part_0.1'(x)+,-/:=?")]
    #[case("with inner space")]
    fn test_boundary_accepted(#[case] boundary: &str) {
        assert!(MimeMessage::multipart("mixed", Some(boundary)).is_ok());
    }

    #[rstest::rstest]
    #[case("")]
    #[case("a\"b")]
    #[case("trailing ")]
    #[case("semi;colon")]
    #[case("ünicode")]
    fn test_boundary_rejected(#[case] boundary: &str) {
        let err = MimeMessage::multipart("mixed", Some(boundary)).unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::ImproperlyConfigured);
        assert!(MimeMessage::multipart("mixed", Some(&"b".repeat(71))).is_err());
    }

    #[test]
    fn test_push_part_on_single_fails() {
        let mut part = MimeMessage::text("plain", "x", "utf-8").unwrap();
        let other = part.clone();
        assert!(part.push_part(other).is_err());
    }

    #[test]
    fn test_envelope_order() {
        let mut envelope = Headers::new();
        envelope.set("From", "a@example.com").unwrap();
        envelope.set("Subject", "Ünïcode").unwrap();
        let message = MimeMessage::text("plain", "body", "utf-8")
            .unwrap()
            .with_envelope(envelope)
            .unwrap();

        let names: Vec<&str> = message.headers().iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["From", "Subject", "MIME-Version", "Content-Type", "Content-Transfer-Encoding"]
        );
        assert_eq!(message.header("Subject"), Some("Ünïcode"));
        assert!(message.to_string().contains("Subject: =?UTF-8?B?"));
    }
}
