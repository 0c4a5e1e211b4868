//! Core value types.
//!
//! This module provides:
//! - [`Address`]: a parsed mailbox with an optional display name
//! - [`AddressList`]: an ordered, normalized list of addresses with an
//!   explicit `set`/`add`/`clear` API
//! - [`IntoAddresses`]: the input shapes accepted wherever addresses are given
//! - [`Attachment`]: one body part of a draft message

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;

use crate::errors::{MailerError, MailerResult};
use crate::mime::MimeMessage;

/// Default media type for parts whose type is unknown.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Email address with optional display name.
///
/// Two addresses are equal when their rendered forms are equal.
#[derive(Debug, Clone)]
pub struct Address {
    name: Option<String>,
    email: String,
}

impl Address {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> MailerResult<Self> {
        let email = email.into();
        Self::validate_email(&email)?;
        Ok(Self { name: None, email })
    }

    /// Creates a new address with display name and email.
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> MailerResult<Self> {
        let email = email.into();
        Self::validate_email(&email)?;
        let name = name.into();
        Ok(Self {
            name: if name.is_empty() { None } else { Some(name) },
            email,
        })
    }

    /// Parses an address from `"Display Name <addr>"` or bare `"addr"`.
    pub fn parse(s: &str) -> MailerResult<Self> {
        let s = s.trim();

        if let Some(start) = s.find('<') {
            let end = s.rfind('>').filter(|end| *end > start).ok_or_else(|| {
                MailerError::bad_address(format!("Unterminated angle address: {:?}", s))
            })?;
            let name = s[..start].trim().trim_matches('"');
            let email = s[start + 1..end].trim();
            return Self::with_name(name, email);
        }

        Self::new(s)
    }

    /// Validates the structure of an address spec.
    ///
    /// Line breaks are not rejected here: they are caught when the address is
    /// written into a header.
    fn validate_email(email: &str) -> MailerResult<()> {
        if email.is_empty() {
            return Err(MailerError::bad_address("Email address cannot be empty"));
        }

        if email.len() > 254 {
            return Err(MailerError::bad_address(
                "Email address too long (max 254 characters)",
            ));
        }

        let (local, domain) = match email.split_once('@') {
            Some((local, domain)) if !domain.contains('@') => (local, domain),
            _ => {
                return Err(MailerError::bad_address(format!(
                    "Email address must contain exactly one @: {:?}",
                    email
                )))
            }
        };

        if local.is_empty() || local.len() > 64 {
            return Err(MailerError::bad_address(format!(
                "Local part must be 1-64 characters: {:?}",
                email
            )));
        }

        if domain.is_empty() {
            return Err(MailerError::bad_address(format!(
                "Domain cannot be empty: {:?}",
                email
            )));
        }

        Ok(())
    }

    /// Returns the address spec (`local@domain`).
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Returns the display name if present.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the part before the `@`.
    pub fn local_part(&self) -> &str {
        self.email.split_once('@').map(|(l, _)| l).unwrap_or(&self.email)
    }

    /// Returns the part after the `@`.
    pub fn domain(&self) -> &str {
        self.email.split_once('@').map(|(_, d)| d).unwrap_or("")
    }

    /// Formats the address for SMTP MAIL FROM/RCPT TO commands.
    pub fn to_smtp(&self) -> String {
        format!("<{}>", self.email)
    }

    /// Formats the address for email headers.
    pub fn to_header(&self) -> String {
        match &self.name {
            Some(name) => {
                if name.contains(|c: char| !c.is_alphanumeric() && c != ' ') {
                    let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
                    format!("\"{}\" <{}>", escaped, self.email)
                } else {
                    format!("{} <{}>", name, self.email)
                }
            }
            None => self.email.clone(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_header())
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.to_header() == other.to_header()
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_header().hash(state);
    }
}

impl TryFrom<&str> for Address {
    type Error = MailerError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Address::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = MailerError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Address::parse(&s)
    }
}

/// Input shapes that normalize into a list of addresses.
///
/// Implemented for single strings and addresses, collections of them, and
/// `Option` (where `None` is the empty list).
pub trait IntoAddresses {
    /// Parses the input into addresses, in order.
    fn into_addresses(self) -> MailerResult<Vec<Address>>;
}

impl IntoAddresses for &str {
    fn into_addresses(self) -> MailerResult<Vec<Address>> {
        Ok(vec![Address::parse(self)?])
    }
}

impl IntoAddresses for String {
    fn into_addresses(self) -> MailerResult<Vec<Address>> {
        self.as_str().into_addresses()
    }
}

impl IntoAddresses for &String {
    fn into_addresses(self) -> MailerResult<Vec<Address>> {
        self.as_str().into_addresses()
    }
}

impl IntoAddresses for Address {
    fn into_addresses(self) -> MailerResult<Vec<Address>> {
        Ok(vec![self])
    }
}

impl IntoAddresses for &Address {
    fn into_addresses(self) -> MailerResult<Vec<Address>> {
        Ok(vec![self.clone()])
    }
}

impl IntoAddresses for &AddressList {
    fn into_addresses(self) -> MailerResult<Vec<Address>> {
        Ok(self.addresses.clone())
    }
}

impl<T: IntoAddresses> IntoAddresses for Vec<T> {
    fn into_addresses(self) -> MailerResult<Vec<Address>> {
        let mut out = Vec::with_capacity(self.len());
        for item in self {
            out.extend(item.into_addresses()?);
        }
        Ok(out)
    }
}

impl<T: IntoAddresses, const N: usize> IntoAddresses for [T; N] {
    fn into_addresses(self) -> MailerResult<Vec<Address>> {
        Vec::from(self).into_addresses()
    }
}

impl<T: IntoAddresses + Clone> IntoAddresses for &[T] {
    fn into_addresses(self) -> MailerResult<Vec<Address>> {
        self.to_vec().into_addresses()
    }
}

impl<T: IntoAddresses> IntoAddresses for Option<T> {
    fn into_addresses(self) -> MailerResult<Vec<Address>> {
        match self {
            Some(inner) => inner.into_addresses(),
            None => Ok(Vec::new()),
        }
    }
}

/// Ordered list of addresses bound to one header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressList {
    addresses: Vec<Address>,
}

impl AddressList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a list from any accepted input shape.
    pub fn from_input(input: impl IntoAddresses) -> MailerResult<Self> {
        Ok(Self {
            addresses: input.into_addresses()?,
        })
    }

    /// Replaces the contents. On a parse failure the list is left unchanged.
    pub fn set(&mut self, input: impl IntoAddresses) -> MailerResult<()> {
        self.addresses = input.into_addresses()?;
        Ok(())
    }

    /// Appends addresses, preserving prior order.
    pub fn add(&mut self, input: impl IntoAddresses) -> MailerResult<()> {
        let parsed = input.into_addresses()?;
        self.addresses.extend(parsed);
        Ok(())
    }

    /// Empties the list.
    pub fn clear(&mut self) {
        self.addresses.clear();
    }

    /// Returns the first address.
    pub fn first(&self) -> Option<&Address> {
        self.addresses.first()
    }

    /// Returns true if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Number of addresses.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Iterates over the addresses in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Address> {
        self.addresses.iter()
    }
}

impl fmt::Display for AddressList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.addresses.iter().map(Address::to_header).collect();
        write!(f, "{}", rendered.join(", "))
    }
}

impl PartialEq<str> for AddressList {
    fn eq(&self, other: &str) -> bool {
        self.to_string() == other
    }
}

impl PartialEq<&str> for AddressList {
    fn eq(&self, other: &&str) -> bool {
        self.to_string() == *other
    }
}

impl<'a> IntoIterator for &'a AddressList {
    type Item = &'a Address;
    type IntoIter = std::slice::Iter<'a, Address>;

    fn into_iter(self) -> Self::IntoIter {
        self.addresses.iter()
    }
}

/// Payload of an attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentBody {
    /// Text payload, emitted as a `text/*` part.
    Text(String),
    /// Binary payload, emitted base64-encoded.
    Bytes(Vec<u8>),
}

impl AttachmentBody {
    /// Returns the payload bytes (UTF-8 for text).
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AttachmentBody::Text(text) => text.as_bytes(),
            AttachmentBody::Bytes(bytes) => bytes,
        }
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<&str> for AttachmentBody {
    fn from(text: &str) -> Self {
        AttachmentBody::Text(text.to_string())
    }
}

impl From<String> for AttachmentBody {
    fn from(text: String) -> Self {
        AttachmentBody::Text(text)
    }
}

impl From<Vec<u8>> for AttachmentBody {
    fn from(bytes: Vec<u8>) -> Self {
        AttachmentBody::Bytes(bytes)
    }
}

impl From<&[u8]> for AttachmentBody {
    fn from(bytes: &[u8]) -> Self {
        AttachmentBody::Bytes(bytes.to_vec())
    }
}

/// One body part of a draft message.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Display filename.
    pub name: Option<String>,
    /// MIME content type.
    pub content_type: Option<String>,
    /// Payload.
    pub body: AttachmentBody,
    /// Rendered inline and referenced by content id.
    pub inline: bool,
    /// Explicit content id for inline parts.
    pub content_id: Option<String>,
    /// Extra headers written on the generated part.
    pub headers: Vec<(String, String)>,
    /// Pre-built part that bypasses body and type synthesis.
    pub part: Option<MimeMessage>,
}

impl Attachment {
    /// Creates an attachment. The content type is guessed from the name when omitted.
    pub fn new(
        body: impl Into<AttachmentBody>,
        name: Option<&str>,
        content_type: Option<&str>,
    ) -> Self {
        let content_type = content_type
            .map(str::to_string)
            .or_else(|| name.map(guess_content_type));
        Self {
            name: name.map(str::to_string),
            content_type,
            body: body.into(),
            inline: false,
            content_id: None,
            headers: Vec::new(),
            part: None,
        }
    }

    /// Wraps a pre-built part.
    pub fn from_part(part: MimeMessage) -> Self {
        Self {
            name: None,
            content_type: None,
            body: AttachmentBody::Bytes(Vec::new()),
            inline: false,
            content_id: None,
            headers: Vec::new(),
            part: Some(part),
        }
    }

    /// Marks the attachment as inline.
    pub fn inline(mut self) -> Self {
        self.inline = true;
        self
    }

    /// Sets an explicit content id.
    pub fn with_content_id(mut self, cid: impl Into<String>) -> Self {
        self.content_id = Some(cid.into());
        self
    }

    /// Adds an extra header to the generated part.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns the main and sub media type, defaulting to `application/octet-stream`.
    pub fn mime_type_parts(&self) -> (String, String) {
        let parsed = self
            .content_type
            .as_deref()
            .and_then(|ct| ct.parse::<mime::Mime>().ok())
            .unwrap_or(mime::APPLICATION_OCTET_STREAM);
        (
            parsed.type_().as_str().to_string(),
            parsed.subtype().as_str().to_string(),
        )
    }
}

/// Guesses a media type from a file name.
pub fn guess_content_type(name: impl AsRef<Path>) -> String {
    mime_guess::from_path(name).first_or_octet_stream().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::MailerErrorKind;
    use rstest::rstest;

    #[test]
    fn test_address_parse() {
        let addr = Address::parse("test@example.com").unwrap();
        assert_eq!(addr.email(), "test@example.com");
        assert!(addr.name().is_none());

        let addr = Address::parse("John Doe <john@example.com>").unwrap();
        assert_eq!(addr.email(), "john@example.com");
        assert_eq!(addr.name(), Some("John Doe"));
        assert_eq!(addr.domain(), "example.com");
        assert_eq!(addr.local_part(), "john");

        let addr = Address::parse("\"John, Doe\" <john@example.com>").unwrap();
        assert_eq!(addr.name(), Some("John, Doe"));
        assert_eq!(addr.to_string(), "\"John, Doe\" <john@example.com>");
    }

    #[rstest]
    #[case("")]
    #[case("no-at-sign")]
    #[case("two@@signs.com")]
    #[case("@no-local.com")]
    #[case("no-domain@")]
    #[case("Name <open@example.com")]
    fn test_address_validation(#[case] input: &str) {
        let err = Address::parse(input).unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::BadAddress);
    }

    #[test]
    fn test_address_equality_by_rendering() {
        let a = Address::parse("Ann <ann@example.com>").unwrap();
        let b = Address::with_name("Ann", "ann@example.com").unwrap();
        let c = Address::parse("ann@example.com").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[rstest]
    #[case::single(AddressList::from_input("a@x.com").unwrap())]
    #[case::vec(AddressList::from_input(vec!["a@x.com"]).unwrap())]
    #[case::array(AddressList::from_input(["a@x.com"]).unwrap())]
    #[case::address(AddressList::from_input(Address::new("a@x.com").unwrap()).unwrap())]
    fn test_single_shape_invariance(#[case] list: AddressList) {
        assert_eq!(list, "a@x.com");
    }

    #[rstest]
    #[case::strings(AddressList::from_input(vec!["A <a@x.com>", "b@x.com"]).unwrap())]
    #[case::owned(AddressList::from_input(vec![String::from("A <a@x.com>"), String::from("b@x.com")]).unwrap())]
    #[case::parsed(AddressList::from_input(vec![
        Address::with_name("A", "a@x.com").unwrap(),
        Address::new("b@x.com").unwrap(),
    ]).unwrap())]
    fn test_multi_shape_invariance(#[case] list: AddressList) {
        assert_eq!(list.to_string(), "A <a@x.com>, b@x.com");
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_address_list_mutation() {
        let mut list = AddressList::new();
        assert!(list.is_empty());
        assert_eq!(list.to_string(), "");
        assert!(list.first().is_none());

        list.set("a@x.com").unwrap();
        list.add(vec!["b@x.com", "c@x.com"]).unwrap();
        assert_eq!(list, "a@x.com, b@x.com, c@x.com");
        assert_eq!(list.first().map(Address::email), Some("a@x.com"));

        list.set(["d@x.com"]).unwrap();
        assert_eq!(list, "d@x.com");

        assert!(list.set(vec!["e@x.com", "broken"]).is_err());
        assert_eq!(list, "d@x.com");

        list.add(None::<&str>).unwrap();
        assert_eq!(list.len(), 1);

        list.clear();
        assert!(list.is_empty());
    }

    #[test]
    fn test_attachment_guesses_type() {
        let attachment = Attachment::new(vec![1, 2, 3], Some("report.pdf"), None);
        assert_eq!(attachment.content_type.as_deref(), Some("application/pdf"));
        assert_eq!(
            attachment.mime_type_parts(),
            ("application".to_string(), "pdf".to_string())
        );
        assert!(!attachment.inline);

        let unnamed = Attachment::new("hello", None, None);
        assert_eq!(unnamed.body, AttachmentBody::Text("hello".into()));
        assert_eq!(
            unnamed.mime_type_parts(),
            ("application".to_string(), "octet-stream".to_string())
        );
        assert!(unnamed.inline().inline);
    }
}
