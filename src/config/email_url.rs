//! Connection-string URLs: `scheme://[user[:password]@]host[:port][/path][?opt=val&...]`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::errors::{MailerError, MailerErrorKind, MailerResult};

const PASSWORD_MASK: &str = "********";

/// A parsed transport URL.
///
/// Equality compares the original string form. `Debug` output masks the password.
#[derive(Clone)]
pub struct EmailUrl {
    raw: String,
    url: Url,
}

/// Editable components of an [`EmailUrl`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlParts {
    /// Scheme selecting the transport.
    pub transport: String,
    /// Decoded username.
    pub username: Option<String>,
    /// Decoded password.
    pub password: Option<String>,
    /// Host name.
    pub hostname: Option<String>,
    /// Port.
    pub port: Option<u16>,
    /// Path.
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query: Option<String>,
}

impl EmailUrl {
    /// Parses a URL.
    pub fn parse(input: &str) -> MailerResult<Self> {
        let url = Url::parse(input).map_err(|e| {
            MailerError::new(
                MailerErrorKind::InvalidUrl,
                format!("Invalid mailer URL {:?}: {}", mask_raw(input), e),
            )
            .with_cause(e)
        })?;
        Ok(Self {
            raw: input.to_string(),
            url,
        })
    }

    /// Builds a URL from components.
    pub fn from_parts(parts: &UrlParts) -> MailerResult<Self> {
        let base = format!(
            "{}://{}",
            parts.transport,
            parts.hostname.as_deref().unwrap_or("")
        );
        let mut url = Url::parse(&base)?;
        let invalid = |what: &str| {
            MailerError::new(
                MailerErrorKind::InvalidUrl,
                format!("Cannot set {} on {:?}", what, parts.transport),
            )
        };

        if parts.port.is_some() {
            url.set_port(parts.port).map_err(|_| invalid("port"))?;
        }
        if let Some(username) = &parts.username {
            url.set_username(username).map_err(|_| invalid("username"))?;
        }
        if let Some(password) = &parts.password {
            url.set_password(Some(password))
                .map_err(|_| invalid("password"))?;
        }
        url.set_path(&parts.path);
        url.set_query(parts.query.as_deref());

        Ok(Self {
            raw: url.as_str().to_string(),
            url,
        })
    }

    /// Returns the editable components.
    pub fn parts(&self) -> UrlParts {
        UrlParts {
            transport: self.transport().to_string(),
            username: self.username(),
            password: self.password(),
            hostname: self.hostname().map(str::to_string),
            port: self.port(),
            path: self.path().to_string(),
            query: self.url.query().map(str::to_string),
        }
    }

    /// Returns a copy with some components changed.
    pub fn replace(&self, edit: impl FnOnce(&mut UrlParts)) -> MailerResult<Self> {
        let mut parts = self.parts();
        edit(&mut parts);
        Self::from_parts(&parts)
    }

    /// Scheme naming the transport.
    pub fn transport(&self) -> &str {
        self.url.scheme()
    }

    /// Decoded username.
    pub fn username(&self) -> Option<String> {
        Some(self.url.username())
            .filter(|u| !u.is_empty())
            .map(percent_decode)
    }

    /// Decoded password.
    pub fn password(&self) -> Option<String> {
        self.url.password().map(percent_decode)
    }

    /// Host name.
    pub fn hostname(&self) -> Option<&str> {
        self.url.host_str().filter(|h| !h.is_empty())
    }

    /// Explicit port.
    pub fn port(&self) -> Option<u16> {
        self.url.port()
    }

    /// Path component. Empty when the URL text has no path.
    pub fn path(&self) -> &str {
        if has_explicit_path(&self.raw) {
            self.url.path()
        } else {
            ""
        }
    }

    /// Decoded query options. Later duplicates win.
    pub fn options(&self) -> HashMap<String, String> {
        self.url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    /// The URL with its password masked.
    pub fn redacted(&self) -> String {
        if self.url.password().is_none() {
            return self.raw.clone();
        }
        self.replace(|parts| parts.password = Some(PASSWORD_MASK.to_string()))
            .map(|masked| masked.raw)
            .unwrap_or_else(|_| mask_raw(&self.raw))
    }
}

/// Returns true if the text after `scheme://` carries a path.
fn has_explicit_path(raw: &str) -> bool {
    match raw.split_once("://") {
        Some((_, rest)) => {
            let end = rest.find(|c: char| c == '?' || c == '#').unwrap_or(rest.len());
            rest[..end].contains('/')
        }
        None => true,
    }
}

/// Masks userinfo in unparsable input so secrets never reach error messages.
fn mask_raw(raw: &str) -> String {
    match (raw.split_once("://"), raw.rfind('@')) {
        (Some((scheme, _)), Some(at)) => format!("{}://{}{}", scheme, PASSWORD_MASK, &raw[at..]),
        _ => raw.to_string(),
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

impl FromStr for EmailUrl {
    type Err = MailerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EmailUrl::parse(s)
    }
}

impl TryFrom<&str> for EmailUrl {
    type Error = MailerError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        EmailUrl::parse(s)
    }
}

impl fmt::Display for EmailUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for EmailUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EmailUrl({:?})", self.redacted())
    }
}

impl PartialEq for EmailUrl {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for EmailUrl {}

impl PartialEq<str> for EmailUrl {
    fn eq(&self, other: &str) -> bool {
        self.raw == other
    }
}

impl PartialEq<&str> for EmailUrl {
    fn eq(&self, other: &&str) -> bool {
        self.raw == *other
    }
}
