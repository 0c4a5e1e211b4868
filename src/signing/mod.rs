//! Message signing.
//!
//! [`DkimSigner`] adds an RSA-SHA256 `DKIM-Signature` header using
//! relaxed/relaxed canonicalization (RFC 6376). The signature is computed over
//! the serialized wire form, so it covers exactly what transports transmit.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;

use crate::errors::{MailerError, MailerErrorKind, MailerResult};
use crate::mime::MimeMessage;

/// Header carrying the signature.
pub const DKIM_HEADER: &str = "DKIM-Signature";

/// Headers signed when none are configured.
pub const DEFAULT_SIGNED_HEADERS: [&str; 3] = ["From", "To", "Subject"];

/// Signs a finished wire message.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Returns the signed message.
    async fn sign(&self, message: MimeMessage) -> MailerResult<MimeMessage>;
}

/// Where a private key comes from.
#[derive(Clone)]
pub enum KeySource {
    /// PEM text (PKCS#1 or PKCS#8).
    Pem(SecretString),
    /// Path to a PEM file, read on first use.
    Path(PathBuf),
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Pem(_) => f.write_str("Pem(********)"),
            KeySource::Path(path) => f.debug_tuple("Path").field(path).finish(),
        }
    }
}

/// DKIM signer with a lazily loaded, cached private key.
///
/// The key is parsed once per signer; concurrent first sends wait on the same
/// initialization.
pub struct DkimSigner {
    selector: String,
    domain: Option<String>,
    headers: Vec<String>,
    source: KeySource,
    key: OnceCell<RsaPrivateKey>,
}

impl DkimSigner {
    /// Creates a signer for `selector` with the given key source.
    pub fn new(selector: impl Into<String>, source: KeySource) -> Self {
        Self {
            selector: selector.into(),
            domain: None,
            headers: DEFAULT_SIGNED_HEADERS.iter().map(|h| h.to_string()).collect(),
            source,
            key: OnceCell::new(),
        }
    }

    /// Creates a signer from PEM text.
    pub fn from_pem(selector: impl Into<String>, pem: impl Into<String>) -> Self {
        Self::new(selector, KeySource::Pem(SecretString::new(pem.into())))
    }

    /// Creates a signer reading its key from `path` on first use.
    pub fn from_path(selector: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(selector, KeySource::Path(path.into()))
    }

    /// Overrides the signed header list.
    pub fn with_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.headers = headers.into_iter().map(Into::into).collect();
        self
    }

    /// Overrides the signing domain. Defaults to the `From` domain.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Returns true once the key has been loaded.
    pub fn is_key_loaded(&self) -> bool {
        self.key.initialized()
    }

    async fn key(&self) -> MailerResult<&RsaPrivateKey> {
        self.key
            .get_or_try_init(|| async {
                let pem = match &self.source {
                    KeySource::Pem(pem) => pem.expose_secret().clone(),
                    KeySource::Path(path) => {
                        tracing::debug!(path = %path.display(), "Loading DKIM key");
                        tokio::fs::read_to_string(path).await.map_err(|e| {
                            signing_error(format!(
                                "Failed to read DKIM key {}: {}",
                                path.display(),
                                e
                            ))
                        })?
                    }
                };
                parse_key(&pem)
            })
            .await
    }

    fn signing_domain(&self, message: &MimeMessage) -> MailerResult<String> {
        if let Some(domain) = &self.domain {
            return Ok(domain.clone());
        }
        message
            .header("From")
            .and_then(|from| from.rsplit_once('@'))
            .map(|(_, domain)| domain)
            .map(|domain: &str| domain.trim().trim_end_matches('>').trim().to_string())
            .filter(|domain| !domain.is_empty())
            .ok_or_else(|| {
                MailerError::new(
                    MailerErrorKind::MissingDomain,
                    "Cannot derive DKIM domain: message has no From address.",
                )
            })
    }
}

impl fmt::Debug for DkimSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DkimSigner")
            .field("selector", &self.selector)
            .field("domain", &self.domain)
            .field("headers", &self.headers)
            .field("source", &self.source)
            .field("key_loaded", &self.is_key_loaded())
            .finish()
    }
}

#[async_trait]
impl Signer for DkimSigner {
    async fn sign(&self, mut message: MimeMessage) -> MailerResult<MimeMessage> {
        let key = self.key().await?;
        let domain = self.signing_domain(&message)?;

        let mut header_block = Vec::new();
        message.headers().write_to(&mut header_block);
        let fields = unfold_fields(&String::from_utf8_lossy(&header_block));

        let mut signed_names = Vec::new();
        let mut canonical = String::new();
        for name in &self.headers {
            if let Some((field_name, value)) = fields
                .iter()
                .rev()
                .find(|(field_name, _)| field_name.eq_ignore_ascii_case(name))
            {
                canonical.push_str(&relaxed_header(field_name, value));
                canonical.push_str("\r\n");
                signed_names.push(name.as_str());
            }
        }

        let body_hash = BASE64.encode(Sha256::digest(relaxed_body(&message.body_bytes())));
        let unsigned = format!(
            "v=1; a=rsa-sha256; c=relaxed/relaxed; d={}; s={}; t={}; h={}; bh={}; b=",
            domain,
            self.selector,
            chrono::Utc::now().timestamp(),
            signed_names.join(":"),
            body_hash
        );
        canonical.push_str(&relaxed_header(DKIM_HEADER, &unsigned));

        let digest = Sha256::digest(canonical.as_bytes());
        let signature = key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| signing_error(format!("RSA signing failed: {}", e)))?;

        message.prepend_header(DKIM_HEADER, format!("{}{}", unsigned, BASE64.encode(signature)))?;
        tracing::debug!(domain = %domain, selector = %self.selector, "Signed message");
        Ok(message)
    }
}

fn signing_error(message: impl Into<String>) -> MailerError {
    MailerError::new(MailerErrorKind::Signing, message)
}

fn parse_key(pem: &str) -> MailerResult<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| signing_error(format!("Invalid DKIM private key: {}", e)))
}

/// Splits a serialized header block into `(name, unfolded value)` fields.
fn unfold_fields(block: &str) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = Vec::new();
    for line in block.split("\r\n").filter(|l| !l.is_empty()) {
        if line.starts_with(|c| c == ' ' || c == '\t') {
            if let Some((_, value)) = fields.last_mut() {
                value.push_str(line);
            }
        } else if let Some((name, value)) = line.split_once(':') {
            fields.push((name.to_string(), value.to_string()));
        }
    }
    fields
}

/// Relaxed header canonicalization, without the trailing CRLF.
pub(crate) fn relaxed_header(name: &str, value: &str) -> String {
    let value = value.replace("\r\n", "");
    format!(
        "{}:{}",
        name.trim().to_ascii_lowercase(),
        collapse_whitespace(&value).trim()
    )
}

/// Relaxed body canonicalization.
pub(crate) fn relaxed_body(body: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(body);
    let mut lines: Vec<String> = text
        .split("\r\n")
        .map(|line| collapse_whitespace(line).trim_end().to_string())
        .collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }

    let mut out = Vec::with_capacity(body.len());
    for line in lines {
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_space = false;
    for c in s.chars() {
        if c == ' ' || c == '\t' {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}
