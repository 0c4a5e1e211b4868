//! SMTP AUTH mechanisms: PLAIN (RFC 4616), LOGIN and CRAM-MD5 (RFC 2195).

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::Md5;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::errors::{MailerError, MailerResult};

type HmacMd5 = Hmac<Md5>;

/// SASL mechanisms the client can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// PLAIN: identity and password in one base64 response.
    Plain,
    /// LOGIN: username and password in two base64 responses.
    Login,
    /// CRAM-MD5: keyed digest of a server challenge.
    CramMd5,
}

impl AuthMethod {
    /// Mechanism name used on the AUTH line.
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            AuthMethod::Plain => "PLAIN",
            AuthMethod::Login => "LOGIN",
            AuthMethod::CramMd5 => "CRAM-MD5",
        }
    }

    /// Maps a mechanism advertised in EHLO to a supported method.
    pub fn from_capability(s: &str) -> Option<Self> {
        [AuthMethod::CramMd5, AuthMethod::Plain, AuthMethod::Login]
            .into_iter()
            .find(|m| m.mechanism_name().eq_ignore_ascii_case(s))
    }

    /// Returns true if the password crosses the wire recoverably.
    pub fn is_clear_text(&self) -> bool {
        !matches!(self, AuthMethod::CramMd5)
    }

    /// Picks the strongest method in `offered`.
    ///
    /// CRAM-MD5 beats PLAIN beats LOGIN. Clear-text methods are only
    /// eligible when `allow_clear_text` is set.
    pub fn select(offered: &[AuthMethod], allow_clear_text: bool) -> MailerResult<AuthMethod> {
        [AuthMethod::CramMd5, AuthMethod::Plain, AuthMethod::Login]
            .into_iter()
            .filter(|m| allow_clear_text || !m.is_clear_text())
            .find(|m| offered.contains(m))
            .ok_or_else(|| {
                MailerError::smtp(format!(
                    "No usable authentication method (server offers {:?}, clear text allowed: {})",
                    offered, allow_clear_text
                ))
            })
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mechanism_name())
    }
}

/// Username and password for SMTP AUTH.
#[derive(Clone)]
pub struct Credentials {
    /// Username.
    pub username: String,
    /// Password, redacted from `Debug`.
    pub password: SecretString,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }

    /// PLAIN initial response: `\0user\0password`, base64-encoded.
    pub fn plain_response(&self) -> String {
        BASE64.encode(format!("\0{}\0{}", self.username, self.password.expose_secret()))
    }

    /// LOGIN answer to the username prompt.
    pub fn login_username(&self) -> String {
        BASE64.encode(&self.username)
    }

    /// LOGIN answer to the password prompt.
    pub fn login_password(&self) -> String {
        BASE64.encode(self.password.expose_secret())
    }

    /// CRAM-MD5 answer to a base64 server challenge.
    pub fn cram_md5_response(&self, challenge: &str) -> MailerResult<String> {
        let challenge = BASE64
            .decode(challenge.trim())
            .map_err(|e| MailerError::smtp(format!("Invalid CRAM-MD5 challenge: {}", e)))?;

        let mut mac = HmacMd5::new_from_slice(self.password.expose_secret().as_bytes())
            .map_err(|e| MailerError::smtp(format!("HMAC error: {}", e)))?;
        mac.update(&challenge);
        let digest: String = mac
            .finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();

        Ok(BASE64.encode(format!("{} {}", self.username, digest)))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}
