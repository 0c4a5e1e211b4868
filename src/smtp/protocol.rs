//! SMTP commands, replies and ESMTP extensions (RFC 5321).

use std::collections::HashSet;
use std::fmt;

use super::auth::AuthMethod;
use crate::errors::{MailerError, MailerResult};

/// Commands issued by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended greeting with the client identity.
    Ehlo(String),
    /// Plain greeting for servers without ESMTP.
    Helo(String),
    /// Upgrade the connection to TLS.
    StartTls,
    /// Start an AUTH exchange.
    Auth {
        /// SASL mechanism name.
        mechanism: String,
        /// Initial client response, already base64-encoded.
        initial_response: Option<String>,
    },
    /// Open a transaction for `address`.
    MailFrom {
        /// Reverse path, without angle brackets.
        address: String,
        /// Declared message size, sent when the server advertises SIZE.
        size: Option<usize>,
        /// Declares an 8-bit body.
        body_8bit: bool,
    },
    /// Add a recipient.
    RcptTo {
        /// Forward path, without angle brackets.
        address: String,
    },
    /// Start the message payload.
    Data,
    /// Abort the current transaction.
    Rset,
    /// Close the session.
    Quit,
}

impl SmtpCommand {
    /// The command line as sent, without the trailing CRLF.
    pub fn line(&self) -> String {
        match self {
            SmtpCommand::Ehlo(id) => format!("EHLO {}", id),
            SmtpCommand::Helo(id) => format!("HELO {}", id),
            SmtpCommand::StartTls => "STARTTLS".into(),
            SmtpCommand::Auth {
                mechanism,
                initial_response: Some(response),
            } => format!("AUTH {} {}", mechanism, response),
            SmtpCommand::Auth { mechanism, .. } => format!("AUTH {}", mechanism),
            SmtpCommand::MailFrom {
                address,
                size,
                body_8bit,
            } => {
                let mut line = format!("MAIL FROM:<{}>", address);
                if let Some(size) = size {
                    line += &format!(" SIZE={}", size);
                }
                if *body_8bit {
                    line += " BODY=8BITMIME";
                }
                line
            }
            SmtpCommand::RcptTo { address } => format!("RCPT TO:<{}>", address),
            SmtpCommand::Data => "DATA".into(),
            SmtpCommand::Rset => "RSET".into(),
            SmtpCommand::Quit => "QUIT".into(),
        }
    }
}

/// Log form of the command. Credentials are masked.
impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpCommand::Auth {
                mechanism,
                initial_response: Some(_),
            } => write!(f, "AUTH {} ********", mechanism),
            _ => f.write_str(&self.line()),
        }
    }
}

/// A complete server reply, possibly spanning several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    /// Three-digit reply code.
    pub code: u16,
    /// Enhanced status code (RFC 3463) of the first line, such as `5.1.1`.
    pub enhanced_code: Option<String>,
    /// Text of each line, without code and separator.
    pub lines: Vec<String>,
}

impl SmtpResponse {
    /// Creates a single-line reply.
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            enhanced_code: None,
            lines: vec![text.into()],
        }
    }

    /// Parses the raw lines of one reply.
    ///
    /// Every line must start with the same code.
    pub fn parse(raw: &[String]) -> MailerResult<Self> {
        let first = raw.first().ok_or_else(|| MailerError::smtp("Empty response"))?;
        let code = reply_code(first)?;

        let mut lines = Vec::with_capacity(raw.len());
        for line in raw {
            if reply_code(line)? != code {
                return Err(MailerError::smtp(
                    "Inconsistent status codes in multiline response",
                ));
            }
            lines.push(line.get(4..).unwrap_or_default().to_string());
        }

        let mut enhanced_code = None;
        if let Some((head, rest)) = lines[0].split_once(' ') {
            if is_enhanced_code(head) {
                enhanced_code = Some(head.to_string());
                lines[0] = rest.trim().to_string();
            }
        }

        Ok(Self {
            code,
            enhanced_code,
            lines,
        })
    }

    /// Returns true for 2xx replies.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Text of the first line.
    pub fn first_message(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or_default()
    }

    /// All lines joined with newlines.
    pub fn full_message(&self) -> String {
        self.lines.join("\n")
    }

    /// The reply as an error carrying its code.
    pub fn to_error(&self) -> MailerError {
        MailerError::from_smtp_response(self.code, self.full_message())
    }

    /// Passes the reply through if its code is `expected`.
    pub fn expect_code(self, expected: u16) -> MailerResult<Self> {
        if self.code == expected {
            Ok(self)
        } else {
            Err(self.to_error())
        }
    }

    /// Passes 2xx replies through.
    pub fn expect_success(self) -> MailerResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(self.to_error())
        }
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.first_message())
    }
}

fn reply_code(line: &str) -> MailerResult<u16> {
    line.get(..3)
        .filter(|code| code.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| MailerError::smtp(format!("Invalid reply line: {:?}", line)))
}

fn is_enhanced_code(s: &str) -> bool {
    let fields: Vec<&str> = s.split('.').collect();
    fields.len() == 3
        && matches!(fields[0], "2" | "4" | "5")
        && fields
            .iter()
            .all(|f| !f.is_empty() && f.len() <= 3 && f.bytes().all(|b| b.is_ascii_digit()))
}

/// Extensions advertised in the EHLO reply.
#[derive(Debug, Clone, Default)]
pub struct EsmtpCapabilities {
    /// Maximum message size, when advertised with a limit.
    pub size: Option<usize>,
    /// AUTH mechanisms this client implements.
    pub auth_mechanisms: HashSet<AuthMethod>,
    /// STARTTLS offered.
    pub starttls: bool,
    /// 8BITMIME offered.
    pub eight_bit_mime: bool,
}

impl EsmtpCapabilities {
    /// Reads the extension lines of an EHLO reply. The first line is the greeting.
    pub fn from_ehlo_response(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();

        for line in response.lines.iter().skip(1) {
            let mut words = line.split_whitespace();
            let Some(keyword) = words.next() else {
                continue;
            };
            match keyword.to_ascii_uppercase().as_str() {
                "SIZE" => caps.size = words.next().and_then(|s| s.parse().ok()).filter(|s| *s > 0),
                "AUTH" => caps
                    .auth_mechanisms
                    .extend(words.filter_map(AuthMethod::from_capability)),
                "STARTTLS" => caps.starttls = true,
                "8BITMIME" => caps.eight_bit_mime = true,
                _ => {}
            }
        }

        caps
    }
}

/// Reply codes the client waits for.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Authentication succeeded.
    pub const AUTH_SUCCESS: u16 = 235;
    /// Server challenge during AUTH.
    pub const AUTH_CONTINUE: u16 = 334;
    /// Ready for the message payload.
    pub const START_MAIL_INPUT: u16 = 354;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(raw: &[&str]) -> MailerResult<SmtpResponse> {
        let raw: Vec<String> = raw.iter().map(|s| s.to_string()).collect();
        SmtpResponse::parse(&raw)
    }

    #[test]
    fn test_command_lines() {
        assert_eq!(SmtpCommand::Ehlo("client.local".into()).line(), "EHLO client.local");
        assert_eq!(
            SmtpCommand::MailFrom {
                address: "bounce@example.com".into(),
                size: Some(2048),
                body_8bit: true,
            }
            .line(),
            "MAIL FROM:<bounce@example.com> SIZE=2048 BODY=8BITMIME"
        );
        assert_eq!(
            SmtpCommand::RcptTo {
                address: "to@example.com".into()
            }
            .line(),
            "RCPT TO:<to@example.com>"
        );
    }

    #[test]
    fn test_auth_display_masks_credentials() {
        let cmd = SmtpCommand::Auth {
            mechanism: "PLAIN".into(),
            initial_response: Some("AHVzZXIAcGFzcw==".into()),
        };
        assert_eq!(cmd.to_string(), "AUTH PLAIN ********");
        assert!(cmd.line().ends_with("AHVzZXIAcGFzcw=="));

        let bare = SmtpCommand::Auth {
            mechanism: "LOGIN".into(),
            initial_response: None,
        };
        assert_eq!(bare.to_string(), "AUTH LOGIN");
    }

    #[test]
    fn test_reply_parse() {
        let single = reply(&["250 OK"]).unwrap();
        assert_eq!(single.code, 250);
        assert!(single.is_success());
        assert_eq!(single.first_message(), "OK");

        let multi = reply(&["250-mx.example.com Hello", "250-SIZE 10485760", "250 STARTTLS"]).unwrap();
        assert_eq!(multi.lines.len(), 3);
        assert_eq!(multi.full_message(), "mx.example.com Hello\nSIZE 10485760\nSTARTTLS");

        assert!(reply(&["250-a", "251 b"]).is_err());
        assert!(reply(&["ok"]).is_err());
        assert!(reply(&[]).is_err());
    }

    #[test]
    fn test_enhanced_code_split_off() {
        let refused = reply(&["550 5.1.1 User unknown"]).unwrap();
        assert_eq!(refused.enhanced_code.as_deref(), Some("5.1.1"));
        assert_eq!(refused.first_message(), "User unknown");

        let err = refused.to_error();
        assert_eq!(err.smtp_code(), Some(550));
        assert!(!err.is_retryable());

        let plain = reply(&["250 2.0 not enhanced"]).unwrap();
        assert!(plain.enhanced_code.is_none());
    }

    #[test]
    fn test_capabilities() {
        let ehlo = reply(&[
            "250-mx.example.com",
            "250-SIZE 10485760",
            "250-AUTH PLAIN LOGIN CRAM-MD5 XOAUTH2",
            "250-STARTTLS",
            "250 8BITMIME",
        ])
        .unwrap();

        let caps = EsmtpCapabilities::from_ehlo_response(&ehlo);
        assert_eq!(caps.size, Some(10485760));
        assert_eq!(caps.auth_mechanisms.len(), 3);
        assert!(caps.auth_mechanisms.contains(&AuthMethod::CramMd5));
        assert!(caps.starttls);
        assert!(caps.eight_bit_mime);

        let bare = EsmtpCapabilities::from_ehlo_response(&reply(&["250 mx.example.com"]).unwrap());
        assert!(!bare.starttls);
        assert!(bare.size.is_none());
    }
}
