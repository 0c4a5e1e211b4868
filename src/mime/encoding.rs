//! Low-level encoders shared by the wire model and the SMTP client.

use std::borrow::Cow;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, FixedOffset, Utc};
use encoding_rs::Encoding;
use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

use crate::errors::{MailerError, MailerResult};

/// Maximum length of a folded header line (excluding CRLF).
const FOLD_WIDTH: usize = 78;
/// Line length of base64 bodies.
const BASE64_LINE: usize = 76;
/// Longest line allowed in a 7bit body.
const MAX_7BIT_LINE: usize = 998;
/// Bytes of UTF-8 per RFC 2047 encoded word. 39 bytes give 52 base64
/// characters, so `Subject: =?UTF-8?B?...?=` stays within the fold width.
const ENCODED_WORD_BYTES: usize = 39;
/// ASCII words longer than this cannot be folded and are encoded instead.
const MAX_RAW_WORD: usize = 900;

/// Transfer encoding types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferEncoding {
    /// 7-bit ASCII (no encoding).
    SevenBit,
    /// Quoted-printable encoding.
    #[default]
    QuotedPrintable,
    /// Base64 encoding.
    Base64,
}

impl TransferEncoding {
    /// Returns the header value.
    pub fn header_value(&self) -> &'static str {
        match self {
            TransferEncoding::SevenBit => "7bit",
            TransferEncoding::QuotedPrintable => "quoted-printable",
            TransferEncoding::Base64 => "base64",
        }
    }

    /// Picks the lightest encoding able to carry the given text.
    pub fn for_text(text: &str) -> Self {
        Self::for_bytes(text.as_bytes())
    }

    /// Picks the lightest encoding able to carry the given charset-encoded text.
    pub fn for_bytes(data: &[u8]) -> Self {
        let plain = data.is_ascii()
            && !data.contains(&b'\r')
            && data.split(|&b| b == b'\n').all(|line| line.len() <= MAX_7BIT_LINE);
        if plain {
            TransferEncoding::SevenBit
        } else {
            TransferEncoding::QuotedPrintable
        }
    }

    /// Encodes raw body bytes. The result always ends with CRLF.
    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        let mut out = match self {
            TransferEncoding::SevenBit => normalize_line_endings(data),
            TransferEncoding::QuotedPrintable => {
                quoted_printable::encode(normalize_line_endings(data))
            }
            TransferEncoding::Base64 => {
                let encoded = BASE64.encode(data);
                let mut wrapped = Vec::with_capacity(encoded.len() + encoded.len() / 38 + 2);
                for chunk in encoded.as_bytes().chunks(BASE64_LINE) {
                    wrapped.extend_from_slice(chunk);
                    wrapped.extend_from_slice(b"\r\n");
                }
                wrapped
            }
        };
        if !out.ends_with(b"\r\n") {
            out.extend_from_slice(b"\r\n");
        }
        out
    }
}

/// Converts bare LF and bare CR to CRLF.
pub fn normalize_line_endings(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 40);
    let mut iter = data.iter().peekable();
    while let Some(&byte) = iter.next() {
        match byte {
            b'\r' => {
                out.extend_from_slice(b"\r\n");
                if iter.peek() == Some(&&b'\n') {
                    iter.next();
                }
            }
            b'\n' => out.extend_from_slice(b"\r\n"),
            _ => out.push(byte),
        }
    }
    out
}

fn is_utf8_label(charset: &str) -> bool {
    charset.eq_ignore_ascii_case("utf-8") || charset.eq_ignore_ascii_case("utf8")
}

fn is_ascii_label(charset: &str) -> bool {
    charset.eq_ignore_ascii_case("us-ascii") || charset.eq_ignore_ascii_case("ascii")
}

/// Encodes `text` in the named charset.
///
/// Fails for unknown charsets, for charsets that cannot be produced as a byte
/// stream (UTF-16), and when `text` holds characters the charset lacks.
pub fn encode_charset<'a>(text: &'a str, charset: &str) -> MailerResult<Cow<'a, [u8]>> {
    let charset = charset.trim();
    if is_utf8_label(charset) || (is_ascii_label(charset) && text.is_ascii()) {
        return Ok(Cow::Borrowed(text.as_bytes()));
    }
    let unmappable = || {
        MailerError::configuration(format!(
            "Text cannot be represented in charset {:?}",
            charset
        ))
    };
    if is_ascii_label(charset) {
        return Err(unmappable());
    }

    let encoding = Encoding::for_label(charset.as_bytes())
        .ok_or_else(|| MailerError::configuration(format!("Unknown charset {:?}", charset)))?;
    let (bytes, used, had_errors) = encoding.encode(text);
    if used != encoding {
        return Err(MailerError::configuration(format!(
            "Charset {:?} cannot be used for message bodies",
            charset
        )));
    }
    if had_errors {
        return Err(unmappable());
    }
    Ok(bytes)
}

/// Decodes `data` from the named charset. `None` for unknown charsets and
/// malformed input.
pub fn decode_charset<'a>(data: &'a [u8], charset: &str) -> Option<Cow<'a, str>> {
    let charset = charset.trim();
    if is_utf8_label(charset) {
        return std::str::from_utf8(data).ok().map(Cow::Borrowed);
    }
    Encoding::for_label(charset.as_bytes())?.decode_without_bom_handling_and_without_replacement(data)
}

/// Encodes a header value using RFC 2047.
///
/// Runs of words needing encoding become one or more `B` encoded words of at
/// most 39 UTF-8 bytes each, split on character boundaries. Spaces inside a
/// run are carried in the encoded text, since decoders drop whitespace
/// between adjacent encoded words.
pub fn encode_header_value(value: &str) -> String {
    if value.is_ascii() && value.split(' ').all(|w| w.len() <= MAX_RAW_WORD) {
        return value.to_string();
    }

    let needs_encoding = |word: &str| !word.is_ascii() || word.len() > MAX_RAW_WORD;
    let mut tokens: Vec<String> = Vec::new();
    let mut run: Option<String> = None;

    for word in value.split(' ') {
        if needs_encoding(word) {
            match run.as_mut() {
                Some(run) => {
                    run.push(' ');
                    run.push_str(word);
                }
                None => run = Some(word.to_string()),
            }
        } else {
            if let Some(run) = run.take() {
                tokens.extend(encoded_words(&run));
            }
            tokens.push(word.to_string());
        }
    }
    if let Some(run) = run {
        tokens.extend(encoded_words(&run));
    }
    tokens.join(" ")
}

fn encoded_words(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut start = 0;
    let mut end = 0;
    for (index, ch) in text.char_indices() {
        if index + ch.len_utf8() - start > ENCODED_WORD_BYTES {
            words.push(encoded_word(&text[start..end]));
            start = index;
        }
        end = index + ch.len_utf8();
    }
    if start < text.len() {
        words.push(encoded_word(&text[start..]));
    }
    words
}

fn encoded_word(chunk: &str) -> String {
    format!("=?UTF-8?B?{}?=", BASE64.encode(chunk.as_bytes()))
}

/// Folds a header line at 78 characters on whitespace.
pub fn fold_header(header: &str) -> String {
    if header.len() <= FOLD_WIDTH {
        return header.to_string();
    }

    let mut result = String::with_capacity(header.len() + 16);
    let mut current_line = String::new();

    for word in header.split(' ') {
        if current_line.is_empty() {
            current_line = word.to_string();
        } else if current_line.len() + 1 + word.len() <= FOLD_WIDTH - 2 {
            current_line.push(' ');
            current_line.push_str(word);
        } else {
            result.push_str(&current_line);
            result.push_str("\r\n ");
            current_line = word.to_string();
        }
    }

    result.push_str(&current_line);
    result
}

/// Formats a MIME parameter, switching to RFC 2231 for non-ASCII values.
pub fn format_param(name: &str, value: &str) -> String {
    if value.is_ascii() {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        return format!("{}=\"{}\"", name, escaped);
    }

    let mut encoded = String::with_capacity(value.len() * 3);
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    format!("{}*=utf-8''{}", name, encoded)
}

/// Generates a unique multipart boundary.
pub fn make_boundary() -> String {
    format!("===============_Part_{}", Uuid::new_v4().simple())
}

/// Generates a bracketed message id for the given domain.
pub fn make_message_id(domain: &str) -> String {
    let domain = if domain.is_empty() { "localhost" } else { domain };
    format!(
        "<{}.{}@{}>",
        Uuid::new_v4().simple(),
        Utc::now().timestamp(),
        domain
    )
}

/// Returns the domain part of a message id, without angle brackets.
pub fn message_id_domain(message_id: &str) -> &str {
    let trimmed = message_id.trim().trim_start_matches('<').trim_end_matches('>');
    match trimmed.rsplit_once('@') {
        Some((_, domain)) if !domain.is_empty() => domain,
        _ => "localhost",
    }
}

/// Generates a random lowercase alphanumeric token.
pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}

/// Formats a date for the Date header.
pub fn format_date(date: &DateTime<FixedOffset>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S %z").to_string()
}

/// Prepares the DATA content with dot-stuffing and the terminating dot line.
pub fn prepare_data_content(encoded_email: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(encoded_email.len() + 100);
    let mut at_line_start = true;

    for &byte in encoded_email {
        if at_line_start && byte == b'.' {
            output.push(b'.');
        }

        output.push(byte);
        at_line_start = byte == b'\n';
    }

    if !output.ends_with(b"\r\n") {
        if output.ends_with(b"\n") {
            output.pop();
        }
        output.extend_from_slice(b"\r\n");
    }

    output.extend_from_slice(b".\r\n");
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encoding() {
        assert_eq!(encode_header_value("Hello"), "Hello");

        let encoded = encode_header_value("Héllo world");
        assert!(encoded.starts_with("=?UTF-8?B?"));
        assert!(encoded.ends_with(" world"));
    }

    #[test]
    fn test_header_encoding_keeps_spaces_inside_runs() {
        let encoded = encode_header_value("Grüße Köln from Ünna");
        let words: Vec<&str> = encoded.split(' ').collect();
        assert_eq!(words.len(), 3);
        assert_eq!(words[1], "from");
        assert_eq!(
            BASE64
                .decode(words[0].trim_start_matches("=?UTF-8?B?").trim_end_matches("?="))
                .unwrap(),
            "Grüße Köln".as_bytes()
        );
    }

    #[test]
    fn test_long_unspaced_header_stays_within_line_limits() {
        for value in ["ü".repeat(600), "漢字".repeat(300), "x".repeat(2000)] {
            let encoded = encode_header_value(&value);
            let folded = fold_header(&format!("Subject: {}", encoded));
            for line in folded.split("\r\n") {
                assert!(line.len() <= FOLD_WIDTH, "line of {} chars", line.len());
            }
            for word in encoded.split(' ').filter(|w| w.starts_with("=?")) {
                assert!(word.len() <= 75);
            }

            let decoded: Vec<u8> = encoded
                .split(' ')
                .flat_map(|w| {
                    BASE64
                        .decode(w.trim_start_matches("=?UTF-8?B?").trim_end_matches("?="))
                        .unwrap()
                })
                .collect();
            assert_eq!(decoded, value.as_bytes());
        }
    }

    #[test]
    fn test_charset_round_trip() {
        let latin1 = encode_charset("café", "iso-8859-1").unwrap();
        assert_eq!(latin1.as_ref(), b"caf\xe9");
        assert_eq!(decode_charset(&latin1, "ISO-8859-1").as_deref(), Some("café"));

        assert_eq!(encode_charset("café", "utf-8").unwrap().as_ref(), "café".as_bytes());
        assert!(encode_charset("plain", "us-ascii").is_ok());
        assert!(encode_charset("café", "us-ascii").is_err());
        assert!(encode_charset("日本", "iso-8859-1").is_err());
        assert!(encode_charset("x", "utf-16le").is_err());
        assert!(encode_charset("x", "no-such-charset").is_err());
    }

    #[test]
    fn test_fold_long_header() {
        let value = vec!["word"; 40].join(" ");
        let folded = fold_header(&format!("Subject: {}", value));
        assert!(folded.contains("\r\n "));
        assert!(folded.split("\r\n").all(|line| line.len() <= FOLD_WIDTH));
    }

    #[test]
    fn test_text_encoding_choice() {
        assert_eq!(TransferEncoding::for_text("plain\nascii"), TransferEncoding::SevenBit);
        assert_eq!(TransferEncoding::for_text("naïve"), TransferEncoding::QuotedPrintable);
        assert_eq!(
            TransferEncoding::for_text(&"x".repeat(1200)),
            TransferEncoding::QuotedPrintable
        );
    }

    #[test]
    fn test_base64_wrapping() {
        let encoded = TransferEncoding::Base64.encode(&[0u8; 200]);
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.split("\r\n").all(|line| line.len() <= BASE64_LINE));
        assert!(text.ends_with("\r\n"));
    }

    #[test]
    fn test_line_ending_normalization() {
        assert_eq!(normalize_line_endings(b"a\nb\r\nc\rd"), b"a\r\nb\r\nc\r\nd".to_vec());
    }

    #[test]
    fn test_format_param() {
        assert_eq!(format_param("filename", "a \"b\".txt"), "filename=\"a \\\"b\\\".txt\"");
        assert_eq!(format_param("filename", "ü.txt"), "filename*=utf-8''%C3%BC.txt");
    }

    #[test]
    fn test_message_id() {
        let id = make_message_id("example.com");
        assert!(id.starts_with('<'));
        assert!(id.ends_with("@example.com>"));
        assert_eq!(message_id_domain(&id), "example.com");
        assert_eq!(message_id_domain("no-domain"), "localhost");
    }

    #[test]
    fn test_random_token() {
        let token = random_token(16);
        assert_eq!(token.len(), 16);
        assert!(token.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(make_boundary(), make_boundary());
    }

    #[test]
    fn test_dot_stuffing() {
        let input = b"Hello\r\n.World\r\n..Test\r\n";
        let output = prepare_data_content(input);
        let output_str = String::from_utf8_lossy(&output);
        assert!(output_str.contains("\r\n..World"));
        assert!(output_str.contains("\r\n...Test"));
        assert!(output_str.ends_with("\r\n.\r\n"));
    }
}
