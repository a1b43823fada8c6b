//! Message parser: raw RFC 822 payload → `Message`.
//!
//! Sender, Message-ID and Date are required; anything else missing is
//! tolerated. Header encodings we cannot decode never fail the message, they
//! set `decoding_degraded` instead.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders, PartType};
use regex::Regex;
use tracing::{debug, warn};

use crate::error::ParseError;
use crate::mail::RawPayload;
use crate::pipeline::types::{BodyFormat, Message};

/// RFC 2047 encoded word: `=?charset?B?...?=`.
static ENCODED_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"=\?([^?\s]+)\?[QqBb]\?").expect("valid regex"));

/// `<id>` tokens in Message-ID lists.
/// First line of quoted history in a reply.
static QUOTE_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(on\b.*\bwrote:\s*$|-{2,}\s*(original|forwarded) message\s*-{2,}|_{10,}\s*$)")
        .expect("valid regex")
});

static ANGLE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([^<>\s]+)>").expect("valid regex"));

/// Charsets we expect the MIME decoder to handle.
const KNOWN_CHARSETS: &[&str] = &[
    "utf-8", "utf8", "us-ascii", "ascii", "latin1", "iso-8859-1", "iso-8859-2", "iso-8859-3",
    "iso-8859-4", "iso-8859-5", "iso-8859-6", "iso-8859-7", "iso-8859-8", "iso-8859-9",
    "iso-8859-10", "iso-8859-13", "iso-8859-14", "iso-8859-15", "iso-8859-16", "windows-1250",
    "windows-1251", "windows-1252", "windows-1253", "windows-1254", "windows-1255",
    "windows-1256", "windows-1257", "windows-1258", "cp1252", "koi8-r", "koi8-u", "gb2312",
    "gbk", "gb18030", "big5", "shift_jis", "euc-jp", "euc-kr", "iso-2022-jp", "utf-16",
    "utf-16le", "utf-16be",
];

/// Body variants a payload can carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadBody {
    /// Single-part text/plain.
    Plain(String),
    /// Single-part text/html.
    Html(String),
    /// multipart/* with whichever readable alternatives were present.
    Multipart {
        plain: Option<String>,
        html: Option<String>,
    },
    /// Nothing readable.
    Missing,
}

/// Parse a raw payload into a `Message`.
pub fn parse(payload: &RawPayload) -> Result<Message, ParseError> {
    let provider_id = payload.provider_id.clone();
    if let Some(ref reason) = payload.fetch_error {
        return Err(ParseError::FetchFailed {
            provider_id,
            reason: reason.clone(),
        });
    }

    let header_bytes = header_section(&payload.raw);
    let header_text = String::from_utf8_lossy(header_bytes);
    let headers = unfold_headers(&header_text);
    let has_header = |name: &str| headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name));

    let parsed = MessageParser::default()
        .parse(&payload.raw)
        .ok_or_else(|| ParseError::Unreadable {
            provider_id: provider_id.clone(),
        })?;

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.trim().to_string())
        .filter(|s| s.contains('@'))
        .ok_or_else(|| required_header_error(&provider_id, "From", has_header("From")))?;
    let sender_name = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.name())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let message_id = parsed
        .message_id()
        .map(|id| id.trim().trim_matches(|c| c == '<' || c == '>').to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| required_header_error(&provider_id, "Message-ID", has_header("Message-ID")))?;

    let timestamp = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .ok_or_else(|| required_header_error(&provider_id, "Date", has_header("Date")))?;

    let references = header_value(&headers, "References")
        .map(parse_id_list)
        .unwrap_or_default();
    let in_reply_to = header_value(&headers, "In-Reply-To")
        .map(parse_id_list)
        .and_then(|ids| ids.into_iter().next());

    let thread_id = payload
        .thread_id
        .clone()
        .filter(|t| !t.is_empty())
        .or_else(|| references.first().cloned())
        .or(in_reply_to)
        .unwrap_or_else(|| message_id.clone());

    let (body_text, body_html, body_format) = match classify_body(&parsed) {
        PayloadBody::Plain(text) => (text, None, BodyFormat::PlainText),
        PayloadBody::Html(html) => (strip_html(&html), Some(html), BodyFormat::HtmlOnly),
        PayloadBody::Multipart { plain, html } => {
            let text = match (plain, &html) {
                (Some(plain), _) => plain,
                (None, Some(html)) => strip_html(html),
                (None, None) => String::new(),
            };
            (text, html, BodyFormat::Multipart)
        }
        PayloadBody::Missing => (String::new(), None, BodyFormat::Empty),
    };

    let decoding_degraded =
        std::str::from_utf8(header_bytes).is_err() || has_unknown_encoding(&header_text);
    if decoding_degraded {
        warn!(id = %provider_id, "Header decoding degraded, using raw header text");
    }

    let message = Message {
        id: provider_id,
        thread_id,
        message_id,
        sender,
        sender_name,
        to: extract_addresses(parsed.to()),
        cc: extract_addresses(parsed.cc()),
        subject: parsed.subject().unwrap_or_default().trim().to_string(),
        timestamp,
        body_text: body_text.trim_end().to_string(),
        body_html,
        body_format,
        references,
        headers,
        decoding_degraded,
    };

    debug!(
        id = %message.id,
        thread_id = %message.thread_id,
        format = ?message.body_format,
        "Parsed message"
    );
    Ok(message)
}

fn required_header_error(provider_id: &str, header: &'static str, present: bool) -> ParseError {
    if present {
        ParseError::InvalidHeader {
            provider_id: provider_id.to_string(),
            header,
        }
    } else {
        ParseError::MissingHeader {
            provider_id: provider_id.to_string(),
            header,
        }
    }
}

/// Sort the readable parts of a parsed message into a `PayloadBody`.
pub fn classify_body(parsed: &mail_parser::Message<'_>) -> PayloadBody {
    let is_multipart = matches!(
        parsed.parts.first().map(|p| &p.body),
        Some(PartType::Multipart(_))
    );

    let mut plain: Option<String> = None;
    let mut html: Option<String> = None;
    for part in &parsed.parts {
        if MimeHeaders::attachment_name(part).is_some() {
            continue;
        }
        match &part.body {
            PartType::Text(text) => {
                if plain.is_none() && !text.trim().is_empty() {
                    plain = Some(text.to_string());
                }
            }
            PartType::Html(body) => {
                if html.is_none() && !body.trim().is_empty() {
                    html = Some(body.to_string());
                }
            }
            // Binary, nested message/rfc822 and multipart containers
            _ => {}
        }
    }

    match (is_multipart, plain, html) {
        (_, None, None) => PayloadBody::Missing,
        (true, plain, html) => PayloadBody::Multipart { plain, html },
        (false, Some(plain), _) => PayloadBody::Plain(plain),
        (false, None, Some(html)) => PayloadBody::Html(html),
    }
}

/// Bytes before the first blank line.
fn header_section(raw: &[u8]) -> &[u8] {
    let crlf = raw.windows(4).position(|w| w == b"\r\n\r\n");
    let lf = raw.windows(2).position(|w| w == b"\n\n");
    let end = match (crlf, lf) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => raw.len(),
    };
    &raw[..end]
}

/// Split a header block into unfolded name/value pairs.
pub fn unfold_headers(block: &str) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = Vec::new();
    for line in block.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            if !name.is_empty() && !name.contains(' ') {
                headers.push((name.to_string(), value.trim().to_string()));
            }
        }
    }
    headers
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Whether any encoded word names a charset outside `KNOWN_CHARSETS`.
fn has_unknown_encoding(header_text: &str) -> bool {
    ENCODED_WORD.captures_iter(header_text).any(|caps| {
        let charset = caps[1].split('*').next().unwrap_or_default().to_lowercase();
        !KNOWN_CHARSETS.contains(&charset.as_str())
    })
}

/// Parse a `References`/`In-Reply-To` value into bare IDs, oldest first.
pub fn parse_id_list(value: &str) -> Vec<String> {
    let ids: Vec<String> = ANGLE_ID
        .captures_iter(value)
        .map(|c| c[1].to_string())
        .collect();
    if !ids.is_empty() {
        return ids;
    }
    value
        .split_whitespace()
        .map(|s| s.trim_matches(|c| c == '<' || c == '>').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Extract email addresses from an optional mail_parser Address field.
pub fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

/// Strip HTML tags and common entities (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    let decoded = result
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The new part of a reply body, without the quoted history under it.
///
/// Quoted `>` lines are dropped. Everything from a reply attribution
/// ("On ... wrote:") or a forwarded/original-message separator onwards is cut.
pub fn strip_quoted_text(body: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    for line in body.lines() {
        if QUOTE_BOUNDARY.is_match(line) {
            break;
        }
        if line.trim_start().starts_with('>') {
            continue;
        }
        kept.push(line);
    }
    kept.join("\n").trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn payload(raw: &str) -> RawPayload {
        RawPayload {
            provider_id: "m-1".into(),
            thread_id: None,
            raw: raw.as_bytes().to_vec(),
            fetch_error: None,
        }
    }

    const PLAIN: &str = "From: Alice Smith <alice@example.com>\r\n\
To: me@example.com, Bob <bob@example.com>\r\n\
Cc: carol@example.com\r\n\
Subject: Lunch on Tuesday?\r\n\
Date: Mon, 6 Jan 2025 10:30:00 +0000\r\n\
Message-ID: <lunch-1@example.com>\r\n\
\r\n\
Are you free for lunch on Tuesday?\r\n";

    #[test]
    fn parses_required_headers_exactly() {
        let msg = parse(&payload(PLAIN)).unwrap();
        assert_eq!(msg.id, "m-1");
        assert_eq!(msg.sender, "alice@example.com");
        assert_eq!(msg.sender_name.as_deref(), Some("Alice Smith"));
        assert_eq!(msg.subject, "Lunch on Tuesday?");
        assert_eq!(
            msg.timestamp,
            Utc.with_ymd_and_hms(2025, 1, 6, 10, 30, 0).unwrap()
        );
        assert_eq!(msg.message_id, "lunch-1@example.com");
        assert_eq!(msg.to, vec!["me@example.com", "bob@example.com"]);
        assert_eq!(msg.cc, vec!["carol@example.com"]);
        assert_eq!(msg.body_format, BodyFormat::PlainText);
        assert_eq!(msg.body_text, "Are you free for lunch on Tuesday?");
        assert!(msg.body_html.is_none());
        assert!(!msg.decoding_degraded);
    }

    #[test]
    fn thread_id_defaults_to_message_id() {
        let msg = parse(&payload(PLAIN)).unwrap();
        assert_eq!(msg.thread_id, "lunch-1@example.com");
    }

    #[test]
    fn provider_thread_id_wins() {
        let mut p = payload(PLAIN);
        p.thread_id = Some("gmail-thread".into());
        assert_eq!(parse(&p).unwrap().thread_id, "gmail-thread");
    }

    #[test]
    fn thread_id_from_references_root() {
        let raw = PLAIN.replace(
            "Message-ID: <lunch-1@example.com>\r\n",
            "Message-ID: <lunch-3@example.com>\r\nIn-Reply-To: <lunch-2@example.com>\r\nReferences: <lunch-1@example.com>\r\n <lunch-2@example.com>\r\n",
        );
        let msg = parse(&payload(&raw)).unwrap();
        assert_eq!(msg.thread_id, "lunch-1@example.com");
        assert_eq!(msg.references, vec!["lunch-1@example.com", "lunch-2@example.com"]);
    }

    #[test]
    fn missing_message_id_is_malformed() {
        let raw = PLAIN.replace("Message-ID: <lunch-1@example.com>\r\n", "");
        let err = parse(&payload(&raw)).unwrap_err();
        assert!(matches!(
            err,
            ParseError::MissingHeader { header: "Message-ID", .. }
        ));
    }

    #[test]
    fn unfetched_payload_fails_with_fetch_reason() {
        let err = parse(&RawPayload::unreadable("m-9", "HTTP 500")).unwrap_err();
        assert!(matches!(err, ParseError::FetchFailed { .. }));
        assert_eq!(err.to_string(), "message m-9 could not be fetched: HTTP 500");
    }

    #[test]
    fn missing_sender_is_malformed() {
        let raw = PLAIN.replace("From: Alice Smith <alice@example.com>\r\n", "");
        let err = parse(&payload(&raw)).unwrap_err();
        assert!(matches!(err, ParseError::MissingHeader { header: "From", .. }));
    }

    #[test]
    fn unparsable_date_is_invalid_header() {
        let raw = PLAIN.replace("Mon, 6 Jan 2025 10:30:00 +0000", "sometime last week");
        let err = parse(&payload(&raw)).unwrap_err();
        assert!(matches!(err, ParseError::InvalidHeader { header: "Date", .. }));
    }

    #[test]
    fn multipart_prefers_plain_but_keeps_html() {
        let raw = "From: alice@example.com\r\n\
Subject: Report\r\n\
Date: Mon, 6 Jan 2025 10:30:00 +0000\r\n\
Message-ID: <r@example.com>\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Plain version\r\n\
--b1\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>HTML <b>version</b></p>\r\n\
--b1--\r\n";
        let msg = parse(&payload(raw)).unwrap();
        assert_eq!(msg.body_format, BodyFormat::Multipart);
        assert_eq!(msg.body_text, "Plain version");
        assert!(msg.body_html.as_deref().unwrap().contains("<b>version</b>"));
    }

    #[test]
    fn html_only_gets_plain_rendition() {
        let raw = "From: alice@example.com\r\n\
Subject: Hi\r\n\
Date: Mon, 6 Jan 2025 10:30:00 +0000\r\n\
Message-ID: <h@example.com>\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<div>Hello &amp; welcome</div>\r\n";
        let msg = parse(&payload(raw)).unwrap();
        assert_eq!(msg.body_format, BodyFormat::HtmlOnly);
        assert_eq!(msg.body_text, "Hello & welcome");
        assert!(msg.body_html.is_some());
    }

    #[test]
    fn empty_body_is_not_an_error() {
        let raw = "From: alice@example.com\r\n\
Subject: (empty)\r\n\
Date: Mon, 6 Jan 2025 10:30:00 +0000\r\n\
Message-ID: <e@example.com>\r\n\
\r\n";
        let msg = parse(&payload(raw)).unwrap();
        assert_eq!(msg.body_format, BodyFormat::Empty);
        assert!(msg.body_text.is_empty());
    }

    #[test]
    fn unknown_charset_degrades_instead_of_failing() {
        let raw = PLAIN.replace(
            "Subject: Lunch on Tuesday?",
            "Subject: =?x-klingon?B?cWFwbGE=?=",
        );
        let msg = parse(&payload(&raw)).unwrap();
        assert!(msg.decoding_degraded);
        assert_eq!(msg.sender, "alice@example.com");
    }

    #[test]
    fn known_encoded_word_is_not_degraded() {
        let raw = PLAIN.replace(
            "Subject: Lunch on Tuesday?",
            "Subject: =?utf-8?B?Q2Fmw6k=?=",
        );
        let msg = parse(&payload(&raw)).unwrap();
        assert!(!msg.decoding_degraded);
        assert_eq!(msg.subject, "Café");
    }

    #[test]
    fn headers_are_unfolded_and_kept() {
        let headers = unfold_headers("Subject: a\r\n  long subject\r\nX-Thing: 1");
        assert_eq!(headers[0], ("Subject".to_string(), "a long subject".to_string()));
        assert_eq!(headers[1], ("X-Thing".to_string(), "1".to_string()));
    }

    #[test]
    fn raw_headers_survive_parsing() {
        let msg = parse(&payload(PLAIN)).unwrap();
        assert!(msg.headers.iter().any(|(k, v)| {
            k.eq_ignore_ascii_case("message-id") && v == "<lunch-1@example.com>"
        }));
    }

    #[test]
    fn id_list_without_brackets() {
        assert_eq!(parse_id_list("a@x b@y"), vec!["a@x", "b@y"]);
    }

    // ── strip_html / strip_quoted_text ──────────────────────────

    #[test]
    fn strip_html_nested_tags() {
        assert_eq!(
            strip_html("<div><b>Bold</b> and <i>italic</i></div>"),
            "Bold and italic"
        );
    }

    #[test]
    fn strip_html_empty() {
        assert_eq!(strip_html(""), "");
    }

    #[test]
    fn quoted_lines_are_dropped_inline() {
        let body = "Yes, Thursday.\n> Can you do Thursday?\nSee you then";
        assert_eq!(strip_quoted_text(body), "Yes, Thursday.\nSee you then");
    }

    #[test]
    fn history_after_attribution_is_cut() {
        let body = "Works for me.\n\nOn Tue, 7 Jan 2025 at 09:12, Priya <priya@partner.io> wrote:\nDoes 3pm work?";
        assert_eq!(strip_quoted_text(body), "Works for me.");
    }

    #[test]
    fn forwarded_and_outlook_separators_cut() {
        assert_eq!(
            strip_quoted_text("FYI below\n---------- Forwarded message ---------\nFrom: x"),
            "FYI below"
        );
        assert_eq!(
            strip_quoted_text("Approved.\n________________________________\nFrom: Finance"),
            "Approved."
        );
    }
}
