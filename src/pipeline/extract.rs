//! Content extractor: best-effort plain-text body from a raw message.
//!
//! mail-parser decodes each text leaf with its declared charset (UTF-8 when
//! none is given), substituting replacement characters on bad input. This
//! module only picks which leaf to use: the first `text/plain` in depth-first
//! order, else the first `text/html`, else nothing.

use mail_parser::{Message, MessageParser, MimeHeaders, PartType};
use tracing::{debug, warn};

use crate::pipeline::types::InboundMail;

#[derive(Default)]
struct Captures {
    plain: Option<String>,
    html: Option<String>,
}

impl Captures {
    fn complete(&self) -> bool {
        self.plain.is_some() && self.html.is_some()
    }
}

/// Select the body of a parsed message.
pub fn extract_body(message: &Message<'_>) -> String {
    let mut captures = Captures::default();
    walk(message, 0, &mut captures);

    if let Some(plain) = captures.plain {
        debug!("Using text/plain body");
        plain
    } else if let Some(html) = captures.html {
        debug!("Falling back to text/html body");
        html
    } else {
        warn!("No text content could be extracted");
        String::new()
    }
}

fn walk(message: &Message<'_>, index: usize, captures: &mut Captures) {
    if captures.complete() {
        return;
    }
    let Some(part) = message.parts.get(index) else {
        return;
    };

    match &part.body {
        PartType::Multipart(children) => {
            for &child in children {
                walk(message, child as usize, captures);
                if captures.complete() {
                    break;
                }
            }
        }
        PartType::Message(inner) => walk(inner, 0, captures),
        PartType::Text(text) => {
            if captures.plain.is_none() && is_plain_text(part) {
                captures.plain = Some(text.to_string());
            }
        }
        PartType::Html(html) => {
            if captures.html.is_none() {
                captures.html = Some(html.to_string());
            }
        }
        PartType::Binary(_) | PartType::InlineBinary(_) => {}
    }
}

/// A text leaf counts as plain when it is `text/plain` or has no content type.
fn is_plain_text(part: &mail_parser::MessagePart<'_>) -> bool {
    match part.content_type() {
        None => true,
        Some(ct) => {
            ct.ctype().eq_ignore_ascii_case("text")
                && ct.subtype().is_none_or(|s| s.eq_ignore_ascii_case("plain"))
        }
    }
}

/// Parse raw bytes into an [`InboundMail`]. `None` if the bytes are not a message.
pub fn parse_inbound(id: &str, raw: &[u8]) -> Option<InboundMail> {
    let parsed = MessageParser::default().parse(raw)?;

    let sender = parsed.from().and_then(|addr| addr.first());
    let from_address = sender
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into());
    let from_display = match (sender.and_then(|a| a.name()), sender.and_then(|a| a.address())) {
        (Some(name), Some(address)) => format!("{name} <{address}>"),
        (None, Some(address)) => address.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => "unknown".to_string(),
    };

    Some(InboundMail {
        id: id.to_string(),
        from_address,
        from_display,
        subject: parsed.subject().unwrap_or("(no subject)").to_string(),
        body: extract_body(&parsed),
    })
}
