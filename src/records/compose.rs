//! Reply composer: turns an approved draft into an outgoing mail.

use serde::{Deserialize, Serialize};

/// Footer appended to every reply.
pub const AI_DISCLOSURE: &str =
    "PS: This email was written by my automated AI secretary. Apologies for any weirdness.";

/// Body encoding of a composed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyFormat {
    Html,
    Plain,
}

/// Fixed sender of all replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderIdentity {
    pub name: String,
    pub address: String,
}

/// A fully rendered reply, ready for the mail sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMail {
    pub from: SenderIdentity,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub format: BodyFormat,
}

/// Renders replies for one fixed sender.
#[derive(Debug, Clone)]
pub struct ReplyComposer {
    sender: SenderIdentity,
    format: BodyFormat,
}

impl ReplyComposer {
    pub fn new(sender: SenderIdentity, format: BodyFormat) -> Self {
        Self { sender, format }
    }

    /// Compose a reply to `to` for a message with the given subject.
    pub fn compose(&self, to: &str, subject: &str, body: &str) -> OutgoingMail {
        OutgoingMail {
            from: self.sender.clone(),
            to: to.to_string(),
            subject: reply_subject(subject),
            body: render_body(body, self.format),
            format: self.format,
        }
    }
}

/// `"Re: "` + subject, without collapsing existing prefixes.
pub fn reply_subject(subject: &str) -> String {
    format!("Re: {subject}")
}

/// Append the disclosure footer in the given format.
pub fn render_body(body: &str, format: BodyFormat) -> String {
    match format {
        BodyFormat::Html => format!("{body}<br><br><p>{AI_DISCLOSURE}</p>"),
        BodyFormat::Plain => format!("{body}\n\n{AI_DISCLOSURE}"),
    }
}
