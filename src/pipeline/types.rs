//! Shared types for the triage pipeline.

use serde::{Deserialize, Serialize};

// ── Inbound mail ────────────────────────────────────────────────────

/// One parsed mailbox message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMail {
    /// Mailbox-assigned id (IMAP UID).
    pub id: String,
    /// Bare sender address, used as the reply recipient.
    pub from_address: String,
    /// `From` header as shown to the operator.
    pub from_display: String,
    pub subject: String,
    /// Extracted plain-text body, untruncated.
    pub body: String,
}

// ── Verdict ─────────────────────────────────────────────────────────

/// Classifier decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    #[serde(rename = "important")]
    Important,
    #[serde(rename = "not important")]
    NotImportant,
}

impl Decision {
    pub fn is_important(self) -> bool {
        matches!(self, Self::Important)
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Important => write!(f, "important"),
            Self::NotImportant => write!(f, "not important"),
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "important" => Ok(Self::Important),
            "not important" => Ok(Self::NotImportant),
            _ => Err(format!("Unknown decision: {s}")),
        }
    }
}

/// Parsed classifier output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub decision: Decision,
    /// Suggested next step shown to the operator.
    pub action: String,
    pub draft_reply: String,
}

// ── Tick report ─────────────────────────────────────────────────────

/// Outcome counters for one poll tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    /// Ids returned by the mailbox listing.
    pub listed: usize,
    /// Ids skipped because they were already evaluated.
    pub skipped: usize,
    /// Messages classified successfully.
    pub evaluated: usize,
    /// Of those, how many were important.
    pub important: usize,
    /// Fetch, parse or classification failures.
    pub failed: usize,
}
