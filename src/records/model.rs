//! Message record data model: approval states, operator actions and button payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApprovalError;
use crate::pipeline::types::{InboundMail, Verdict};

/// Lifecycle state of a message record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    /// Prompt is out, waiting for the operator.
    Proposed,
    /// Approved; the reply is being transmitted.
    Sending,
    /// Waiting for the operator's revision text.
    AwaitingRevisionText,
    /// Reply was sent. Terminal.
    Sent,
    /// Operator dismissed the message. Terminal.
    Dismissed,
}

impl ApprovalState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Dismissed)
    }
}

impl std::fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proposed => write!(f, "proposed"),
            Self::Sending => write!(f, "being sent"),
            Self::AwaitingRevisionText => write!(f, "awaiting a revision"),
            Self::Sent => write!(f, "sent"),
            Self::Dismissed => write!(f, "dismissed"),
        }
    }
}

/// Operator action on a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Approve,
    Dismiss,
    Revise,
}

impl std::fmt::Display for ApprovalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::Dismiss => write!(f, "dismiss"),
            Self::Revise => write!(f, "revise"),
        }
    }
}

impl std::str::FromStr for ApprovalAction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "dismiss" => Ok(Self::Dismiss),
            "revise" => Ok(Self::Revise),
            _ => Err(format!("Unknown action: {s}")),
        }
    }
}

/// Button payload: `"<action>:<id>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionPayload {
    pub action: ApprovalAction,
    pub id: String,
}

impl ActionPayload {
    pub fn new(action: ApprovalAction, id: impl Into<String>) -> Self {
        Self {
            action,
            id: id.into(),
        }
    }

    pub fn encode(&self) -> String {
        format!("{}:{}", self.action, self.id)
    }

    /// Parse a payload. The id is everything after the first `:`.
    pub fn parse(data: &str) -> Result<Self, ApprovalError> {
        let (action, id) = data
            .split_once(':')
            .ok_or_else(|| ApprovalError::InvalidPayload(data.to_string()))?;
        let action = action
            .parse()
            .map_err(|_| ApprovalError::InvalidPayload(data.to_string()))?;
        if id.is_empty() {
            return Err(ApprovalError::InvalidPayload(data.to_string()));
        }
        Ok(Self::new(action, id))
    }
}

/// Where a record's prompt was delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRef {
    pub chat_id: String,
    pub message_id: i64,
}

/// Everything known about one prompted message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Mailbox-assigned id; the store key.
    pub id: String,
    pub from_address: String,
    pub from_display: String,
    pub subject: String,
    /// Original extracted body. Revisions are always drafted from this.
    pub body: String,
    pub draft_reply: String,
    pub action_suggestion: String,
    pub state: ApprovalState,
    /// Operator chat the prompt belongs to.
    pub chat_id: String,
    /// Most recent prompt message, if delivery succeeded.
    pub prompt: Option<PromptRef>,
    /// Session owning the pending revision while `AwaitingRevisionText`.
    pub revision_session: Option<String>,
    pub revision_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageRecord {
    /// New `Proposed` record from a parsed message and its verdict.
    pub fn new(mail: InboundMail, verdict: Verdict, chat_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: mail.id,
            from_address: mail.from_address,
            from_display: mail.from_display,
            subject: mail.subject,
            body: mail.body,
            draft_reply: verdict.draft_reply,
            action_suggestion: verdict.action,
            state: ApprovalState::Proposed,
            chat_id: chat_id.into(),
            prompt: None,
            revision_session: None,
            revision_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
