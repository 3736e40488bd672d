//! Collaborator traits and the operator event model.
//!
//! The triage core only sees these traits; IMAP, SMTP and Telegram live
//! behind them so tests can substitute in-memory stubs.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::ChannelError;
use crate::records::compose::OutgoingMail;

/// Source of unseen mail.
#[async_trait]
pub trait MailboxClient: Send + Sync {
    /// Ids of unseen messages, in mailbox order.
    async fn list_unseen(&self) -> Result<Vec<String>, ChannelError>;

    /// Raw RFC 5322 bytes of one message.
    async fn fetch_raw(&self, id: &str) -> Result<Vec<u8>, ChannelError>;

    /// Flag messages as seen on the server.
    async fn mark_seen(&self, ids: &[String]) -> Result<(), ChannelError>;
}

/// Outbound mail submission.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), ChannelError>;
}

/// A selectable action attached to a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptButton {
    pub label: String,
    /// Opaque payload echoed back in [`OperatorEvent::Action`].
    pub data: String,
}

impl PromptButton {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// Operator-facing chat transport.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send a prompt with buttons laid out in rows. Returns the message id.
    async fn send_prompt(
        &self,
        chat_id: &str,
        text: &str,
        buttons: &[Vec<PromptButton>],
    ) -> Result<i64, ChannelError>;

    /// Replace the text of a previously sent message, removing its buttons.
    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: i64,
        text: &str,
    ) -> Result<(), ChannelError>;

    /// Send a plain text message.
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), ChannelError>;

    /// Acknowledge a button press so the client stops its spinner.
    async fn acknowledge(&self, callback_id: &str) -> Result<(), ChannelError>;
}

/// Something the operator did in the chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorEvent {
    /// `/start`: begin periodic mailbox checks for this chat.
    Start { chat_id: String },
    /// `/stop`: end periodic mailbox checks for this chat.
    Stop { chat_id: String },
    /// `/cancel`: abandon the pending revision request.
    CancelRevision { chat_id: String },
    /// A prompt button was pressed.
    Action {
        chat_id: String,
        callback_id: String,
        prompt_message_id: Option<i64>,
        data: String,
    },
    /// Any other text.
    FreeText { chat_id: String, text: String },
}

impl OperatorEvent {
    pub fn chat_id(&self) -> &str {
        match self {
            Self::Start { chat_id }
            | Self::Stop { chat_id }
            | Self::CancelRevision { chat_id }
            | Self::Action { chat_id, .. }
            | Self::FreeText { chat_id, .. } => chat_id,
        }
    }
}

/// Stream of operator events produced by a transport listener.
pub type OperatorStream = Pin<Box<dyn Stream<Item = OperatorEvent> + Send>>;
