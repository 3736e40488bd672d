//! Collaborator adapters: mailbox, mail sender and chat transport.

pub mod channel;
pub mod email;
pub mod telegram;

pub use channel::*;
pub use email::{ImapMailbox, SmtpSender};
pub use telegram::TelegramChannel;
