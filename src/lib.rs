//! Inbox triage: classifies unseen mail and drafts replies for operator approval.

pub mod approval;
pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod records;
