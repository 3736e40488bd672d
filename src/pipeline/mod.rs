//! Triage pipeline.
//!
//! Every unseen message flows through:
//! 1. `extract`: pick a plain-text body out of the MIME tree
//! 2. `truncate`: bound it for the classifier
//! 3. `classifier`: LLM verdict: important or not, plus a draft reply
//! 4. `poller`: hands important messages to the approval state machine
//!
//! **No auto-reply path exists.** Every outbound reply needs operator approval.

pub mod classifier;
pub mod extract;
pub mod poller;
pub mod truncate;
pub mod types;

pub use classifier::ClassifierGateway;
pub use poller::{MailboxPoller, SeenIds, SubscriptionRegistry};
pub use types::{Decision, InboundMail, TickReport, Verdict};
