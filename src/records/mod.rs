//! Message records: per-message approval state, storage and reply rendering.

pub mod compose;
pub mod model;
pub mod store;

pub use compose::{BodyFormat, OutgoingMail, ReplyComposer, SenderIdentity};
pub use model::{ActionPayload, ApprovalAction, ApprovalState, MessageRecord, PromptRef};
pub use store::{PendingRevision, RecordStore, UpsertOutcome};
