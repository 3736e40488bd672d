//! Operator approval workflow.

pub mod dispatcher;
pub mod machine;

pub use dispatcher::Dispatcher;
pub use machine::{ApprovalMachine, spawn_revision_sweeper};
