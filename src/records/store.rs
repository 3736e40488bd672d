//! Record store: bounded in-memory map of message records plus pending revisions.
//!
//! Every check-and-transition happens under one write guard and never awaits
//! I/O while holding it, so concurrent operator actions on the same id see a
//! consistent state and at most one of them wins.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info};

use super::model::{ApprovalAction, ApprovalState, MessageRecord, PromptRef};
use crate::error::ApprovalError;
use crate::pipeline::types::Verdict;

/// A session waiting to send revision text for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRevision {
    pub session: String,
    pub record_id: String,
    pub requested_at: Instant,
}

/// Result of inserting a freshly classified record.
#[derive(Debug, Clone)]
pub enum UpsertOutcome {
    /// No record existed for the id.
    Created(MessageRecord),
    /// An in-flight record was overwritten and returned to `Proposed`.
    Refreshed(MessageRecord),
    /// The existing record is terminal or mid-send and was left alone.
    Skipped(ApprovalState),
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, MessageRecord>,
    /// session → pending revision
    pending: HashMap<String, PendingRevision>,
}

pub struct RecordStore {
    inner: RwLock<Inner>,
    capacity: usize,
}

impl RecordStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            capacity,
        }
    }

    /// Insert a `Proposed` record, or refresh the draft of a non-terminal one.
    pub async fn upsert_proposed(&self, record: MessageRecord) -> UpsertOutcome {
        let mut guard = self.inner.write().await;
        let Inner { records, pending } = &mut *guard;

        let outcome = match records.get_mut(&record.id) {
            Some(existing)
                if existing.state.is_terminal() || existing.state == ApprovalState::Sending =>
            {
                debug!(id = %record.id, state = %existing.state, "Record not reopened");
                return UpsertOutcome::Skipped(existing.state);
            }
            Some(existing) => {
                existing.draft_reply = record.draft_reply;
                existing.action_suggestion = record.action_suggestion;
                existing.chat_id = record.chat_id;
                existing.state = ApprovalState::Proposed;
                if let Some(session) = existing.revision_session.take()
                    && pending
                        .get(&session)
                        .is_some_and(|p| p.record_id == existing.id)
                {
                    pending.remove(&session);
                }
                existing.touch();
                UpsertOutcome::Refreshed(existing.clone())
            }
            None => {
                records.insert(record.id.clone(), record.clone());
                UpsertOutcome::Created(record)
            }
        };

        evict_terminal(records, self.capacity);
        outcome
    }

    pub async fn get(&self, id: &str) -> Option<MessageRecord> {
        self.inner.read().await.records.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.records.is_empty()
    }

    /// Move `id` from `from` to `to`, or fail without touching it.
    pub async fn transition(
        &self,
        id: &str,
        from: ApprovalState,
        to: ApprovalState,
        action: ApprovalAction,
    ) -> Result<MessageRecord, ApprovalError> {
        let mut guard = self.inner.write().await;
        let record = guard
            .records
            .get_mut(id)
            .ok_or_else(|| ApprovalError::NotFound { id: id.to_string() })?;

        if record.state != from {
            return Err(invalid_transition(record, action));
        }

        record.state = to;
        record.touch();
        debug!(id = %id, from = %from, to = %to, "Record transitioned");
        Ok(record.clone())
    }

    pub async fn set_prompt(&self, id: &str, prompt: PromptRef) {
        if let Some(record) = self.inner.write().await.records.get_mut(id) {
            record.prompt = Some(prompt);
        }
    }

    /// `Proposed → AwaitingRevisionText`, owned by `session`.
    ///
    /// A session holds one pending revision; a different record it was
    /// waiting on goes back to `Proposed` and is returned as the second value.
    pub async fn begin_revision(
        &self,
        id: &str,
        session: &str,
        now: Instant,
    ) -> Result<(MessageRecord, Option<MessageRecord>), ApprovalError> {
        let mut guard = self.inner.write().await;
        let Inner { records, pending } = &mut *guard;

        let record = records
            .get(id)
            .ok_or_else(|| ApprovalError::NotFound { id: id.to_string() })?;
        if record.state != ApprovalState::Proposed {
            return Err(invalid_transition(record, ApprovalAction::Revise));
        }

        let superseded = pending.remove(session).and_then(|prev| {
            let previous = records.get_mut(&prev.record_id)?;
            release_revision(previous);
            Some(previous.clone())
        });

        let record = records
            .get_mut(id)
            .ok_or_else(|| ApprovalError::NotFound { id: id.to_string() })?;
        record.state = ApprovalState::AwaitingRevisionText;
        record.revision_session = Some(session.to_string());
        record.touch();
        pending.insert(
            session.to_string(),
            PendingRevision {
                session: session.to_string(),
                record_id: id.to_string(),
                requested_at: now,
            },
        );

        Ok((record.clone(), superseded))
    }

    /// Take the session's pending revision for an in-flight submit.
    ///
    /// An expired request is released back to `Proposed` and reported as
    /// [`ApprovalError::RevisionExpired`].
    pub async fn take_revision(
        &self,
        session: &str,
        now: Instant,
        timeout: Duration,
    ) -> Result<(MessageRecord, PendingRevision), ApprovalError> {
        let mut guard = self.inner.write().await;
        let Inner { records, pending } = &mut *guard;

        let rev = pending
            .remove(session)
            .ok_or_else(|| ApprovalError::NoPendingRevision {
                session: session.to_string(),
            })?;
        let record = records
            .get_mut(&rev.record_id)
            .ok_or_else(|| ApprovalError::NotFound {
                id: rev.record_id.clone(),
            })?;

        if record.state != ApprovalState::AwaitingRevisionText
            || record.revision_session.as_deref() != Some(session)
        {
            return Err(ApprovalError::SessionMismatch {
                id: record.id.clone(),
                session: session.to_string(),
            });
        }

        if now.saturating_duration_since(rev.requested_at) > timeout {
            release_revision(record);
            return Err(ApprovalError::RevisionExpired {
                id: record.id.clone(),
            });
        }

        Ok((record.clone(), rev))
    }

    /// Apply a revised draft and return the record to `Proposed`.
    pub async fn complete_revision(
        &self,
        id: &str,
        session: &str,
        verdict: Verdict,
    ) -> Result<MessageRecord, ApprovalError> {
        let mut guard = self.inner.write().await;
        let record = guard
            .records
            .get_mut(id)
            .ok_or_else(|| ApprovalError::NotFound { id: id.to_string() })?;

        if record.state != ApprovalState::AwaitingRevisionText
            || record.revision_session.as_deref() != Some(session)
        {
            return Err(invalid_transition(record, ApprovalAction::Revise));
        }

        record.draft_reply = verdict.draft_reply;
        record.action_suggestion = verdict.action;
        record.state = ApprovalState::Proposed;
        record.revision_session = None;
        record.revision_count += 1;
        record.touch();
        info!(id = %id, revisions = record.revision_count, "Draft revised");
        Ok(record.clone())
    }

    /// Put back a revision taken by a submit that failed.
    ///
    /// If the session has meanwhile started another revision, the record is
    /// released to `Proposed` instead.
    pub async fn restore_revision(&self, rev: PendingRevision) {
        let mut guard = self.inner.write().await;
        let Inner { records, pending } = &mut *guard;

        let Some(record) = records.get_mut(&rev.record_id) else {
            return;
        };
        if record.state != ApprovalState::AwaitingRevisionText
            || record.revision_session.as_deref() != Some(rev.session.as_str())
        {
            return;
        }
        if pending.contains_key(&rev.session) {
            release_revision(record);
        } else {
            pending.insert(rev.session.clone(), rev);
        }
    }

    /// Undo `begin_revision` for `id`. Returns `false` if `session` no longer
    /// waits on that record.
    pub async fn abandon_revision(&self, id: &str, session: &str) -> bool {
        let mut guard = self.inner.write().await;
        let Inner { records, pending } = &mut *guard;

        if !pending.get(session).is_some_and(|p| p.record_id == id) {
            return false;
        }
        pending.remove(session);
        if let Some(record) = records.get_mut(id) {
            release_revision(record);
        }
        true
    }

    /// Drop the session's pending revision, returning its record to `Proposed`.
    pub async fn cancel_revision(&self, session: &str) -> Result<MessageRecord, ApprovalError> {
        let mut guard = self.inner.write().await;
        let Inner { records, pending } = &mut *guard;

        let rev = pending
            .remove(session)
            .ok_or_else(|| ApprovalError::NoPendingRevision {
                session: session.to_string(),
            })?;
        let record = records
            .get_mut(&rev.record_id)
            .ok_or_else(|| ApprovalError::NotFound {
                id: rev.record_id.clone(),
            })?;
        release_revision(record);
        Ok(record.clone())
    }

    /// Release every pending revision older than `timeout`.
    /// Returns `(session, record)` for each.
    pub async fn expire_revisions(
        &self,
        now: Instant,
        timeout: Duration,
    ) -> Vec<(String, MessageRecord)> {
        let mut guard = self.inner.write().await;
        let Inner { records, pending } = &mut *guard;

        let stale: Vec<String> = pending
            .values()
            .filter(|p| now.saturating_duration_since(p.requested_at) > timeout)
            .map(|p| p.session.clone())
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for session in stale {
            let Some(rev) = pending.remove(&session) else {
                continue;
            };
            if let Some(record) = records.get_mut(&rev.record_id) {
                release_revision(record);
                debug!(id = %record.id, session = %session, "Revision request expired");
                expired.push((session, record.clone()));
            }
        }
        expired
    }
}

fn invalid_transition(record: &MessageRecord, action: ApprovalAction) -> ApprovalError {
    ApprovalError::InvalidTransition {
        id: record.id.clone(),
        state: record.state.to_string(),
        action: action.to_string(),
    }
}

/// `AwaitingRevisionText → Proposed`; anything else is left as is.
fn release_revision(record: &mut MessageRecord) {
    if record.state == ApprovalState::AwaitingRevisionText {
        record.state = ApprovalState::Proposed;
        record.revision_session = None;
        record.touch();
    }
}

/// Remove the oldest terminal records until the map fits `capacity`.
/// Non-terminal records are never evicted, even if that leaves it over.
fn evict_terminal(records: &mut HashMap<String, MessageRecord>, capacity: usize) {
    if records.len() <= capacity {
        return;
    }
    let mut terminal: Vec<_> = records
        .values()
        .filter(|r| r.state.is_terminal())
        .map(|r| (r.updated_at, r.id.clone()))
        .collect();
    terminal.sort();

    let excess = records.len() - capacity;
    let mut evicted = 0;
    for (_, id) in terminal.into_iter().take(excess) {
        records.remove(&id);
        evicted += 1;
    }
    if evicted > 0 {
        debug!(count = evicted, "Evicted terminal records");
    }
}
