//! Approval state machine: prompts, operator actions and the revision loop.
//!
//! State lives in the [`RecordStore`]; this type adds the I/O around each
//! transition. A transition that locks a record is committed before the
//! network call it triggers, and rolled back if that call fails. A new draft
//! is committed only after the prompt showing it has been delivered.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::channel::{ChatTransport, MailSender, PromptButton};
use crate::config::TriageConfig;
use crate::error::ApprovalError;
use crate::pipeline::classifier::ClassifierGateway;
use crate::pipeline::truncate::{TRUNCATION_MARKER, truncate};
use crate::pipeline::types::{InboundMail, Verdict};
use crate::records::compose::ReplyComposer;
use crate::records::model::{
    ActionPayload, ApprovalAction, ApprovalState, MessageRecord, PromptRef,
};
use crate::records::store::{RecordStore, UpsertOutcome};

/// Chat transport message length limit.
const PROMPT_LIMIT: usize = 4096;

/// Sent after the operator presses "Request Revision".
pub const REVISION_REQUEST_TEXT: &str =
    "Please send your detailed revision request. Type it out and send.";

/// Prompt body for a record.
pub fn render_prompt(record: &MessageRecord) -> String {
    let text = format!(
        "From: {}\nSubject: {}\n\nSuggested Action: {}\n\nDraft reply:\n{}",
        record.from_display, record.subject, record.action_suggestion, record.draft_reply
    );
    truncate(&text, PROMPT_LIMIT - TRUNCATION_MARKER.chars().count())
}

/// Approve / Dismiss on the first row, Request Revision on the second.
pub fn prompt_buttons(id: &str) -> Vec<Vec<PromptButton>> {
    let button = |label: &str, action: ApprovalAction| {
        PromptButton::new(label, ActionPayload::new(action, id).encode())
    };
    vec![
        vec![
            button("Approve Reply", ApprovalAction::Approve),
            button("Dismiss", ApprovalAction::Dismiss),
        ],
        vec![button("Request Revision", ApprovalAction::Revise)],
    ]
}

pub struct ApprovalMachine {
    store: Arc<RecordStore>,
    classifier: Arc<ClassifierGateway>,
    composer: ReplyComposer,
    sender: Arc<dyn MailSender>,
    transport: Arc<dyn ChatTransport>,
    max_input_chars: usize,
    revision_timeout: Duration,
}

impl ApprovalMachine {
    pub fn new(
        store: Arc<RecordStore>,
        classifier: Arc<ClassifierGateway>,
        composer: ReplyComposer,
        sender: Arc<dyn MailSender>,
        transport: Arc<dyn ChatTransport>,
        triage: &TriageConfig,
    ) -> Self {
        Self {
            store,
            classifier,
            composer,
            sender,
            transport,
            max_input_chars: triage.max_input_chars,
            revision_timeout: triage.revision_timeout,
        }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    // ── Transitions ─────────────────────────────────────────────────

    /// Store an important message as `Proposed` and prompt the operator.
    ///
    /// A record that is already closed is left alone. A new record is kept
    /// even if its prompt cannot be delivered. An open record only takes the
    /// new draft once the prompt showing it is out, so its earlier prompt
    /// never approves a draft the operator has not seen.
    pub async fn create(
        &self,
        mail: InboundMail,
        verdict: Verdict,
        chat_id: &str,
    ) -> Result<(), ApprovalError> {
        let id = mail.id.clone();
        let candidate = MessageRecord::new(mail, verdict, chat_id);

        match self.store.get(&id).await {
            Some(existing)
                if existing.state.is_terminal() || existing.state == ApprovalState::Sending =>
            {
                info!(id = %id, state = %existing.state, "Record already closed, not prompting again");
                Ok(())
            }
            Some(existing) => {
                let prompt = self.deliver_prompt(&candidate).await.inspect_err(|e| {
                    error!(id = %id, error = %e, "Failed to deliver refreshed prompt");
                })?;
                match self.store.upsert_proposed(candidate).await {
                    UpsertOutcome::Created(_) | UpsertOutcome::Refreshed(_) => {
                        info!(id = %id, chat_id = %chat_id, "Existing record refreshed");
                        self.store.set_prompt(&id, prompt.clone()).await;
                        self.supersede_prompt(&existing, &prompt).await;
                    }
                    UpsertOutcome::Skipped(state) => {
                        self.retract_prompt(&prompt, &format!("'{}' is already {state}.", existing.subject))
                            .await;
                    }
                }
                Ok(())
            }
            None => match self.store.upsert_proposed(candidate).await {
                UpsertOutcome::Created(record) | UpsertOutcome::Refreshed(record) => {
                    info!(id = %id, chat_id = %chat_id, "New record proposed");
                    let prompt = self.deliver_prompt(&record).await.inspect_err(|e| {
                        error!(id = %id, error = %e, "Failed to deliver prompt");
                    })?;
                    self.store.set_prompt(&id, prompt).await;
                    Ok(())
                }
                UpsertOutcome::Skipped(state) => {
                    info!(id = %id, state = %state, "Record already closed, not prompting again");
                    Ok(())
                }
            },
        }
    }

    /// Compose and send the draft. `Proposed → Sending → Sent`.
    ///
    /// A failed send returns the record to `Proposed`; nothing is retried.
    pub async fn approve(
        &self,
        id: &str,
        clicked: Option<PromptRef>,
    ) -> Result<MessageRecord, ApprovalError> {
        let record = self
            .store
            .transition(id, ApprovalState::Proposed, ApprovalState::Sending, ApprovalAction::Approve)
            .await?;

        let mail = self
            .composer
            .compose(&record.from_address, &record.subject, &record.draft_reply);

        if let Err(source) = self.sender.send(&mail).await {
            error!(id = %id, error = %source, "Reply send failed");
            if let Err(e) = self
                .store
                .transition(id, ApprovalState::Sending, ApprovalState::Proposed, ApprovalAction::Approve)
                .await
            {
                warn!(id = %id, error = %e, "Could not roll back after failed send");
            }
            return Err(ApprovalError::SendFailed {
                id: id.to_string(),
                source,
            });
        }

        let record = self
            .store
            .transition(id, ApprovalState::Sending, ApprovalState::Sent, ApprovalAction::Approve)
            .await?;
        info!(id = %id, to = %record.from_address, "Reply sent");

        self.replace_prompt(&record, clicked, &format!("Reply to '{}' sent.", record.subject))
            .await;
        Ok(record)
    }

    /// `Proposed → Dismissed`.
    pub async fn dismiss(
        &self,
        id: &str,
        clicked: Option<PromptRef>,
    ) -> Result<MessageRecord, ApprovalError> {
        let record = self
            .store
            .transition(id, ApprovalState::Proposed, ApprovalState::Dismissed, ApprovalAction::Dismiss)
            .await?;
        info!(id = %id, "Record dismissed");

        self.replace_prompt(&record, clicked, &format!("'{}' dismissed.", record.subject))
            .await;
        Ok(record)
    }

    /// `Proposed → AwaitingRevisionText`, owned by `session`.
    pub async fn revise(&self, id: &str, session: &str) -> Result<MessageRecord, ApprovalError> {
        let (record, superseded) = self
            .store
            .begin_revision(id, session, Instant::now())
            .await?;
        info!(id = %id, session = %session, "Awaiting revision text");

        if let Some(previous) = superseded {
            debug!(id = %previous.id, "Previous revision request superseded");
            self.notify(
                session,
                &format!(
                    "Revision request for '{}' cancelled; its prompt is active again.",
                    previous.subject
                ),
            )
            .await;
        }

        if let Err(e) = self.transport.send_text(session, REVISION_REQUEST_TEXT).await {
            error!(id = %id, error = %e, "Revision request not delivered");
            if !self.store.abandon_revision(id, session).await {
                warn!(id = %id, session = %session, "Revision already released");
            }
            return Err(e.into());
        }
        Ok(record)
    }

    /// Apply the operator's revision text and re-prompt with the new draft.
    ///
    /// Revisions are drafted from the original body, never the current draft.
    /// The draft is only committed once its prompt is delivered; until then
    /// the record keeps waiting for text and the old draft stands.
    pub async fn submit_revision_text(
        &self,
        session: &str,
        text: &str,
    ) -> Result<MessageRecord, ApprovalError> {
        let (record, pending) = self
            .store
            .take_revision(session, Instant::now(), self.revision_timeout)
            .await?;

        let body = truncate(&record.body, self.max_input_chars);
        let verdict = match self.classifier.revise_draft(&body, text).await {
            Ok(verdict) => verdict,
            Err(source) => {
                error!(id = %record.id, error = %source, "Revision failed");
                self.store.restore_revision(pending).await;
                return Err(ApprovalError::RevisionFailed {
                    id: record.id,
                    source,
                });
            }
        };

        let mut candidate = record.clone();
        candidate.draft_reply.clone_from(&verdict.draft_reply);
        candidate.action_suggestion.clone_from(&verdict.action);
        let prompt = match self.deliver_prompt(&candidate).await {
            Ok(prompt) => prompt,
            Err(e) => {
                error!(id = %record.id, error = %e, "Revised prompt not delivered");
                self.store.restore_revision(pending).await;
                return Err(e);
            }
        };

        let updated = match self.store.complete_revision(&record.id, session, verdict).await {
            Ok(updated) => updated,
            Err(e) => {
                self.retract_prompt(&prompt, &format!("Revision of '{}' was discarded.", record.subject))
                    .await;
                return Err(e);
            }
        };
        self.store.set_prompt(&updated.id, prompt.clone()).await;
        self.supersede_prompt(&record, &prompt).await;
        Ok(MessageRecord {
            prompt: Some(prompt),
            ..updated
        })
    }

    /// `/cancel`: drop the session's pending revision.
    pub async fn cancel_revision(&self, session: &str) -> Result<MessageRecord, ApprovalError> {
        let record = self.store.cancel_revision(session).await?;
        info!(id = %record.id, session = %session, "Revision request cancelled");
        self.transport
            .send_text(
                session,
                &format!("Revision request for '{}' cancelled.", record.subject),
            )
            .await?;
        Ok(record)
    }

    /// Release pending revisions older than the timeout and tell their sessions.
    pub async fn expire_stale_revisions(&self) -> usize {
        self.expire_stale_revisions_at(Instant::now()).await
    }

    pub async fn expire_stale_revisions_at(&self, now: Instant) -> usize {
        let expired = self.store.expire_revisions(now, self.revision_timeout).await;
        for (session, record) in &expired {
            info!(id = %record.id, session = %session, "Revision request timed out");
            let err = ApprovalError::RevisionExpired {
                id: record.id.clone(),
            };
            self.notify(session, &err.user_message()).await;
        }
        expired.len()
    }

    // ── Operator entry points ───────────────────────────────────────

    /// Handle a button press. Errors are reported to the chat, never returned.
    pub async fn handle_action(
        &self,
        chat_id: &str,
        callback_id: &str,
        prompt_message_id: Option<i64>,
        data: &str,
    ) {
        if let Err(e) = self.transport.acknowledge(callback_id).await {
            warn!(callback_id = %callback_id, error = %e, "Failed to acknowledge callback");
        }

        let clicked = prompt_message_id.map(|message_id| PromptRef {
            chat_id: chat_id.to_string(),
            message_id,
        });

        let result = match ActionPayload::parse(data) {
            Ok(ActionPayload { action, id }) => {
                debug!(id = %id, action = %action, "Operator action");
                match action {
                    ApprovalAction::Approve => self.approve(&id, clicked).await,
                    ApprovalAction::Dismiss => self.dismiss(&id, clicked).await,
                    ApprovalAction::Revise => self.revise(&id, chat_id).await,
                }
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            self.report(chat_id, &e).await;
        }
    }

    /// Handle free text: it is only meaningful as revision text.
    pub async fn handle_free_text(&self, chat_id: &str, text: &str) {
        if let Err(e) = self.submit_revision_text(chat_id, text).await {
            self.report(chat_id, &e).await;
        }
    }

    /// Handle `/cancel`.
    pub async fn handle_cancel(&self, chat_id: &str) {
        if let Err(e) = self.cancel_revision(chat_id).await {
            self.report(chat_id, &e).await;
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    /// Send the prompt for `record`. Storing the reference is up to the caller.
    async fn deliver_prompt(&self, record: &MessageRecord) -> Result<PromptRef, ApprovalError> {
        let message_id = self
            .transport
            .send_prompt(&record.chat_id, &render_prompt(record), &prompt_buttons(&record.id))
            .await?;
        Ok(PromptRef {
            chat_id: record.chat_id.clone(),
            message_id,
        })
    }

    /// Strip the buttons from `previous`'s prompt once `current` replaces it.
    async fn supersede_prompt(&self, previous: &MessageRecord, current: &PromptRef) {
        let Some(old) = previous.prompt.as_ref().filter(|old| *old != current) else {
            return;
        };
        let text = format!("Draft for '{}' was replaced by a newer prompt.", previous.subject);
        if let Err(e) = self.transport.edit_message(&old.chat_id, old.message_id, &text).await {
            warn!(id = %previous.id, error = %e, "Failed to retire old prompt");
        }
    }

    /// Replace a prompt that lost its record before it could be stored.
    async fn retract_prompt(&self, prompt: &PromptRef, text: &str) {
        if let Err(e) = self
            .transport
            .edit_message(&prompt.chat_id, prompt.message_id, text)
            .await
        {
            warn!(message_id = prompt.message_id, error = %e, "Failed to retract prompt");
        }
    }

    /// Replace the prompt with a final notice, falling back to a new message.
    async fn replace_prompt(&self, record: &MessageRecord, clicked: Option<PromptRef>, text: &str) {
        let Some(target) = clicked.or_else(|| record.prompt.clone()) else {
            self.notify(&record.chat_id, text).await;
            return;
        };
        if let Err(e) = self
            .transport
            .edit_message(&target.chat_id, target.message_id, text)
            .await
        {
            warn!(id = %record.id, error = %e, "Failed to edit prompt");
            self.notify(&target.chat_id, text).await;
        }
    }

    async fn notify(&self, chat_id: &str, text: &str) {
        if let Err(e) = self.transport.send_text(chat_id, text).await {
            error!(chat_id = %chat_id, error = %e, "Failed to send message to operator");
        }
    }

    async fn report(&self, chat_id: &str, err: &ApprovalError) {
        warn!(chat_id = %chat_id, error = %err, "Operator action rejected");
        self.notify(chat_id, &err.user_message()).await;
    }
}

/// Spawn a background task that periodically expires stale revision requests.
pub fn spawn_revision_sweeper(machine: Arc<ApprovalMachine>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let expired = machine.expire_stale_revisions().await;
            if expired > 0 {
                info!(count = expired, "Expired revision requests");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

    use async_trait::async_trait;
    use tokio::sync::{Mutex, Notify};

    use crate::error::{ChannelError, LlmError};
    use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};
    use crate::pipeline::types::Decision;
    use crate::records::compose::{BodyFormat, OutgoingMail, SenderIdentity};

    // ── Stubs ───────────────────────────────────────────────────────

    #[derive(Default)]
    struct StubTransport {
        next_id: AtomicI64,
        prompts: Mutex<Vec<(String, String, Vec<Vec<PromptButton>>)>>,
        edits: Mutex<Vec<(i64, String)>>,
        texts: Mutex<Vec<(String, String)>>,
        acks: Mutex<Vec<String>>,
        fail_prompts: AtomicBool,
        fail_texts: AtomicBool,
    }

    fn unreachable() -> ChannelError {
        ChannelError::SendFailed {
            name: "stub".into(),
            reason: "chat unreachable".into(),
        }
    }

    #[async_trait]
    impl ChatTransport for StubTransport {
        async fn send_prompt(
            &self,
            chat_id: &str,
            text: &str,
            buttons: &[Vec<PromptButton>],
        ) -> Result<i64, ChannelError> {
            if self.fail_prompts.load(Ordering::SeqCst) {
                return Err(unreachable());
            }
            self.prompts
                .lock()
                .await
                .push((chat_id.into(), text.into(), buttons.to_vec()));
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 100)
        }

        async fn edit_message(&self, _chat_id: &str, message_id: i64, text: &str) -> Result<(), ChannelError> {
            self.edits.lock().await.push((message_id, text.into()));
            Ok(())
        }

        async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
            if self.fail_texts.load(Ordering::SeqCst) {
                return Err(unreachable());
            }
            self.texts.lock().await.push((chat_id.into(), text.into()));
            Ok(())
        }

        async fn acknowledge(&self, callback_id: &str) -> Result<(), ChannelError> {
            self.acks.lock().await.push(callback_id.into());
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubSender {
        sent: Mutex<Vec<OutgoingMail>>,
        fail: AtomicBool,
        entered: Notify,
        gate: Option<Notify>,
    }

    #[async_trait]
    impl MailSender for StubSender {
        async fn send(&self, mail: &OutgoingMail) -> Result<(), ChannelError> {
            self.entered.notify_one();
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(ChannelError::SendFailed {
                    name: "stub".into(),
                    reason: "relay refused".into(),
                });
            }
            self.sent.lock().await.push(mail.clone());
            Ok(())
        }
    }

    struct StubLlm {
        draft: Mutex<Option<String>>,
        inputs: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmProvider for StubLlm {
        fn model_name(&self) -> &str {
            "stub"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            if let Some(user) = request.messages.last() {
                self.inputs.lock().await.push(user.content.clone());
            }
            match self.draft.lock().await.clone() {
                Some(draft) => Ok(CompletionResponse {
                    content: serde_json::json!({ "draft_reply": draft }).to_string(),
                    input_tokens: 1,
                    output_tokens: 1,
                }),
                None => Err(LlmError::RequestFailed {
                    provider: "stub".into(),
                    reason: "timeout".into(),
                }),
            }
        }
    }

    struct Harness {
        machine: Arc<ApprovalMachine>,
        transport: Arc<StubTransport>,
        sender: Arc<StubSender>,
        llm: Arc<StubLlm>,
    }

    fn harness_with(sender: StubSender, triage: TriageConfig) -> Harness {
        let transport = Arc::new(StubTransport::default());
        let sender = Arc::new(sender);
        let llm = Arc::new(StubLlm {
            draft: Mutex::new(Some("Tuesday works.".into())),
            inputs: Mutex::new(Vec::new()),
        });
        let machine = Arc::new(ApprovalMachine::new(
            Arc::new(RecordStore::new(triage.max_records)),
            Arc::new(ClassifierGateway::new(llm.clone(), "Bob")),
            ReplyComposer::new(
                SenderIdentity {
                    name: "Bob".into(),
                    address: "bob@example.com".into(),
                },
                BodyFormat::Html,
            ),
            sender.clone(),
            transport.clone(),
            &triage,
        ));
        Harness {
            machine,
            transport,
            sender,
            llm,
        }
    }

    fn harness() -> Harness {
        harness_with(StubSender::default(), TriageConfig::default())
    }

    fn mail(id: &str) -> InboundMail {
        InboundMail {
            id: id.into(),
            from_address: "alice@example.com".into(),
            from_display: "Alice <alice@example.com>".into(),
            subject: "Lunch".into(),
            body: "Are you free on Tuesday for lunch?".into(),
        }
    }

    fn important() -> Verdict {
        Verdict {
            decision: Decision::Important,
            action: "reply soon".into(),
            draft_reply: "Sure, Tuesday works.".into(),
        }
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[test]
    fn prompt_layout() {
        let record = MessageRecord::new(mail("9"), important(), "chat_1");
        assert_eq!(
            render_prompt(&record),
            "From: Alice <alice@example.com>\nSubject: Lunch\n\nSuggested Action: reply soon\n\nDraft reply:\nSure, Tuesday works."
        );
        let buttons = prompt_buttons("9");
        assert_eq!(buttons.len(), 2);
        assert_eq!(buttons[0][0], PromptButton::new("Approve Reply", "approve:9"));
        assert_eq!(buttons[0][1], PromptButton::new("Dismiss", "dismiss:9"));
        assert_eq!(buttons[1][0], PromptButton::new("Request Revision", "revise:9"));
    }

    #[test]
    fn long_prompt_is_clipped() {
        let mut verdict = important();
        verdict.draft_reply = "word ".repeat(2000);
        let record = MessageRecord::new(mail("9"), verdict, "chat_1");
        assert!(render_prompt(&record).chars().count() <= PROMPT_LIMIT);
    }

    #[tokio::test]
    async fn create_sends_prompt_with_three_options() {
        let h = harness();
        h.machine.create(mail("1"), important(), "chat_1").await.unwrap();

        let prompts = h.transport.prompts.lock().await;
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].0, "chat_1");
        assert_eq!(prompts[0].2.iter().flatten().count(), 3);

        let record = h.machine.store().get("1").await.unwrap();
        assert_eq!(record.state, ApprovalState::Proposed);
        assert_eq!(record.prompt.unwrap().message_id, 100);
    }

    #[tokio::test]
    async fn approve_sends_once_and_edits_prompt() {
        let h = harness();
        h.machine.create(mail("1"), important(), "chat_1").await.unwrap();

        h.machine.handle_action("chat_1", "cb1", Some(100), "approve:1").await;
        h.machine.handle_action("chat_1", "cb2", Some(100), "approve:1").await;

        let sent = h.sender.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "alice@example.com");
        assert_eq!(sent[0].subject, "Re: Lunch");
        assert!(sent[0].body.starts_with("Sure, Tuesday works."));

        assert_eq!(*h.transport.edits.lock().await, vec![(100, "Reply to 'Lunch' sent.".to_string())]);
        assert_eq!(h.transport.acks.lock().await.len(), 2);
        let texts = h.transport.texts.lock().await;
        assert_eq!(texts.len(), 1);
        assert!(texts[0].1.contains("already sent"));
    }

    #[tokio::test]
    async fn exactly_one_action_wins() {
        let h = harness();
        h.machine.create(mail("1"), important(), "chat_1").await.unwrap();

        h.machine.dismiss("1", None).await.unwrap();
        assert!(matches!(
            h.machine.approve("1", None).await,
            Err(ApprovalError::InvalidTransition { .. })
        ));
        assert!(matches!(
            h.machine.revise("1", "chat_1").await,
            Err(ApprovalError::InvalidTransition { .. })
        ));
        assert!(h.sender.sent.lock().await.is_empty());
        assert_eq!(h.transport.edits.lock().await[0].1, "'Lunch' dismissed.");
    }

    #[tokio::test]
    async fn duplicate_approve_during_send_is_rejected() {
        let h = harness_with(
            StubSender {
                gate: Some(Notify::new()),
                ..Default::default()
            },
            TriageConfig::default(),
        );
        h.machine.create(mail("1"), important(), "chat_1").await.unwrap();

        let first = tokio::spawn({
            let machine = h.machine.clone();
            async move { machine.approve("1", None).await }
        });
        h.sender.entered.notified().await;

        assert!(matches!(
            h.machine.approve("1", None).await,
            Err(ApprovalError::InvalidTransition { .. })
        ));
        assert!(h.machine.dismiss("1", None).await.is_err());

        h.sender.gate.as_ref().unwrap().notify_one();
        first.await.unwrap().unwrap();

        assert_eq!(h.sender.sent.lock().await.len(), 1);
        assert_eq!(h.machine.store().get("1").await.unwrap().state, ApprovalState::Sent);
    }

    #[tokio::test]
    async fn send_failure_leaves_record_proposed() {
        let h = harness_with(
            StubSender {
                fail: AtomicBool::new(true),
                ..Default::default()
            },
            TriageConfig::default(),
        );
        h.machine.create(mail("1"), important(), "chat_1").await.unwrap();

        h.machine.handle_action("chat_1", "cb", Some(100), "approve:1").await;
        assert_eq!(h.machine.store().get("1").await.unwrap().state, ApprovalState::Proposed);
        assert!(h.transport.edits.lock().await.is_empty());
        assert!(h.transport.texts.lock().await[0].1.contains("relay refused"));

        // Manual retry goes through once the relay recovers.
        h.sender.fail.store(false, Ordering::SeqCst);
        h.machine.approve("1", None).await.unwrap();
        assert_eq!(h.sender.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn revision_flow_reprompts_with_new_draft() {
        let h = harness();
        h.machine.create(mail("1"), important(), "chat_1").await.unwrap();

        h.machine.handle_action("chat_1", "cb", Some(100), "revise:1").await;
        assert_eq!(
            h.transport.texts.lock().await.last().unwrap().1,
            REVISION_REQUEST_TEXT
        );
        assert_eq!(
            h.machine.store().get("1").await.unwrap().state,
            ApprovalState::AwaitingRevisionText
        );

        h.machine.handle_free_text("chat_1", "make it shorter").await;

        assert_eq!(
            h.llm.inputs.lock().await[0],
            "Are you free on Tuesday for lunch?\nRevision needed: make it shorter"
        );
        let record = h.machine.store().get("1").await.unwrap();
        assert_eq!(record.state, ApprovalState::Proposed);
        assert_eq!(record.draft_reply, "Tuesday works.");
        assert_eq!(record.action_suggestion, "Revision");
        assert_eq!(record.body, "Are you free on Tuesday for lunch?");

        let prompts = h.transport.prompts.lock().await;
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].1.contains("Draft reply:\nTuesday works."));
        assert_eq!(record.prompt.unwrap().message_id, 101);
    }

    #[tokio::test]
    async fn revision_text_from_other_session_is_rejected() {
        let h = harness();
        h.machine.create(mail("1"), important(), "chat_1").await.unwrap();
        h.machine.revise("1", "chat_1").await.unwrap();

        assert!(matches!(
            h.machine.submit_revision_text("chat_2", "make it longer").await,
            Err(ApprovalError::NoPendingRevision { .. })
        ));
        assert!(h.llm.inputs.lock().await.is_empty());
        let record = h.machine.store().get("1").await.unwrap();
        assert_eq!(record.state, ApprovalState::AwaitingRevisionText);
        assert_eq!(record.draft_reply, "Sure, Tuesday works.");
    }

    #[tokio::test]
    async fn free_text_without_pending_revision_is_reported() {
        let h = harness();
        h.machine.handle_free_text("chat_1", "hello?").await;
        assert_eq!(
            h.transport.texts.lock().await[0].1,
            "You're currently not awaiting any revision requests."
        );
    }

    #[tokio::test]
    async fn failed_revision_can_be_retried() {
        let h = harness();
        h.machine.create(mail("1"), important(), "chat_1").await.unwrap();
        h.machine.revise("1", "chat_1").await.unwrap();

        *h.llm.draft.lock().await = None;
        assert!(matches!(
            h.machine.submit_revision_text("chat_1", "shorter").await,
            Err(ApprovalError::RevisionFailed { .. })
        ));
        assert_eq!(
            h.machine.store().get("1").await.unwrap().state,
            ApprovalState::AwaitingRevisionText
        );

        *h.llm.draft.lock().await = Some("Short.".into());
        let record = h.machine.submit_revision_text("chat_1", "shorter").await.unwrap();
        assert_eq!(record.draft_reply, "Short.");
    }

    #[tokio::test]
    async fn revision_times_out() {
        let h = harness();
        h.machine.create(mail("1"), important(), "chat_1").await.unwrap();
        h.machine.revise("1", "chat_1").await.unwrap();

        let later = Instant::now() + TriageConfig::default().revision_timeout + Duration::from_secs(1);
        assert_eq!(h.machine.expire_stale_revisions_at(later).await, 1);
        assert_eq!(h.machine.store().get("1").await.unwrap().state, ApprovalState::Proposed);
        assert!(h.transport.texts.lock().await.last().unwrap().1.contains("timed out"));

        // The prompt is usable again.
        h.machine.approve("1", None).await.unwrap();
    }

    #[tokio::test]
    async fn late_revision_text_is_expired() {
        let triage = TriageConfig {
            revision_timeout: Duration::ZERO,
            ..TriageConfig::default()
        };
        let h = harness_with(StubSender::default(), triage);
        h.machine.create(mail("1"), important(), "chat_1").await.unwrap();
        h.machine.revise("1", "chat_1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(matches!(
            h.machine.submit_revision_text("chat_1", "shorter").await,
            Err(ApprovalError::RevisionExpired { .. })
        ));
        assert_eq!(h.machine.store().get("1").await.unwrap().state, ApprovalState::Proposed);
    }

    #[tokio::test]
    async fn cancel_returns_record_to_proposed() {
        let h = harness();
        h.machine.create(mail("1"), important(), "chat_1").await.unwrap();
        h.machine.revise("1", "chat_1").await.unwrap();

        h.machine.handle_cancel("chat_1").await;
        assert_eq!(h.machine.store().get("1").await.unwrap().state, ApprovalState::Proposed);
        assert_eq!(
            h.transport.texts.lock().await.last().unwrap().1,
            "Revision request for 'Lunch' cancelled."
        );

        h.machine.handle_cancel("chat_1").await;
        assert!(h
            .transport
            .texts
            .lock()
            .await
            .last()
            .unwrap()
            .1
            .contains("not awaiting"));
    }

    #[tokio::test]
    async fn unknown_and_malformed_actions_are_reported() {
        let h = harness();
        h.machine.handle_action("chat_1", "cb1", None, "approve:404").await;
        h.machine.handle_action("chat_1", "cb2", None, "launch:1").await;

        let texts = h.transport.texts.lock().await;
        assert_eq!(texts[0].1, "An error occurred: email data not found.");
        assert_eq!(texts[1].1, "Unrecognised action.");
        assert_eq!(h.transport.acks.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn undelivered_revision_request_releases_record() {
        let h = harness();
        h.machine.create(mail("1"), important(), "chat_1").await.unwrap();

        h.transport.fail_texts.store(true, Ordering::SeqCst);
        assert!(matches!(
            h.machine.revise("1", "chat_1").await,
            Err(ApprovalError::Transport(_))
        ));
        let record = h.machine.store().get("1").await.unwrap();
        assert_eq!(record.state, ApprovalState::Proposed);
        assert!(record.revision_session.is_none());
        assert!(matches!(
            h.machine.submit_revision_text("chat_1", "shorter").await,
            Err(ApprovalError::NoPendingRevision { .. })
        ));

        h.transport.fail_texts.store(false, Ordering::SeqCst);
        h.machine.approve("1", None).await.unwrap();
        assert_eq!(h.sender.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn undelivered_revised_prompt_keeps_old_draft() {
        let h = harness();
        h.machine.create(mail("1"), important(), "chat_1").await.unwrap();
        h.machine.revise("1", "chat_1").await.unwrap();

        h.transport.fail_prompts.store(true, Ordering::SeqCst);
        assert!(matches!(
            h.machine.submit_revision_text("chat_1", "shorter").await,
            Err(ApprovalError::Transport(_))
        ));
        let record = h.machine.store().get("1").await.unwrap();
        assert_eq!(record.draft_reply, "Sure, Tuesday works.");
        assert_eq!(record.state, ApprovalState::AwaitingRevisionText);
        assert_eq!(record.prompt.as_ref().unwrap().message_id, 100);

        // The old prompt cannot send a draft nobody has seen.
        h.machine.handle_action("chat_1", "cb", Some(100), "approve:1").await;
        assert!(h.sender.sent.lock().await.is_empty());

        h.transport.fail_prompts.store(false, Ordering::SeqCst);
        let record = h.machine.submit_revision_text("chat_1", "shorter").await.unwrap();
        assert_eq!(record.draft_reply, "Tuesday works.");
        assert_eq!(record.prompt.as_ref().unwrap().message_id, 101);
        assert!(h
            .transport
            .edits
            .lock()
            .await
            .contains(&(100, "Draft for 'Lunch' was replaced by a newer prompt.".to_string())));

        h.machine.handle_action("chat_1", "cb", Some(101), "approve:1").await;
        let sent = h.sender.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.starts_with("Tuesday works."));
    }

    #[tokio::test]
    async fn refreshed_draft_waits_for_its_prompt() {
        let h = harness();
        h.machine.create(mail("1"), important(), "chat_1").await.unwrap();

        let mut newer = important();
        newer.draft_reply = "Wednesday instead?".into();
        h.transport.fail_prompts.store(true, Ordering::SeqCst);
        assert!(h.machine.create(mail("1"), newer, "chat_1").await.is_err());
        assert_eq!(
            h.machine.store().get("1").await.unwrap().draft_reply,
            "Sure, Tuesday works."
        );

        h.transport.fail_prompts.store(false, Ordering::SeqCst);
        let clicked = PromptRef {
            chat_id: "chat_1".into(),
            message_id: 100,
        };
        h.machine.approve("1", Some(clicked)).await.unwrap();
        assert!(h.sender.sent.lock().await[0].body.starts_with("Sure, Tuesday works."));
    }

    #[tokio::test]
    async fn closed_record_is_not_reprompted() {
        let h = harness();
        h.machine.create(mail("1"), important(), "chat_1").await.unwrap();
        h.machine.dismiss("1", None).await.unwrap();

        h.machine.create(mail("1"), important(), "chat_1").await.unwrap();
        assert_eq!(h.transport.prompts.lock().await.len(), 1);
    }
}
