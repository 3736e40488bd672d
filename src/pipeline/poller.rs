//! Mailbox poller: the recurring triage loop, one subscription per chat.
//!
//! Each tick lists unseen ids and walks them in mailbox order:
//! fetch → extract → truncate → classify → (important) prompt.
//! A failure on one message never aborts the rest of the tick.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::approval::machine::ApprovalMachine;
use crate::channels::channel::MailboxClient;
use crate::error::PipelineError;
use crate::pipeline::classifier::ClassifierGateway;
use crate::pipeline::extract::parse_inbound;
use crate::pipeline::truncate::truncate;
use crate::pipeline::types::TickReport;

/// Evaluated ids remembered per subscription.
pub const EVALUATED_CAPACITY: usize = 4096;

/// Bounded insertion-ordered set of evaluated mailbox ids.
#[derive(Debug)]
pub struct SeenIds {
    order: VecDeque<String>,
    set: HashSet<String>,
    capacity: usize,
}

impl SeenIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.set.contains(id)
    }

    /// Insert an id, forgetting the oldest one when full.
    pub fn insert(&mut self, id: String) -> bool {
        if self.capacity == 0 || self.set.contains(&id) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        self.set.insert(id.clone());
        self.order.push_back(id);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub struct MailboxPoller {
    mailbox: Arc<dyn MailboxClient>,
    classifier: Arc<ClassifierGateway>,
    machine: Arc<ApprovalMachine>,
    max_input_chars: usize,
    mark_seen: bool,
}

impl MailboxPoller {
    pub fn new(
        mailbox: Arc<dyn MailboxClient>,
        classifier: Arc<ClassifierGateway>,
        machine: Arc<ApprovalMachine>,
        max_input_chars: usize,
        mark_seen: bool,
    ) -> Self {
        Self {
            mailbox,
            classifier,
            machine,
            max_input_chars,
            mark_seen,
        }
    }

    /// Run one tick for `chat_id`. Only a failed listing is an error.
    pub async fn tick(&self, chat_id: &str, seen: &mut SeenIds) -> Result<TickReport, PipelineError> {
        let ids = self.mailbox.list_unseen().await?;
        let mut report = TickReport {
            listed: ids.len(),
            ..TickReport::default()
        };
        let mut newly_evaluated = Vec::new();

        for id in ids {
            if seen.contains(&id) {
                report.skipped += 1;
                continue;
            }

            let raw = match self.mailbox.fetch_raw(&id).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(id = %id, error = %e, "Failed to fetch message");
                    report.failed += 1;
                    continue;
                }
            };

            let Some(mail) = parse_inbound(&id, &raw) else {
                // Retrying cannot help an unparseable message.
                warn!(id = %id, "Unparseable message skipped");
                report.failed += 1;
                seen.insert(id.clone());
                newly_evaluated.push(id);
                continue;
            };

            let input = format!(
                "Subject: {}\n\n{}",
                mail.subject,
                truncate(&mail.body, self.max_input_chars)
            );
            let verdict = match self.classifier.classify(&input).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!(id = %id, error = %e, "Could not evaluate message");
                    report.failed += 1;
                    continue;
                }
            };

            report.evaluated += 1;

            if verdict.decision.is_important() {
                report.important += 1;
                // Undelivered prompts stay out of the seen set so the next tick retries.
                if let Err(e) = self.machine.create(mail, verdict, chat_id).await {
                    warn!(id = %id, error = %e, "Prompt for important message failed");
                    report.failed += 1;
                    continue;
                }
            } else {
                debug!(id = %id, "Not important");
            }

            seen.insert(id.clone());
            newly_evaluated.push(id);
        }

        if self.mark_seen
            && !newly_evaluated.is_empty()
            && let Err(e) = self.mailbox.mark_seen(&newly_evaluated).await
        {
            warn!(error = %e, "Failed to flag evaluated messages as seen");
        }

        info!(
            chat_id = %chat_id,
            listed = report.listed,
            skipped = report.skipped,
            evaluated = report.evaluated,
            important = report.important,
            failed = report.failed,
            "Poll tick complete"
        );
        Ok(report)
    }
}

/// A running tick loop for one chat.
pub struct PollSubscription {
    pub chat_id: String,
    pub started_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

/// Owns the subscriptions, keyed by chat id.
pub struct SubscriptionRegistry {
    poller: Arc<MailboxPoller>,
    interval: Duration,
    subscriptions: Mutex<HashMap<String, PollSubscription>>,
}

impl SubscriptionRegistry {
    pub fn new(poller: Arc<MailboxPoller>, interval: Duration) -> Self {
        Self {
            poller,
            interval,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start ticking for `chat_id`, first tick immediately.
    /// Returns `false` if the chat already has a subscription.
    pub async fn start(&self, chat_id: &str) -> bool {
        let mut subs = self.subscriptions.lock().await;
        if subs.contains_key(chat_id) {
            debug!(chat_id = %chat_id, "Subscription already active");
            return false;
        }

        let poller = Arc::clone(&self.poller);
        let period = self.interval;
        let chat = chat_id.to_string();
        let handle = tokio::spawn(async move {
            let mut seen = SeenIds::new(EVALUATED_CAPACITY);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = poller.tick(&chat, &mut seen).await {
                    warn!(chat_id = %chat, error = %e, "Poll tick failed");
                }
            }
        });

        subs.insert(
            chat_id.to_string(),
            PollSubscription {
                chat_id: chat_id.to_string(),
                started_at: Utc::now(),
                handle,
            },
        );
        info!(chat_id = %chat_id, interval_secs = period.as_secs(), "Mailbox checks started");
        true
    }

    /// Abort and remove the chat's subscription. Returns `false` if none existed.
    pub async fn stop(&self, chat_id: &str) -> bool {
        match self.subscriptions.lock().await.remove(chat_id) {
            Some(sub) => {
                sub.handle.abort();
                info!(chat_id = %chat_id, since = %sub.started_at, "Mailbox checks stopped");
                true
            }
            None => false,
        }
    }

    pub async fn is_active(&self, chat_id: &str) -> bool {
        self.subscriptions.lock().await.contains_key(chat_id)
    }

    pub async fn active(&self) -> Vec<String> {
        self.subscriptions.lock().await.keys().cloned().collect()
    }

    /// Abort every subscription.
    pub async fn shutdown(&self) {
        for (_, sub) in self.subscriptions.lock().await.drain() {
            sub.handle.abort();
        }
    }
}
