//! Operator dispatcher: routes chat events to the poller registry or the state machine.
//!
//! Commands that only touch the registry are handled inline. Anything that
//! may wait on the network (a send, a revision) runs in its own task so one
//! slow action never holds up the next event.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::approval::machine::ApprovalMachine;
use crate::channels::channel::{ChatTransport, OperatorEvent, OperatorStream};
use crate::pipeline::poller::SubscriptionRegistry;

pub struct Dispatcher {
    machine: Arc<ApprovalMachine>,
    subscriptions: Arc<SubscriptionRegistry>,
    transport: Arc<dyn ChatTransport>,
}

impl Dispatcher {
    pub fn new(
        machine: Arc<ApprovalMachine>,
        subscriptions: Arc<SubscriptionRegistry>,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        Self {
            machine,
            subscriptions,
            transport,
        }
    }

    /// Consume events until the stream ends.
    pub async fn run(&self, mut events: OperatorStream) {
        while let Some(event) = events.next().await {
            self.dispatch(event).await;
        }
        info!("Operator event stream ended");
    }

    /// Route one event. Returns the spawned task for events handled off-loop.
    pub async fn dispatch(&self, event: OperatorEvent) -> Option<JoinHandle<()>> {
        debug!(chat_id = %event.chat_id(), "Operator event");
        match event {
            OperatorEvent::Start { chat_id } => {
                let text = if self.subscriptions.start(&chat_id).await {
                    format!(
                        "Email checking scheduled every {} seconds.",
                        self.subscriptions.interval().as_secs()
                    )
                } else {
                    "Email checking is already running.".to_string()
                };
                self.reply(&chat_id, &text).await;
                None
            }
            OperatorEvent::Stop { chat_id } => {
                let text = if self.subscriptions.stop(&chat_id).await {
                    "Email checking stopped."
                } else {
                    "Email checking is not running."
                };
                self.reply(&chat_id, text).await;
                None
            }
            OperatorEvent::CancelRevision { chat_id } => {
                let machine = Arc::clone(&self.machine);
                Some(tokio::spawn(async move {
                    machine.handle_cancel(&chat_id).await;
                }))
            }
            OperatorEvent::Action {
                chat_id,
                callback_id,
                prompt_message_id,
                data,
            } => {
                let machine = Arc::clone(&self.machine);
                Some(tokio::spawn(async move {
                    machine
                        .handle_action(&chat_id, &callback_id, prompt_message_id, &data)
                        .await;
                }))
            }
            OperatorEvent::FreeText { chat_id, text } => {
                let machine = Arc::clone(&self.machine);
                Some(tokio::spawn(async move {
                    machine.handle_free_text(&chat_id, &text).await;
                }))
            }
        }
    }

    async fn reply(&self, chat_id: &str, text: &str) {
        if let Err(e) = self.transport.send_text(chat_id, text).await {
            warn!(chat_id = %chat_id, error = %e, "Failed to reply to operator");
        }
    }
}
