//! Telegram channel: long-polls the Bot API for operator events.
//!
//! Prompts go out as `sendMessage` with an inline keyboard; button presses
//! come back as `callback_query` updates carrying the button's payload.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::channels::channel::{ChatTransport, OperatorEvent, OperatorStream, PromptButton};
use crate::error::ChannelError;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Long-poll timeout passed to getUpdates (seconds).
const LONG_POLL_TIMEOUT_SECS: u64 = 30;

/// Telegram channel: connects to the Bot API via long-polling.
pub struct TelegramChannel {
    bot_token: SecretString,
    allowed_users: Vec<String>,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: SecretString, allowed_users: Vec<String>) -> Self {
        Self {
            bot_token,
            allowed_users,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{method}",
            self.bot_token.expose_secret()
        )
    }

    /// Call a Bot API method and return its `result`.
    async fn call(&self, method: &str, body: Value) -> Result<Value, ChannelError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                // The URL carries the bot token.
                reason: e.without_url().to_string(),
            })?;

        let status = resp.status();
        let data: Value = resp
            .json()
            .await
            .map_err(|e| ChannelError::Http(e.without_url().to_string()))?;

        if !status.is_success() || data.get("ok").and_then(Value::as_bool) != Some(true) {
            let description = data
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!("{method} failed ({status}): {description}"),
            });
        }

        Ok(data.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Verify the token with `getMe`.
    pub async fn health_check(&self) -> Result<(), ChannelError> {
        self.call("getMe", json!({}))
            .await
            .map(|_| ())
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })
    }

    /// Spawn the long-poll listener and return its event stream.
    pub fn start(&self) -> OperatorStream {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let url = self.api_url("getUpdates");
        let allowed_users = self.allowed_users.clone();
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!("Telegram channel listening for operator events...");

            loop {
                let body = json!({
                    "offset": offset,
                    "timeout": LONG_POLL_TIMEOUT_SECS,
                    "allowed_updates": ["message", "callback_query"]
                });

                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {}", e.without_url());
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let data: Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("Telegram parse error: {}", e.without_url());
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let results = match update_batch(&data) {
                    Ok(results) => results,
                    Err(reason) => {
                        tracing::warn!("Telegram getUpdates rejected: {}", reason);
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                for update in results {
                    // Advance offset past this update
                    if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                        offset = uid + 1;
                    }

                    let Some(event) = parse_update(update, &allowed_users) else {
                        continue;
                    };

                    if tx.send(event).is_err() {
                        tracing::info!("Telegram listener channel closed");
                        return;
                    }
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        Box::pin(stream)
    }
}

#[async_trait]
impl ChatTransport for TelegramChannel {
    async fn send_prompt(
        &self,
        chat_id: &str,
        text: &str,
        buttons: &[Vec<PromptButton>],
    ) -> Result<i64, ChannelError> {
        let result = self
            .call(
                "sendMessage",
                json!({
                    "chat_id": chat_id,
                    "text": text,
                    "reply_markup": inline_keyboard(buttons),
                }),
            )
            .await?;

        result
            .get("message_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| ChannelError::InvalidMessage("sendMessage returned no message_id".into()))
    }

    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: i64,
        text: &str,
    ) -> Result<(), ChannelError> {
        // No reply_markup: the buttons are removed.
        self.call(
            "editMessageText",
            json!({
                "chat_id": chat_id,
                "message_id": message_id,
                "text": text,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.call("sendMessage", json!({ "chat_id": chat_id, "text": chunk }))
                .await?;
        }
        Ok(())
    }

    async fn acknowledge(&self, callback_id: &str) -> Result<(), ChannelError> {
        self.call(
            "answerCallbackQuery",
            json!({ "callback_query_id": callback_id }),
        )
        .await
        .map(|_| ())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Convert one update into an operator event.
///
/// Returns `None` for updates from users not on the allow-list, unknown
/// commands and anything that is neither text nor a button press.
pub fn parse_update(update: &Value, allowed_users: &[String]) -> Option<OperatorEvent> {
    if let Some(query) = update.get("callback_query") {
        if !sender_allowed(query.get("from"), allowed_users) {
            return None;
        }
        let message = query.get("message");
        let chat_id = message
            .and_then(|m| m.get("chat"))
            .and_then(|c| c.get("id"))
            .or_else(|| query.get("from").and_then(|f| f.get("id")))
            .and_then(Value::as_i64)?;
        return Some(OperatorEvent::Action {
            chat_id: chat_id.to_string(),
            callback_id: query.get("id").and_then(Value::as_str)?.to_string(),
            prompt_message_id: message
                .and_then(|m| m.get("message_id"))
                .and_then(Value::as_i64),
            data: query
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }

    let message = update.get("message")?;
    let text = message.get("text").and_then(Value::as_str)?;
    if !sender_allowed(message.get("from"), allowed_users) {
        return None;
    }
    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64)?
        .to_string();

    match parse_command(text) {
        Some("start") => Some(OperatorEvent::Start { chat_id }),
        Some("stop") => Some(OperatorEvent::Stop { chat_id }),
        Some("cancel") => Some(OperatorEvent::CancelRevision { chat_id }),
        Some(other) => {
            tracing::debug!(command = other, "Ignoring unknown Telegram command");
            None
        }
        None => Some(OperatorEvent::FreeText {
            chat_id,
            text: text.to_string(),
        }),
    }
}

/// `/start@my_bot now` → `start`. `None` if `text` is not a command.
fn parse_command(text: &str) -> Option<&str> {
    let word = text.trim_start().strip_prefix('/')?.split_whitespace().next()?;
    Some(word.split('@').next().unwrap_or(word))
}

/// Check the `from` object's username and numeric id against the allow-list.
fn sender_allowed(from: Option<&Value>, allowed_users: &[String]) -> bool {
    let username = from
        .and_then(|f| f.get("username"))
        .and_then(Value::as_str);
    let user_id = from
        .and_then(|f| f.get("id"))
        .and_then(Value::as_i64)
        .map(|id| id.to_string());

    let identities = username.into_iter().chain(user_id.as_deref());
    let allowed = check_user_allowed(allowed_users, identities);
    if !allowed {
        tracing::warn!(
            "Telegram: ignoring update from unauthorized user: username={}, user_id={}",
            username.unwrap_or("unknown"),
            user_id.as_deref().unwrap_or("unknown")
        );
    }
    allowed
}

/// The updates in a getUpdates reply, or why it carries none.
fn update_batch(data: &Value) -> Result<&[Value], String> {
    match data.get("result").and_then(Value::as_array) {
        Some(results) if data.get("ok").and_then(Value::as_bool) != Some(false) => {
            Ok(results.as_slice())
        }
        _ => Err(data
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("reply has no result")
            .to_string()),
    }
}

/// Check if any identity in the iterator matches the allowed users list.
fn check_user_allowed<'a>(
    allowed_users: &[String],
    identities: impl IntoIterator<Item = &'a str>,
) -> bool {
    let ids: Vec<&str> = identities.into_iter().collect();
    allowed_users
        .iter()
        .any(|u| u == "*" || ids.contains(&u.as_str()))
}

fn inline_keyboard(buttons: &[Vec<PromptButton>]) -> Value {
    let rows: Vec<Vec<Value>> = buttons
        .iter()
        .map(|row| {
            row.iter()
                .map(|b| json!({ "text": b.label, "callback_data": b.data }))
                .collect()
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

/// Split a message into chunks of at most `max_len` chars.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;

    while remaining.chars().count() > max_len {
        let limit = remaining
            .char_indices()
            .nth(max_len)
            .map_or(remaining.len(), |(i, _)| i);
        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .filter(|&pos| pos > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    if !remaining.is_empty() || chunks.is_empty() {
        chunks.push(remaining.to_string());
    }
    chunks
}

// ── Tests ───────────────────────────────────────────────────────────
