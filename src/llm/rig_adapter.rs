//! Adapter from a rig completion model to [`LlmProvider`].
//!
//! System messages become the preamble, the last user message is the prompt
//! and anything before it is sent as chat history.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionModel, Message};
use serde_json::json;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, Role,
};

const PROVIDER: &str = "openai";

pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

/// A request split the way rig expects it.
#[derive(Debug)]
pub struct Conversation {
    pub preamble: Option<String>,
    pub history: Vec<Message>,
    pub prompt: Message,
}

/// Split chat messages into preamble, history and prompt.
pub fn split_conversation(messages: Vec<ChatMessage>) -> Result<Conversation, LlmError> {
    let mut system = Vec::new();
    let mut turns = Vec::new();
    for message in messages {
        match message.role {
            Role::System => system.push(message.content),
            Role::User => turns.push(message.content),
        }
    }

    let prompt = turns.pop().ok_or_else(|| LlmError::RequestFailed {
        provider: PROVIDER.to_string(),
        reason: "request has no user message".to_string(),
    })?;

    Ok(Conversation {
        preamble: (!system.is_empty()).then(|| system.join("\n\n")),
        history: turns.into_iter().map(Message::user).collect(),
        prompt: Message::user(prompt),
    })
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let Conversation {
            preamble,
            history,
            prompt,
        } = split_conversation(request.messages)?;

        let mut builder = self.model.completion_request(prompt).messages(history);
        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }
        if request.json_object {
            builder = builder.additional_params(json!({
                "response_format": { "type": "json_object" }
            }));
        }

        let response = builder.send().await.map_err(|e| LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: e.to_string(),
        })?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|part| match part {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect();
        if content.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: "completion has no text content".to_string(),
            });
        }

        Ok(CompletionResponse {
            content,
            input_tokens: u32::try_from(response.usage.input_tokens).unwrap_or(u32::MAX),
            output_tokens: u32::try_from(response.usage.output_tokens).unwrap_or(u32::MAX),
        })
    }
}
