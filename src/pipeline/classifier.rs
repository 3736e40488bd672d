//! Classifier gateway: triage verdicts and draft revisions from the LLM.
//!
//! Parsing is strict. Anything other than a JSON object with the required
//! string fields is a [`PipelineError`]; nothing is retried here.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::{Decision, Verdict};

/// Max tokens for a verdict or revised draft.
const MAX_TOKENS: u32 = 1024;

/// Low temperature keeps the JSON shape stable.
const TEMPERATURE: f32 = 0.2;

/// Action suggestion attached to every revised draft.
pub const REVISION_ACTION: &str = "Revision";

const REVISION_SYSTEM_PROMPT: &str = "You're a helpful assistant designed to output JSON. \
Draft a new reply based on the revision request. \
Response JSON must contain the 'draft_reply' field containing the new reply.";

/// Build the triage policy for a given operator.
fn triage_system_prompt(operator_name: &str) -> String {
    format!(
        "You're a helpful email assistant designed to output JSON. \
Assess the email and suggest an appropriate action. \
Response JSON must contain: 'decision', 'action', 'draft_reply'. \
'decision' should be 'important' or 'not important'. \
Emails are important if they need to be seen by the user or they need a reply. \
'action' should be the suggestion to the user on how to proceed. \
'draft_reply' is a suggested reply for this email. 'draft_reply' can be the text 'none'. \
Emails are only important if they are directed explicitly to me, {operator_name}, \
and are not mass mailers or spam. I am not interested in advertisements. \
Emails can contain basic HTML as long as it does not break the JSON block. \
If the email contains a link, you can send the link with the action message \
as long as any tracking parameters are removed."
    )
}

pub struct ClassifierGateway {
    llm: Arc<dyn LlmProvider>,
    system_prompt: String,
}

impl ClassifierGateway {
    pub fn new(llm: Arc<dyn LlmProvider>, operator_name: &str) -> Self {
        Self {
            llm,
            system_prompt: triage_system_prompt(operator_name),
        }
    }

    /// Classify one message. `input` is the subject line plus truncated body.
    pub async fn classify(&self, input: &str) -> Result<Verdict, PipelineError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(self.system_prompt.clone()),
            ChatMessage::user(input),
        ])
        .with_temperature(TEMPERATURE)
        .with_max_tokens(MAX_TOKENS)
        .with_json_object();

        let response = self.llm.complete(request).await?;
        debug!(
            model = self.llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Classifier responded"
        );

        let verdict = parse_verdict(&response.content)?;
        info!(decision = %verdict.decision, "Message classified");
        Ok(verdict)
    }

    /// Draft a new reply from the original (truncated) body and an instruction.
    ///
    /// The verdict is always `important` with [`REVISION_ACTION`] as its action.
    pub async fn revise_draft(
        &self,
        original_body: &str,
        instruction: &str,
    ) -> Result<Verdict, PipelineError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(REVISION_SYSTEM_PROMPT),
            ChatMessage::user(format!("{original_body}\nRevision needed: {instruction}")),
        ])
        .with_temperature(TEMPERATURE)
        .with_max_tokens(MAX_TOKENS)
        .with_json_object();

        let response = self.llm.complete(request).await?;
        let object = parse_object(&response.content)?;
        let draft_reply = string_field(&object, "draft_reply")?.to_string();
        info!("Revised draft generated");

        Ok(Verdict {
            decision: Decision::Important,
            action: REVISION_ACTION.to_string(),
            draft_reply,
        })
    }
}

/// Parse a triage verdict from completion content.
pub fn parse_verdict(content: &str) -> Result<Verdict, PipelineError> {
    let object = parse_object(content)?;
    let decision = string_field(&object, "decision")?
        .parse::<Decision>()
        .map_err(PipelineError::MalformedVerdict)?;

    Ok(Verdict {
        decision,
        action: string_field(&object, "action")?.to_string(),
        draft_reply: string_field(&object, "draft_reply")?.to_string(),
    })
}

fn parse_object(content: &str) -> Result<Map<String, Value>, PipelineError> {
    match serde_json::from_str::<Value>(content.trim()) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(other) => Err(PipelineError::MalformedVerdict(format!(
            "expected a JSON object, got {other}"
        ))),
        Err(e) => Err(PipelineError::MalformedVerdict(format!("not JSON: {e}"))),
    }
}

fn string_field<'a>(object: &'a Map<String, Value>, key: &str) -> Result<&'a str, PipelineError> {
    match object.get(key) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(PipelineError::MalformedVerdict(format!(
            "field '{key}' is not a string"
        ))),
        None => Err(PipelineError::MalformedVerdict(format!(
            "missing field '{key}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::provider::{CompletionResponse, Role};
    use tokio::sync::Mutex;

    struct StubLlm {
        reply: Result<String, ()>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl StubLlm {
        fn replying(content: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(content.to_string()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                reply: Err(()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for StubLlm {
        fn model_name(&self) -> &str {
            "stub"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.requests.lock().await.push(request);
            match &self.reply {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    input_tokens: 10,
                    output_tokens: 5,
                }),
                Err(()) => Err(LlmError::RequestFailed {
                    provider: "stub".into(),
                    reason: "connection reset".into(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn classify_important() {
        let llm = StubLlm::replying(
            r#"{"decision":"important","action":"reply soon","draft_reply":"Sure, Tuesday works."}"#,
        );
        let gateway = ClassifierGateway::new(llm.clone(), "Bob");

        let verdict = gateway.classify("Subject: Lunch\n\nFree Tuesday?").await.unwrap();
        assert_eq!(verdict.decision, Decision::Important);
        assert_eq!(verdict.action, "reply soon");
        assert_eq!(verdict.draft_reply, "Sure, Tuesday works.");

        let requests = llm.requests.lock().await;
        let req = &requests[0];
        assert!(req.json_object);
        assert_eq!(req.messages[0].role, Role::System);
        assert!(req.messages[0].content.contains("directed explicitly to me, Bob"));
        assert_eq!(req.messages[1].content, "Subject: Lunch\n\nFree Tuesday?");
    }

    #[tokio::test]
    async fn classify_transport_error_propagates() {
        let gateway = ClassifierGateway::new(StubLlm::failing(), "Bob");
        let err = gateway.classify("x").await.unwrap_err();
        assert!(matches!(err, PipelineError::Classification(_)));
    }

    #[tokio::test]
    async fn revise_builds_combined_input() {
        let llm = StubLlm::replying(r#"{"draft_reply":"Tuesday works."}"#);
        let gateway = ClassifierGateway::new(llm.clone(), "Bob");

        let verdict = gateway
            .revise_draft("Are you free Tuesday?", "make it shorter")
            .await
            .unwrap();
        assert_eq!(verdict.decision, Decision::Important);
        assert_eq!(verdict.action, REVISION_ACTION);
        assert_eq!(verdict.draft_reply, "Tuesday works.");

        let requests = llm.requests.lock().await;
        assert_eq!(
            requests[0].messages[1].content,
            "Are you free Tuesday?\nRevision needed: make it shorter"
        );
    }

    #[tokio::test]
    async fn revise_requires_draft_field() {
        let gateway = ClassifierGateway::new(StubLlm::replying(r#"{"reply":"x"}"#), "Bob");
        assert!(matches!(
            gateway.revise_draft("body", "shorter").await,
            Err(PipelineError::MalformedVerdict(_))
        ));
    }

    #[test]
    fn parse_verdict_tolerates_surrounding_whitespace() {
        let v = parse_verdict(
            "\n  {\"decision\":\"not important\",\"action\":\"ignore\",\"draft_reply\":\"none\"}  \n",
        )
        .unwrap();
        assert_eq!(v.decision, Decision::NotImportant);
    }

    #[test]
    fn parse_verdict_rejects_malformed() {
        let cases = [
            "not json at all",
            "```json\n{\"decision\":\"important\",\"action\":\"a\",\"draft_reply\":\"b\"}\n```",
            "[1, 2, 3]",
            r#"{"decision":"important","action":"a"}"#,
            r#"{"decision":"urgent","action":"a","draft_reply":"b"}"#,
            r#"{"decision":"important","action":null,"draft_reply":"b"}"#,
            r#"{"decision":"important","action":"a","draft_reply":42}"#,
        ];
        for content in cases {
            assert!(
                matches!(parse_verdict(content), Err(PipelineError::MalformedVerdict(_))),
                "{content:?} should be rejected"
            );
        }
    }
}
