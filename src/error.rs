//! Error types for inbox-triage.

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors from the mailbox, mail sender and chat transport adapters.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Failed to fetch from channel {name}: {reason}")]
    FetchFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Classifier backend errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Triage pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Classification failed: {0}")]
    Classification(#[from] LlmError),

    #[error("Malformed verdict: {0}")]
    MalformedVerdict(String),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] ChannelError),
}

/// Rejected or failed operator actions.
///
/// Every variant is reported back to the operator via [`ApprovalError::user_message`];
/// none of them is fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("Record {id} not found")]
    NotFound { id: String },

    #[error("Record {id} is {state}, cannot {action}")]
    InvalidTransition {
        id: String,
        state: String,
        action: String,
    },

    #[error("Session {session} has no pending revision")]
    NoPendingRevision { session: String },

    #[error("Record {id} is awaiting revision text from another session (got {session})")]
    SessionMismatch { id: String, session: String },

    #[error("Revision request for record {id} expired")]
    RevisionExpired { id: String },

    #[error("Invalid action payload: {0}")]
    InvalidPayload(String),

    #[error("Reply for record {id} could not be sent: {source}")]
    SendFailed {
        id: String,
        #[source]
        source: ChannelError,
    },

    #[error("Revision for record {id} failed: {source}")]
    RevisionFailed {
        id: String,
        #[source]
        source: PipelineError,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] ChannelError),
}

impl ApprovalError {
    /// Text shown to the operator in the chat.
    pub fn user_message(&self) -> String {
        match self {
            Self::NotFound { .. } => "An error occurred: email data not found.".to_string(),
            Self::InvalidTransition { state, action, .. } => {
                format!("Cannot {action} this email: it is already {state}.")
            }
            Self::NoPendingRevision { .. } => {
                "You're currently not awaiting any revision requests.".to_string()
            }
            Self::SessionMismatch { .. } => {
                "This revision was requested from another chat.".to_string()
            }
            Self::RevisionExpired { .. } => {
                "Your revision request timed out. The previous draft is still pending; \
                 press \"Request Revision\" again to retry."
                    .to_string()
            }
            Self::InvalidPayload(_) => "Unrecognised action.".to_string(),
            Self::SendFailed { source, .. } => {
                format!("Failed to send the reply: {source}. Press \"Approve Reply\" to retry.")
            }
            Self::RevisionFailed { source, .. } => {
                format!("Failed to generate a revised draft: {source}. Send your revision request again to retry.")
            }
            Self::Transport(e) => format!("An error occurred while processing your request: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_message_names_state() {
        let err = ApprovalError::InvalidTransition {
            id: "42".into(),
            state: "sent".into(),
            action: "dismiss".into(),
        };
        assert_eq!(err.user_message(), "Cannot dismiss this email: it is already sent.");
        assert_eq!(err.to_string(), "Record 42 is sent, cannot dismiss");
    }

    #[test]
    fn send_failure_asks_for_manual_retry() {
        let err = ApprovalError::SendFailed {
            id: "7".into(),
            source: ChannelError::SendFailed {
                name: "smtp".into(),
                reason: "connection refused".into(),
            },
        };
        let msg = err.user_message();
        assert!(msg.contains("connection refused"));
        assert!(msg.contains("retry"));
    }

    #[test]
    fn pipeline_error_wraps_llm_error() {
        let err: PipelineError = LlmError::RequestFailed {
            provider: "openai".into(),
            reason: "connection reset".into(),
        }
        .into();
        assert!(matches!(err, PipelineError::Classification(_)));
    }
}
