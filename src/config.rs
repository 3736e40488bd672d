//! Configuration types.
//!
//! Everything is read once at startup into an immutable [`AppConfig`] and
//! handed to the components that need it.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default tick interval (seconds).
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Default classifier input bound (characters).
const DEFAULT_MAX_INPUT_CHARS: usize = 8000;

/// Default lifetime of a pending revision request (seconds).
const DEFAULT_REVISION_TIMEOUT_SECS: u64 = 900;

/// Default record store capacity.
const DEFAULT_MAX_RECORDS: usize = 500;

/// Operator identity.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Display name used in the triage policy and as the reply sender name.
    pub display_name: String,
}

/// IMAP + SMTP settings.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub mailbox: String,
    /// Flag evaluated messages `\Seen` at the end of each tick. Off by
    /// default: evaluated ids are remembered per subscription instead, so the
    /// operator's mail client still shows them unread.
    pub mark_seen: bool,
    /// Compose replies as HTML instead of plain text.
    pub html_replies: bool,
}

/// Telegram Bot API settings.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub allowed_users: Vec<String>,
}

/// Classifier backend settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: SecretString,
    pub model: String,
}

/// Triage pipeline tuning.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    pub poll_interval: Duration,
    /// Maximum characters of body text sent to the classifier.
    pub max_input_chars: usize,
    /// How long an `AwaitingRevisionText` record waits for operator text.
    pub revision_timeout: Duration,
    /// Record store capacity before terminal records are evicted.
    pub max_records: usize,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
            revision_timeout: Duration::from_secs(DEFAULT_REVISION_TIMEOUT_SECS),
            max_records: DEFAULT_MAX_RECORDS,
        }
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub operator: OperatorConfig,
    pub email: EmailConfig,
    pub telegram: TelegramConfig,
    pub llm: LlmConfig,
    pub triage: TriageConfig,
    pub log_dir: PathBuf,
}

impl AppConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);

        let operator = OperatorConfig {
            display_name: env.required("OPERATOR_NAME")?,
        };

        let imap_host = env.required("EMAIL_IMAP_HOST")?;
        let username = env.required("EMAIL_USERNAME")?;
        let email = EmailConfig {
            imap_port: env.parsed("EMAIL_IMAP_PORT", 993)?,
            smtp_host: env
                .optional("EMAIL_SMTP_HOST")
                .unwrap_or_else(|| imap_host.replace("imap", "smtp")),
            smtp_port: env.parsed("EMAIL_SMTP_PORT", 465)?,
            password: SecretString::from(env.required("EMAIL_PASSWORD")?),
            from_address: env
                .optional("EMAIL_FROM_ADDRESS")
                .unwrap_or_else(|| username.clone()),
            mailbox: env
                .optional("EMAIL_MAILBOX")
                .unwrap_or_else(|| "INBOX".to_string()),
            mark_seen: env.flag("EMAIL_MARK_SEEN", false)?,
            html_replies: env.flag("EMAIL_HTML_REPLIES", true)?,
            imap_host,
            username,
        };

        let telegram = TelegramConfig {
            bot_token: SecretString::from(env.required("TELEGRAM_BOT_TOKEN")?),
            allowed_users: env
                .optional("TELEGRAM_ALLOWED_USERS")
                .unwrap_or_else(|| "*".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        };

        let llm = LlmConfig {
            api_key: SecretString::from(env.required("OPENAI_API_KEY")?),
            model: env
                .optional("LLM_MODEL")
                .unwrap_or_else(|| "gpt-3.5-turbo-0125".to_string()),
        };

        let triage = TriageConfig {
            poll_interval: Duration::from_secs(
                env.parsed("TRIAGE_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?,
            ),
            max_input_chars: env.parsed("TRIAGE_MAX_INPUT_CHARS", DEFAULT_MAX_INPUT_CHARS)?,
            revision_timeout: Duration::from_secs(
                env.parsed("TRIAGE_REVISION_TIMEOUT_SECS", DEFAULT_REVISION_TIMEOUT_SECS)?,
            ),
            max_records: env.parsed("TRIAGE_MAX_RECORDS", DEFAULT_MAX_RECORDS)?,
        };
        if triage.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "TRIAGE_POLL_INTERVAL_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }
        if triage.max_input_chars == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TRIAGE_MAX_INPUT_CHARS".into(),
                message: "must be greater than zero".into(),
            });
        }

        let log_dir = env
            .optional("LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./logs"));

        Ok(Self {
            operator,
            email,
            telegram,
            llm,
            triage,
            log_dir,
        })
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.optional(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" => Ok(true),
                "0" | "false" | "no" => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("expected a boolean, got '{v}'"),
                }),
            },
        }
    }
}
