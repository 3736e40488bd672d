use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use inbox_triage::approval::{ApprovalMachine, Dispatcher, spawn_revision_sweeper};
use inbox_triage::channels::{ImapMailbox, SmtpSender, TelegramChannel};
use inbox_triage::config::AppConfig;
use inbox_triage::llm::create_provider;
use inbox_triage::pipeline::{ClassifierGateway, MailboxPoller, SubscriptionRegistry};
use inbox_triage::records::{BodyFormat, RecordStore, ReplyComposer, SenderIdentity};

/// How often stale revision requests are swept.
const REVISION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = AppConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!(
            "  Required: OPERATOR_NAME, EMAIL_IMAP_HOST, EMAIL_USERNAME, EMAIL_PASSWORD, \
             TELEGRAM_BOT_TOKEN, OPENAI_API_KEY"
        );
        std::process::exit(1);
    });

    // Initialize tracing: stderr plus a plain-text copy in LOG_DIR
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("creating log directory {}", config.log_dir.display()))?;
    let file_appender = tracing_appender::rolling::never(&config.log_dir, "inbox-triage.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    eprintln!("📬 Inbox Triage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Operator: {}", config.operator.display_name);
    eprintln!(
        "   Mailbox: {}@{}:{}/{}",
        config.email.username, config.email.imap_host, config.email.imap_port, config.email.mailbox
    );
    eprintln!("   Model: {}", config.llm.model);
    eprintln!(
        "   Poll interval: {}s, revision timeout: {}s",
        config.triage.poll_interval.as_secs(),
        config.triage.revision_timeout.as_secs()
    );
    eprintln!("   Logs: {}", config.log_dir.join("inbox-triage.log").display());
    eprintln!("   Send /start to the bot to begin.\n");

    // ── Collaborators ───────────────────────────────────────────────────
    let llm = create_provider(&config.llm)?;
    let classifier = Arc::new(ClassifierGateway::new(llm, &config.operator.display_name));

    let telegram = Arc::new(TelegramChannel::new(
        config.telegram.bot_token.clone(),
        config.telegram.allowed_users.clone(),
    ));
    telegram.health_check().await?;

    let format = if config.email.html_replies {
        BodyFormat::Html
    } else {
        BodyFormat::Plain
    };
    let composer = ReplyComposer::new(
        SenderIdentity {
            name: config.operator.display_name.clone(),
            address: config.email.from_address.clone(),
        },
        format,
    );

    // ── Core ────────────────────────────────────────────────────────────
    let machine = Arc::new(ApprovalMachine::new(
        Arc::new(RecordStore::new(config.triage.max_records)),
        classifier.clone(),
        composer,
        Arc::new(SmtpSender::new(config.email.clone())),
        telegram.clone(),
        &config.triage,
    ));

    let poller = Arc::new(MailboxPoller::new(
        Arc::new(ImapMailbox::new(config.email.clone())),
        classifier,
        machine.clone(),
        config.triage.max_input_chars,
        config.email.mark_seen,
    ));
    let subscriptions = Arc::new(SubscriptionRegistry::new(poller, config.triage.poll_interval));

    let _sweeper = spawn_revision_sweeper(machine.clone(), REVISION_SWEEP_INTERVAL);

    let dispatcher = Dispatcher::new(machine, subscriptions.clone(), telegram.clone());
    let events = telegram.start();

    tokio::select! {
        _ = dispatcher.run(events) => {
            tracing::warn!("Operator event stream closed");
        }
        result = tokio::signal::ctrl_c() => {
            result.context("listening for Ctrl-C")?;
            tracing::info!("Shutting down");
        }
    }

    subscriptions.shutdown().await;
    Ok(())
}
