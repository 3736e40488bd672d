//! Email adapters: IMAP over rustls for the mailbox, SMTP via lettre for replies.
//!
//! Every call opens its own connection and drops it before returning, so a
//! failure never leaves a half-used session behind.

use std::io::{Read, Write as IoWrite};
use std::net::TcpStream;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, Message, SmtpTransport, Transport};
use regex::Regex;
use secrecy::ExposeSecret;
use tracing::{debug, info};

use crate::channels::channel::{MailSender, MailboxClient};
use crate::config::EmailConfig;
use crate::error::ChannelError;
use crate::records::compose::{BodyFormat, OutgoingMail};

/// Socket read timeout for IMAP.
const IMAP_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Matches a line announcing an IMAP literal, e.g. `* 3 FETCH (UID 7 BODY[] {1532}`.
static LITERAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\d+)\}\r?\n?$").expect("valid literal regex"));

/// Error type for blocking IMAP operations.
type ImapError = Box<dyn std::error::Error + Send + Sync>;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

// ── Mailbox ─────────────────────────────────────────────────────────

/// IMAP mailbox client. Ids are IMAP UIDs.
pub struct ImapMailbox {
    config: EmailConfig,
}

impl ImapMailbox {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    async fn run_blocking<T, F>(&self, op: F) -> Result<T, ChannelError>
    where
        T: Send + 'static,
        F: FnOnce(&EmailConfig) -> Result<T, ImapError> + Send + 'static,
    {
        let cfg = self.config.clone();
        match tokio::task::spawn_blocking(move || op(&cfg)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ChannelError::FetchFailed {
                name: "imap".into(),
                reason: e.to_string(),
            }),
            Err(e) => Err(ChannelError::FetchFailed {
                name: "imap".into(),
                reason: format!("IMAP task panicked: {e}"),
            }),
        }
    }
}

#[async_trait]
impl MailboxClient for ImapMailbox {
    async fn list_unseen(&self) -> Result<Vec<String>, ChannelError> {
        self.run_blocking(list_unseen_imap).await
    }

    async fn fetch_raw(&self, id: &str) -> Result<Vec<u8>, ChannelError> {
        let uid = validate_uid(id)?;
        self.run_blocking(move |cfg| fetch_raw_imap(cfg, &uid)).await
    }

    async fn mark_seen(&self, ids: &[String]) -> Result<(), ChannelError> {
        if ids.is_empty() {
            return Ok(());
        }
        let uids = ids
            .iter()
            .map(|id| validate_uid(id))
            .collect::<Result<Vec<_>, _>>()?;
        self.run_blocking(move |cfg| mark_seen_imap(cfg, &uids)).await
    }
}

/// UIDs are interpolated into IMAP commands, so only digits are accepted.
fn validate_uid(id: &str) -> Result<String, ChannelError> {
    if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
        Ok(id.to_string())
    } else {
        Err(ChannelError::InvalidMessage(format!("invalid IMAP UID: {id}")))
    }
}

/// A tagged command's untagged lines plus any literals that came with them.
#[derive(Debug, Default)]
struct ImapResponse {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
}

/// One authenticated IMAP session with the mailbox selected.
struct ImapSession {
    tls: TlsStream,
    tag_counter: u32,
}

impl ImapSession {
    fn open(config: &EmailConfig) -> Result<Self, ImapError> {
        let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))?;
        tcp.set_read_timeout(Some(IMAP_READ_TIMEOUT))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(config.imap_host.clone())?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)?;

        let mut session = Self {
            tls: rustls::StreamOwned::new(conn, tcp),
            tag_counter: 0,
        };

        let _greeting = session.read_line()?;

        session
            .command(&format!(
                "LOGIN {} {}",
                quote_imap(&config.username),
                quote_imap(config.password.expose_secret())
            ))
            .map_err(|_| "IMAP login failed")?;
        session.command(&format!("SELECT {}", quote_imap(&config.mailbox)))?;

        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, ImapError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.tls.read(&mut byte) {
                Ok(0) => return Err("IMAP connection closed".into()),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send a tagged command and collect everything up to its completion line.
    fn command(&mut self, cmd: &str) -> Result<ImapResponse, ImapError> {
        self.tag_counter += 1;
        let tag = format!("A{}", self.tag_counter);
        IoWrite::write_all(&mut self.tls, format!("{tag} {cmd}\r\n").as_bytes())?;
        IoWrite::flush(&mut self.tls)?;

        let mut response = ImapResponse::default();
        loop {
            let line = self.read_line()?;
            if let Some(status) = line.strip_prefix(&format!("{tag} ")) {
                if status.starts_with("OK") {
                    return Ok(response);
                }
                let verb = cmd.split_whitespace().next().unwrap_or(cmd);
                return Err(format!("IMAP {verb} failed: {}", status.trim_end()).into());
            }
            if let Some(len) = literal_len(&line) {
                let mut literal = vec![0u8; len];
                self.tls.read_exact(&mut literal)?;
                response.literals.push(literal);
            }
            response.lines.push(line);
        }
    }

    fn logout(mut self) {
        let _ = self.command("LOGOUT");
    }
}

/// Length of the literal announced at the end of `line`, if any.
fn literal_len(line: &str) -> Option<usize> {
    LITERAL_RE
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Quote a string as an IMAP quoted-string.
fn quote_imap(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Extract UIDs from `* SEARCH` response lines, preserving server order.
fn parse_search_response(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| line.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().map(str::to_string))
        .collect()
}

fn list_unseen_imap(config: &EmailConfig) -> Result<Vec<String>, ImapError> {
    let mut session = ImapSession::open(config)?;
    let response = session.command("UID SEARCH UNSEEN")?;
    session.logout();
    let uids = parse_search_response(&response.lines);
    debug!(count = uids.len(), "IMAP unseen search complete");
    Ok(uids)
}

fn fetch_raw_imap(config: &EmailConfig, uid: &str) -> Result<Vec<u8>, ImapError> {
    let mut session = ImapSession::open(config)?;
    // BODY.PEEK leaves \Seen alone; flagging is an explicit separate step.
    let response = session.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
    session.logout();
    response
        .literals
        .into_iter()
        .next()
        .ok_or_else(|| format!("IMAP message {uid} not found").into())
}

fn mark_seen_imap(config: &EmailConfig, uids: &[String]) -> Result<(), ImapError> {
    let mut session = ImapSession::open(config)?;
    session.command(&format!("UID STORE {} +FLAGS (\\Seen)", uids.join(",")))?;
    session.logout();
    debug!(count = uids.len(), "Flagged messages as seen");
    Ok(())
}

// ── Sender ──────────────────────────────────────────────────────────

/// SMTP submission over implicit TLS.
pub struct SmtpSender {
    config: EmailConfig,
}

impl SmtpSender {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailSender for SmtpSender {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), ChannelError> {
        let message = build_message(mail)?;
        let cfg = self.config.clone();
        let to = mail.to.clone();

        tokio::task::spawn_blocking(move || {
            let creds = Credentials::new(
                cfg.username.clone(),
                cfg.password.expose_secret().to_string(),
            );
            let transport = SmtpTransport::relay(&cfg.smtp_host)
                .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?
                .port(cfg.smtp_port)
                .credentials(creds)
                .build();
            transport
                .send(&message)
                .map_err(|e| send_failed(format!("SMTP send failed: {e}")))?;
            Ok::<(), ChannelError>(())
        })
        .await
        .map_err(|e| send_failed(format!("SMTP task panicked: {e}")))??;

        info!("Email sent to {to}");
        Ok(())
    }
}

fn send_failed(reason: String) -> ChannelError {
    ChannelError::SendFailed {
        name: "smtp".into(),
        reason,
    }
}

/// Convert a composed reply into a lettre message.
fn build_message(mail: &OutgoingMail) -> Result<Message, ChannelError> {
    let from_address: Address = mail
        .from
        .address
        .parse()
        .map_err(|e| send_failed(format!("Invalid from address: {e}")))?;
    let from = Mailbox::new(Some(mail.from.name.clone()), from_address);
    let to: Mailbox = mail
        .to
        .parse()
        .map_err(|e| send_failed(format!("Invalid to address: {e}")))?;
    let content_type = match mail.format {
        BodyFormat::Html => ContentType::TEXT_HTML,
        BodyFormat::Plain => ContentType::TEXT_PLAIN,
    };

    Message::builder()
        .from(from)
        .to(to)
        .subject(mail.subject.clone())
        .header(content_type)
        .body(mail.body.clone())
        .map_err(|e| send_failed(format!("Failed to build email: {e}")))
}
