//! Minimal blocking IMAP client over rustls.
//!
//! Each operation opens its own session (connect, LOGIN, SELECT, command,
//! LOGOUT) on the blocking pool. Messages are fetched with `BODY.PEEK[]`
//! so listing never sets `\Seen`, and `\Flagged` messages are never
//! listed.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use rustls_pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};

use super::{InboundMessage, Mailbox};
use crate::error::{ConfigError, MailboxError};

/// Default host for the instance mailbox.
pub const DEFAULT_IMAP_HOST: &str = "imap.mail.me.com";

/// IMAP connection settings, built from the environment.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Connect, read and write timeout.
    pub timeout: Duration,
}

impl ImapConfig {
    /// `EMAIL_USERNAME` defaults to the watched mailbox; `EMAIL_PASSWORD`
    /// is required.
    pub fn from_env(mailbox: &str) -> Result<Self, ConfigError> {
        let host = std::env::var("EMAIL_IMAP_HOST").unwrap_or_else(|_| DEFAULT_IMAP_HOST.into());

        let port: u16 = std::env::var("EMAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_else(|_| mailbox.to_string());
        let password = std::env::var("EMAIL_PASSWORD")
            .map_err(|_| ConfigError::MissingEnvVar("EMAIL_PASSWORD".into()))?;

        Ok(Self {
            host,
            port,
            username,
            password: SecretString::from(password),
            timeout: Duration::from_secs(30),
        })
    }
}

/// [`Mailbox`] backed by a real IMAP server.
pub struct ImapMailbox {
    config: ImapConfig,
}

impl ImapMailbox {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }

    async fn run<T, F>(&self, op: F) -> Result<T, MailboxError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Session<TlsStream>) -> Result<T, MailboxError> + Send + 'static,
    {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = Session::open(&config)?;
            let result = op(&mut session);
            // Best-effort; the server drops the connection either way.
            let _ = session.command("LOGOUT");
            result
        })
        .await
        .map_err(|e| MailboxError::Protocol(format!("IMAP task panicked: {e}")))?
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn list_unseen(&self) -> Result<Vec<InboundMessage>, MailboxError> {
        self.run(|session| session.unseen_messages()).await
    }

    async fn mark_seen(&self, uid: u32) -> Result<(), MailboxError> {
        self.run(move |session| session.add_flag(uid, "\\Seen")).await
    }

    async fn flag(&self, uid: u32) -> Result<(), MailboxError> {
        self.run(move |session| session.add_flag(uid, "\\Flagged")).await
    }
}

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

fn connect_tls(config: &ImapConfig) -> Result<TlsStream, MailboxError> {
    let connect_err = |reason: String| MailboxError::Connect {
        host: config.host.clone(),
        reason,
    };

    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| connect_err("host did not resolve".into()))?;
    let tcp = TcpStream::connect_timeout(&addr, config.timeout)?;
    tcp.set_read_timeout(Some(config.timeout))?;
    tcp.set_write_timeout(Some(config.timeout))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = ServerName::try_from(config.host.clone())
        .map_err(|e| connect_err(e.to_string()))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| connect_err(e.to_string()))?;
    Ok(rustls::StreamOwned::new(conn, tcp))
}

/// One untagged or tagged response line, plus any literals it carried.
#[derive(Debug, Default)]
struct ResponseLine {
    text: String,
    literals: Vec<Vec<u8>>,
}

/// An authenticated IMAP session with INBOX selected.
pub(crate) struct Session<S> {
    stream: S,
    next_tag: u32,
}

impl Session<TlsStream> {
    fn open(config: &ImapConfig) -> Result<Self, MailboxError> {
        let mut session = Session::new(connect_tls(config)?);
        session.greeting()?;
        session.login(&config.username, config.password.expose_secret())?;
        session.command("SELECT \"INBOX\"")?;
        Ok(session)
    }
}

impl<S: Read + Write> Session<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            next_tag: 1,
        }
    }

    fn read_raw_line(&mut self) -> Result<Vec<u8>, MailboxError> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.stream.read(&mut byte)? {
                0 => return Err(MailboxError::Protocol("connection closed".into())),
                _ => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(buf);
                    }
                }
            }
        }
    }

    /// Read one logical line, following `{n}` literals.
    fn read_response_line(&mut self) -> Result<ResponseLine, MailboxError> {
        let mut line = ResponseLine::default();
        loop {
            let raw = self.read_raw_line()?;
            let text = String::from_utf8_lossy(&raw);
            let text = text.trim_end_matches("\r\n");
            match literal_length(text) {
                Some(len) => {
                    line.text.push_str(text);
                    let mut literal = vec![0u8; len];
                    self.stream.read_exact(&mut literal)?;
                    line.literals.push(literal);
                }
                None => {
                    line.text.push_str(text);
                    return Ok(line);
                }
            }
        }
    }

    fn greeting(&mut self) -> Result<(), MailboxError> {
        let line = self.read_response_line()?;
        if line.text.starts_with("* OK") || line.text.starts_with("* PREAUTH") {
            Ok(())
        } else {
            Err(MailboxError::Protocol(format!("unexpected greeting: {}", line.text)))
        }
    }

    /// Send a command and collect everything up to its tagged completion.
    fn command(&mut self, cmd: &str) -> Result<Vec<ResponseLine>, MailboxError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        self.stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        self.stream.flush()?;

        let verb = cmd.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
        let mut lines = Vec::new();
        loop {
            let line = self.read_response_line()?;
            if let Some(status) = line.text.strip_prefix(&format!("{tag} ")) {
                if status.starts_with("OK") {
                    return Ok(lines);
                }
                return Err(MailboxError::Command {
                    command: verb,
                    reason: status.to_string(),
                });
            }
            lines.push(line);
        }
    }

    fn login(&mut self, username: &str, password: &str) -> Result<(), MailboxError> {
        self.command(&format!("LOGIN {} {}", quote(username), quote(password)))
            .map(|_| ())
            .map_err(|_| MailboxError::AuthFailed {
                user: username.to_string(),
            })
    }

    pub(crate) fn search_unseen(&mut self) -> Result<Vec<u32>, MailboxError> {
        let lines = self.command("UID SEARCH UNSEEN UNFLAGGED")?;
        Ok(lines
            .iter()
            .filter_map(|l| l.text.strip_prefix("* SEARCH"))
            .flat_map(|rest| rest.split_whitespace())
            .filter_map(|n| n.parse().ok())
            .collect())
    }

    pub(crate) fn fetch_peek(&mut self, uid: u32) -> Result<Vec<u8>, MailboxError> {
        let lines = self.command(&format!("UID FETCH {uid} (BODY.PEEK[])"))?;
        lines
            .into_iter()
            .find(|l| l.text.contains("FETCH"))
            .and_then(|l| l.literals.into_iter().next())
            .ok_or_else(|| MailboxError::Protocol(format!("no body returned for uid {uid}")))
    }

    /// Fetch every unseen, unflagged message. A message that cannot be
    /// fetched is skipped for this cycle; one that cannot be parsed is
    /// returned as a placeholder so it goes through the failure path.
    pub(crate) fn unseen_messages(&mut self) -> Result<Vec<InboundMessage>, MailboxError> {
        let uids = self.search_unseen()?;
        let mut messages = Vec::with_capacity(uids.len());
        for uid in uids {
            let raw = match self.fetch_peek(uid) {
                Ok(raw) => raw,
                Err(MailboxError::Io(e)) => return Err(MailboxError::Io(e)),
                Err(e) => {
                    tracing::warn!(uid, error = %e, "Fetching message failed; skipping it this cycle");
                    continue;
                }
            };
            messages.push(parse_message(uid, &raw).unwrap_or_else(|| {
                tracing::warn!(uid, "Message could not be parsed");
                InboundMessage::unparseable(uid)
            }));
        }
        Ok(messages)
    }

    pub(crate) fn add_flag(&mut self, uid: u32, flag: &str) -> Result<(), MailboxError> {
        self.command(&format!("UID STORE {uid} +FLAGS ({flag})"))
            .map(|_| ())
    }
}

/// `{n}` at the end of a line announces an n-byte literal.
fn literal_length(line: &str) -> Option<usize> {
    let rest = line.strip_suffix('}')?;
    let open = rest.rfind('{')?;
    rest[open + 1..].trim_end_matches('+').parse().ok()
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Parse a raw RFC 5322 message into an [`InboundMessage`].
pub fn parse_message(uid: u32, raw: &[u8]) -> Option<InboundMessage> {
    let parsed = MessageParser::default().parse(raw)?;

    let from = parsed
        .from()
        .and_then(|a| a.first())
        .and_then(|a| a.address())
        .map(str::to_string);
    let reply_to = parsed.reply_to().and_then(|a| a.first());
    let received_at = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    Some(InboundMessage {
        uid,
        message_id: parsed
            .message_id()
            .map(str::to_string)
            .unwrap_or_else(|| format!("uid:{uid}")),
        from,
        reply_to: reply_to.and_then(|a| a.address()).map(str::to_string),
        reply_to_name: reply_to.and_then(|a| a.name()).map(str::to_string),
        subject: parsed.subject().unwrap_or_default().to_string(),
        received_at,
        html_body: parsed.body_html(0).map(|b| b.into_owned()),
        text_body: parsed.body_text(0).map(|b| b.into_owned()),
        unparseable: false,
    })
}
