//! Outbound delivery: picks SMTP or Postmark per form, applies branded
//! formatting, and retries transient SMTP failures.

pub mod postmark;
pub mod smtp;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use secrecy::SecretString;
use tracing::{debug, info, warn};

use crate::config::{
    BrandingConfig, DeliveryMode, FormConfig, GlobalConfig, PostmarkSettings, SmtpSettings,
    SmtpTls,
};
use crate::error::{ConfigError, DeliveryError};

pub use self::postmark::PostmarkClient;

/// Default Postmark API base URL.
pub const POSTMARK_API_BASE: &str = "https://api.postmarkapp.com";

/// Backoff before each SMTP retry. Its length is the retry count.
const SMTP_RETRY_DELAYS: [Duration; 2] = [Duration::from_millis(250), Duration::from_millis(500)];

/// A composed message, independent of the mechanism that sends it.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub from: Mailbox,
    pub to: Vec<Mailbox>,
    pub reply_to: Option<Mailbox>,
    pub subject: String,
    pub html_body: String,
}

/// Fully resolved SMTP credentials.
#[derive(Debug, Clone)]
pub struct SmtpRoute {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub tls: SmtpTls,
}

/// Fully resolved Postmark credentials.
#[derive(Debug, Clone)]
pub struct PostmarkRoute {
    pub server_token: SecretString,
    pub from_address: String,
    pub api_base: String,
    pub message_stream: Option<String>,
}

/// A delivery mechanism together with its credentials.
#[derive(Debug, Clone)]
pub enum Route {
    Smtp(SmtpRoute),
    Postmark(PostmarkRoute),
}

impl Route {
    pub fn mode(&self) -> DeliveryMode {
        match self {
            Route::Smtp(_) => DeliveryMode::Smtp,
            Route::Postmark(_) => DeliveryMode::Postmark,
        }
    }

    /// Address outgoing mail is sent from.
    pub fn sender_address(&self) -> &str {
        match self {
            Route::Smtp(smtp) => &smtp.from_address,
            Route::Postmark(pm) => &pm.from_address,
        }
    }
}

fn missing(form: &str, field: &str, mode: DeliveryMode) -> ConfigError {
    ConfigError::MissingRequired {
        key: format!("forms.{form}.{mode}.{field}"),
        hint: format!("Set it on the form or under [global.{mode}]."),
    }
}

/// Merge a form's credential overrides over the global defaults for the
/// form's mode. Never falls back to the other mode.
pub fn resolve_route(form: &FormConfig, global: &GlobalConfig) -> Result<Route, ConfigError> {
    match form.mode() {
        DeliveryMode::Smtp => {
            let merged = form
                .smtp
                .clone()
                .unwrap_or_default()
                .merged_over(&global.smtp);
            smtp_route(&form.id, merged).map(Route::Smtp)
        }
        DeliveryMode::Postmark => {
            let merged = form
                .postmark
                .clone()
                .unwrap_or_default()
                .merged_over(&global.postmark);
            postmark_route(&form.id, merged).map(Route::Postmark)
        }
    }
}

fn smtp_route(form: &str, s: SmtpSettings) -> Result<SmtpRoute, ConfigError> {
    let mode = DeliveryMode::Smtp;
    let host = s.host.ok_or_else(|| missing(form, "host", mode))?;
    let username = s.username.ok_or_else(|| missing(form, "username", mode))?;
    let password = s.password.ok_or_else(|| missing(form, "password", mode))?;
    let port = s.port.unwrap_or(587);
    let tls = s
        .tls
        .unwrap_or(if port == 465 { SmtpTls::Implicit } else { SmtpTls::Starttls });
    let from_address = s.from_address.unwrap_or_else(|| username.clone());

    Ok(SmtpRoute {
        host,
        port,
        username,
        password,
        from_address,
        tls,
    })
}

fn postmark_route(form: &str, p: PostmarkSettings) -> Result<PostmarkRoute, ConfigError> {
    let mode = DeliveryMode::Postmark;
    Ok(PostmarkRoute {
        server_token: p
            .server_token
            .ok_or_else(|| missing(form, "server_token", mode))?,
        from_address: p
            .from_address
            .ok_or_else(|| missing(form, "from_address", mode))?,
        api_base: p.api_base.unwrap_or_else(|| POSTMARK_API_BASE.to_string()),
        message_stream: p.message_stream,
    })
}

/// Sends one message over a resolved route.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, route: &Route, message: &OutboundMessage) -> Result<(), DeliveryError>;
}

/// Transport that talks to real SMTP servers and the Postmark API.
pub struct LiveTransport {
    postmark: PostmarkClient,
    smtp_timeout: Duration,
}

impl LiveTransport {
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        Ok(Self {
            postmark: PostmarkClient::new(timeout)?,
            smtp_timeout: timeout,
        })
    }
}

#[async_trait]
impl MailTransport for LiveTransport {
    async fn deliver(&self, route: &Route, message: &OutboundMessage) -> Result<(), DeliveryError> {
        match route {
            Route::Smtp(smtp) => smtp::send(smtp, message, self.smtp_timeout).await,
            Route::Postmark(pm) => self.postmark.send(pm, message).await,
        }
    }
}

/// Single entry point for every outbound send.
pub struct DeliveryRouter {
    transport: Arc<dyn MailTransport>,
    branding: BrandingConfig,
    timeout: Duration,
}

impl DeliveryRouter {
    pub fn new(transport: Arc<dyn MailTransport>, branding: BrandingConfig, timeout: Duration) -> Self {
        Self {
            transport,
            branding,
            timeout,
        }
    }

    /// Apply the mode's formatting convention. Branded mode prefixes the
    /// subject with the tag (once) and wraps the body in a banner.
    pub fn format_for(&self, mode: DeliveryMode, mut message: OutboundMessage) -> OutboundMessage {
        if !mode.is_branded() {
            return message;
        }

        let tag = self.branding.subject_tag.trim();
        if !message.subject.trim_start().starts_with(tag) {
            message.subject = format!("{tag} {}", message.subject.trim_start());
        }
        message.html_body = format!(
            concat!(
                "<div style=\"font-family:Helvetica,Arial,sans-serif;\">",
                "<div style=\"background:#ffde00;color:#000;padding:12px 16px;font-weight:bold;\">{banner}</div>",
                "<div style=\"padding:16px;\">{body}</div>",
                "</div>"
            ),
            banner = crate::templates::escape_html(&self.branding.banner),
            body = message.html_body,
        );
        message
    }

    /// Format and send `message` over `route`.
    ///
    /// SMTP transient failures are retried with short backoff; Postmark is
    /// called exactly once.
    pub async fn dispatch(&self, route: &Route, message: OutboundMessage) -> Result<(), DeliveryError> {
        let mode = route.mode();
        let message = self.format_for(mode, message);
        let retries = match route {
            Route::Smtp(_) => SMTP_RETRY_DELAYS.len(),
            Route::Postmark(_) => 0,
        };

        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(
                self.timeout,
                self.transport.deliver(route, &message),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Timeout {
                    mode: mode.to_string(),
                    timeout: self.timeout,
                }),
            };

            match result {
                Ok(()) => {
                    info!(mode = %mode, subject = %message.subject, attempts = attempt + 1, "Message delivered");
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < retries => {
                    let delay = SMTP_RETRY_DELAYS[attempt];
                    warn!(mode = %mode, error = %e, attempt = attempt + 1, "Delivery failed, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(mode = %mode, attempts = attempt + 1, "Giving up on delivery");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::AppConfig;

    /// Records delivered messages; fails the first `fail_first` attempts.
    struct ScriptedTransport {
        fail_first: usize,
        error: fn() -> DeliveryError,
        attempts: AtomicUsize,
        sent: Mutex<Vec<OutboundMessage>>,
    }

    impl ScriptedTransport {
        fn ok() -> Arc<Self> {
            Self::failing(0, transient)
        }

        fn failing(fail_first: usize, error: fn() -> DeliveryError) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                error,
                attempts: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MailTransport for ScriptedTransport {
        async fn deliver(&self, _route: &Route, message: &OutboundMessage) -> Result<(), DeliveryError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err((self.error)());
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn transient() -> DeliveryError {
        DeliveryError::Transient {
            mode: "smtp".into(),
            reason: "connection refused".into(),
        }
    }

    fn permanent() -> DeliveryError {
        DeliveryError::Permanent {
            mode: "smtp".into(),
            reason: "550 mailbox unavailable".into(),
        }
    }

    fn smtp() -> Route {
        Route::Smtp(SmtpRoute {
            host: "smtp.test".into(),
            port: 587,
            username: "user@example.com".into(),
            password: SecretString::from("pw"),
            from_address: "user@example.com".into(),
            tls: SmtpTls::Starttls,
        })
    }

    fn postmark() -> Route {
        Route::Postmark(PostmarkRoute {
            server_token: SecretString::from("token"),
            from_address: "hello@example.com".into(),
            api_base: POSTMARK_API_BASE.into(),
            message_stream: None,
        })
    }

    fn message(subject: &str) -> OutboundMessage {
        OutboundMessage {
            from: "Site <hello@example.com>".parse().unwrap(),
            to: vec!["owner@example.com".parse().unwrap()],
            reply_to: None,
            subject: subject.into(),
            html_body: "<p>Body</p>".into(),
        }
    }

    fn router(transport: Arc<ScriptedTransport>) -> DeliveryRouter {
        DeliveryRouter::new(transport, BrandingConfig::default(), Duration::from_secs(5))
    }

    // ── Formatting ──────────────────────────────────────────────────

    #[tokio::test]
    async fn postmark_mode_prefixes_subject() {
        let transport = ScriptedTransport::ok();
        router(transport.clone())
            .dispatch(&postmark(), message("Support"))
            .await
            .unwrap();
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].subject, "Postmark Inquiry: Support");
        assert!(sent[0].html_body.contains("<p>Body</p>"));
        assert!(sent[0].html_body.contains("Postmark Inquiry</div>"));
    }

    #[tokio::test]
    async fn smtp_mode_never_prefixes_subject() {
        let transport = ScriptedTransport::ok();
        router(transport.clone())
            .dispatch(&smtp(), message("Support"))
            .await
            .unwrap();
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].subject, "Support");
        assert_eq!(sent[0].html_body, "<p>Body</p>");
    }

    #[test]
    fn branding_prefix_is_not_doubled() {
        let router = router(ScriptedTransport::ok());
        let formatted = router.format_for(
            DeliveryMode::Postmark,
            message("Postmark Inquiry: Support"),
        );
        assert_eq!(formatted.subject, "Postmark Inquiry: Support");
    }

    // ── Retry ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn smtp_transient_failures_are_retried() {
        let transport = ScriptedTransport::failing(2, transient);
        router(transport.clone())
            .dispatch(&smtp(), message("Hi"))
            .await
            .unwrap();
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn smtp_retries_are_bounded() {
        let transport = ScriptedTransport::failing(usize::MAX, transient);
        let err = router(transport.clone())
            .dispatch(&smtp(), message("Hi"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let transport = ScriptedTransport::failing(usize::MAX, permanent);
        let err = router(transport.clone())
            .dispatch(&smtp(), message("Hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Permanent { .. }));
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn postmark_is_called_once() {
        let transport = ScriptedTransport::failing(usize::MAX, transient);
        router(transport.clone())
            .dispatch(&postmark(), message("Hi"))
            .await
            .unwrap_err();
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
    }

    // ── Credential resolution ───────────────────────────────────────

    const CONFIG: &str = r#"
[global.smtp]
host = "smtp.mail.me.com"
username = "owner@icloud.com"
password = "global-pw"

[forms.plain]
key = "k1"
allowed_domains = ["https://a.com"]
recipients = ["a@a.com"]

[forms.override]
key = "k2"
allowed_domains = ["https://a.com"]
recipients = ["a@a.com"]

[forms.override.smtp]
username = "form@icloud.com"
port = 465

[forms.api]
key = "k3"
mode = "postmark"
allowed_domains = ["https://a.com"]
recipients = ["a@a.com"]
"#;

    #[test]
    fn resolves_global_smtp_defaults() {
        let config = AppConfig::from_toml(CONFIG).unwrap();
        let Route::Smtp(route) = resolve_route(&config.forms["plain"], &config.global).unwrap() else {
            panic!("expected smtp route");
        };
        assert_eq!(route.host, "smtp.mail.me.com");
        assert_eq!(route.port, 587);
        assert_eq!(route.tls, SmtpTls::Starttls);
        assert_eq!(route.from_address, "owner@icloud.com");
    }

    #[test]
    fn per_form_override_wins() {
        let config = AppConfig::from_toml(CONFIG).unwrap();
        let Route::Smtp(route) = resolve_route(&config.forms["override"], &config.global).unwrap() else {
            panic!("expected smtp route");
        };
        assert_eq!(route.username, "form@icloud.com");
        assert_eq!(route.host, "smtp.mail.me.com");
        assert_eq!(route.tls, SmtpTls::Implicit);
    }

    #[test]
    fn missing_credentials_for_mode_fail_fast() {
        let config = AppConfig::from_toml(CONFIG).unwrap();
        // SMTP credentials exist, but the form is in Postmark mode.
        let err = resolve_route(&config.forms["api"], &config.global).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));
    }
}
