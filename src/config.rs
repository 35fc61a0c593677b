//! Configuration types.
//!
//! Forms and delivery defaults come from a TOML file; per-process settings
//! (port, instance mailbox, counter store) come from the environment.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::delivery::{self, Route};
use crate::error::ConfigError;
use crate::templates::TemplateStore;

/// Default per-form quota (requests per minute).
const DEFAULT_RATE_LIMIT: u32 = 5;

/// Default branding tag for transactional-API mode.
pub const DEFAULT_BRAND_TAG: &str = "Postmark Inquiry:";

/// Outbound delivery mechanism for a form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Direct authenticated SMTP submission.
    #[default]
    #[serde(alias = "icloud", alias = "iCloud")]
    Smtp,
    /// Postmark transactional-email API, with branded formatting.
    Postmark,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Smtp => "smtp",
            DeliveryMode::Postmark => "postmark",
        }
    }

    /// Whether outgoing mail in this mode carries the branding tag.
    pub fn is_branded(&self) -> bool {
        matches!(self, DeliveryMode::Postmark)
    }
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpTls {
    /// TLS from the first byte (port 465).
    Implicit,
    /// Plain connection upgraded with STARTTLS (port 587).
    Starttls,
}

/// SMTP settings. Every field is optional so a form can override only part
/// of the instance-wide defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SmtpSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(alias = "user")]
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub from_address: Option<String>,
    pub tls: Option<SmtpTls>,
}

impl SmtpSettings {
    /// Field-by-field merge: values set here win over `defaults`.
    pub fn merged_over(&self, defaults: &SmtpSettings) -> SmtpSettings {
        SmtpSettings {
            host: self.host.clone().or_else(|| defaults.host.clone()),
            port: self.port.or(defaults.port),
            username: self.username.clone().or_else(|| defaults.username.clone()),
            password: self.password.clone().or_else(|| defaults.password.clone()),
            from_address: self
                .from_address
                .clone()
                .or_else(|| defaults.from_address.clone()),
            tls: self.tls.or(defaults.tls),
        }
    }
}

/// Postmark settings, mergeable like [`SmtpSettings`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostmarkSettings {
    #[serde(alias = "api_key")]
    pub server_token: Option<SecretString>,
    pub from_address: Option<String>,
    pub api_base: Option<String>,
    pub message_stream: Option<String>,
}

impl PostmarkSettings {
    pub fn merged_over(&self, defaults: &PostmarkSettings) -> PostmarkSettings {
        PostmarkSettings {
            server_token: self
                .server_token
                .clone()
                .or_else(|| defaults.server_token.clone()),
            from_address: self
                .from_address
                .clone()
                .or_else(|| defaults.from_address.clone()),
            api_base: self.api_base.clone().or_else(|| defaults.api_base.clone()),
            message_stream: self
                .message_stream
                .clone()
                .or_else(|| defaults.message_stream.clone()),
        }
    }
}

/// Supported human-verification providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptchaProvider {
    HCaptcha,
    ReCaptcha,
    Turnstile,
}

impl CaptchaProvider {
    pub fn name(&self) -> &'static str {
        match self {
            CaptchaProvider::HCaptcha => "hcaptcha",
            CaptchaProvider::ReCaptcha => "recaptcha",
            CaptchaProvider::Turnstile => "turnstile",
        }
    }

    /// Public verification endpoint.
    pub fn verify_url(&self) -> &'static str {
        match self {
            CaptchaProvider::HCaptcha => "https://api.hcaptcha.com/siteverify",
            CaptchaProvider::ReCaptcha => "https://www.google.com/recaptcha/api/siteverify",
            CaptchaProvider::Turnstile => {
                "https://challenges.cloudflare.com/turnstile/v0/siteverify"
            }
        }
    }
}

/// Per-form CAPTCHA configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptchaConfig {
    pub provider: CaptchaProvider,
    pub secret: SecretString,
    /// Overrides the provider's public endpoint.
    pub verify_url: Option<String>,
}

/// A statically configured form.
#[derive(Debug, Clone, Deserialize)]
pub struct FormConfig {
    /// Table name in the config file.
    #[serde(skip)]
    pub id: String,
    /// Path segment clients post to.
    pub key: String,
    /// Exact origins allowed to submit.
    pub allowed_domains: Vec<String>,
    #[serde(alias = "to_email")]
    pub recipients: Vec<String>,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    /// Admitted submissions per client per minute.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    /// Falls back to the global mode when unset.
    pub mode: Option<DeliveryMode>,
    pub smtp: Option<SmtpSettings>,
    pub postmark: Option<PostmarkSettings>,
    pub captcha: Option<CaptchaConfig>,
}

impl FormConfig {
    pub fn mode(&self) -> DeliveryMode {
        self.mode.unwrap_or_default()
    }

    /// Mailbox whose template set serves this form.
    pub fn primary_recipient(&self) -> Option<&str> {
        self.recipients.first().map(String::as_str)
    }

    /// Exact origin check: ASCII case-insensitive, trailing `/` ignored.
    pub fn allows_origin(&self, origin: &str) -> bool {
        let origin = origin.trim().trim_end_matches('/');
        if origin.is_empty() {
            return false;
        }
        self.allowed_domains
            .iter()
            .any(|allowed| allowed.trim().trim_end_matches('/').eq_ignore_ascii_case(origin))
    }
}

fn default_from_name() -> String {
    "Website Contact Form".to_string()
}

fn default_rate_limit() -> u32 {
    DEFAULT_RATE_LIMIT
}

/// What the rate limiter does when its counter store is unreachable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailPolicy {
    /// Admit and log a warning.
    #[default]
    Open,
    /// Deny.
    Closed,
}

/// Rate limiter settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub fail_policy: FailPolicy,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    /// Use the first `X-Forwarded-For` entry as the client identity.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            fail_policy: FailPolicy::default(),
            store_timeout_ms: default_store_timeout_ms(),
            trust_forwarded_for: false,
        }
    }
}

impl RateLimitConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn default_store_timeout_ms() -> u64 {
    2_000
}

/// Branded-mode formatting.
#[derive(Debug, Clone, Deserialize)]
pub struct BrandingConfig {
    #[serde(default = "default_brand_tag")]
    pub subject_tag: String,
    /// Banner text shown at the top of branded HTML bodies.
    #[serde(default = "default_banner")]
    pub banner: String,
}

impl Default for BrandingConfig {
    fn default() -> Self {
        Self {
            subject_tag: default_brand_tag(),
            banner: default_banner(),
        }
    }
}

fn default_brand_tag() -> String {
    DEFAULT_BRAND_TAG.to_string()
}

fn default_banner() -> String {
    "Postmark Inquiry".to_string()
}

/// Pushover push-notification credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct PushoverConfig {
    pub token: SecretString,
    pub user: SecretString,
    pub api_url: Option<String>,
}

/// Instance-wide defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub mode: DeliveryMode,
    #[serde(default)]
    pub smtp: SmtpSettings,
    #[serde(default)]
    pub postmark: PostmarkSettings,
    pub pushover: Option<PushoverConfig>,
    #[serde(default)]
    pub branding: BrandingConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Bound on each outbound send.
    #[serde(default = "default_delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,
}

impl GlobalConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }
}

fn default_delivery_timeout_secs() -> u64 {
    20
}

/// The parsed configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    pub forms: BTreeMap<String, FormConfig>,
}

impl AppConfig {
    /// Path from `MAILBRIDGE_CONFIG`, else `/config/config.toml` when it
    /// exists, else `config/config.toml`.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("MAILBRIDGE_CONFIG") {
            return PathBuf::from(path);
        }
        let mounted = PathBuf::from("/config/config.toml");
        if mounted.exists() {
            mounted
        } else {
            PathBuf::from("config/config.toml")
        }
    }

    /// Read and parse a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    /// Parse config text, fill in form ids and inherited modes, and check
    /// the structural invariants.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let mut config: AppConfig =
            toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let global_mode = config.global.mode;
        for (id, form) in config.forms.iter_mut() {
            form.id = id.clone();
            form.mode.get_or_insert(global_mode);
        }

        config.check_forms()?;
        Ok(config)
    }

    fn check_forms(&self) -> Result<(), ConfigError> {
        if self.forms.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "forms".into(),
                hint: "Define at least one [forms.<name>] table.".into(),
            });
        }

        let mut keys = HashSet::new();
        for form in self.forms.values() {
            if form.key.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: format!("forms.{}.key", form.id),
                    message: "must not be empty".into(),
                });
            }
            if !keys.insert(form.key.as_str()) {
                return Err(ConfigError::InvalidValue {
                    key: format!("forms.{}.key", form.id),
                    message: format!("key {:?} is used by more than one form", form.key),
                });
            }
            if form.recipients.is_empty() {
                return Err(ConfigError::MissingRequired {
                    key: format!("forms.{}.recipients", form.id),
                    hint: "A form needs at least one recipient address.".into(),
                });
            }
            if form.allowed_domains.is_empty() {
                return Err(ConfigError::MissingRequired {
                    key: format!("forms.{}.allowed_domains", form.id),
                    hint: "List the exact origins allowed to submit.".into(),
                });
            }
            if form.rate_limit == 0 {
                return Err(ConfigError::InvalidValue {
                    key: format!("forms.{}.rate_limit", form.id),
                    message: "must be at least 1".into(),
                });
            }
        }
        Ok(())
    }

    /// Cross-check forms against the template table and resolve every
    /// form's delivery route. Returns the routes keyed by form id.
    pub fn validate(&self, templates: &TemplateStore) -> Result<HashMap<String, Route>, ConfigError> {
        let mut routes = HashMap::with_capacity(self.forms.len());
        for form in self.forms.values() {
            let recipient = form.primary_recipient().unwrap_or_default();
            if templates.get(recipient).is_none() {
                return Err(ConfigError::MissingRequired {
                    key: format!("responses[{recipient:?}]"),
                    hint: format!("Form {} needs a template set for its first recipient.", form.id),
                });
            }
            routes.insert(form.id.clone(), delivery::resolve_route(form, &self.global)?);
        }
        Ok(routes)
    }

    /// Look up a form by its URL key.
    pub fn form_by_key(&self, key: &str) -> Option<&FormConfig> {
        self.forms.values().find(|f| f.key == key)
    }

    /// The form whose first recipient is `mailbox`, if any.
    pub fn form_for_mailbox(&self, mailbox: &str) -> Option<&FormConfig> {
        self.forms.values().find(|f| {
            f.primary_recipient()
                .is_some_and(|r| r.eq_ignore_ascii_case(mailbox))
        })
    }
}

/// Per-process settings read from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Mailbox this instance watches. The daemon is disabled when unset.
    pub instance_email: Option<String>,
    /// Shared counter store; in-memory counters when unset.
    pub redis_url: Option<String>,
    pub responses_path: PathBuf,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1234);

        let instance_email = std::env::var("INSTANCE_EMAIL")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let redis_url = std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty());

        let responses_path = std::env::var("MAILBRIDGE_RESPONSES")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let mounted = PathBuf::from("/config/responses.json");
                if mounted.exists() {
                    mounted
                } else {
                    PathBuf::from("config/responses.json")
                }
            });

        Self {
            port,
            instance_email,
            redis_url,
            responses_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[global]
mode = "iCloud"

[global.smtp]
host = "smtp.mail.me.com"
port = 587
username = "owner@icloud.com"
password = "app-password"

[forms.contact]
key = "abc123"
allowed_domains = ["https://example.com"]
to_email = ["contact@example.com"]
rate_limit = 2

[forms.support]
key = "def456"
mode = "postmark"
allowed_domains = ["https://support.example.com/"]
recipients = ["support@example.com"]

[forms.support.postmark]
server_token = "pm-token"
from_address = "support@example.com"
"#;

    #[test]
    fn parses_forms_with_ids_and_defaults() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.forms.len(), 2);

        let contact = &config.forms["contact"];
        assert_eq!(contact.id, "contact");
        assert_eq!(contact.rate_limit, 2);
        assert_eq!(contact.mode(), DeliveryMode::Smtp);
        assert_eq!(contact.recipients, vec!["contact@example.com"]);
        assert_eq!(contact.from_name, "Website Contact Form");

        let support = &config.forms["support"];
        assert_eq!(support.rate_limit, DEFAULT_RATE_LIMIT);
        assert_eq!(support.mode(), DeliveryMode::Postmark);
    }

    #[test]
    fn form_inherits_global_mode() {
        let raw = SAMPLE.replace("mode = \"iCloud\"", "mode = \"postmark\"");
        let config = AppConfig::from_toml(&raw).unwrap();
        assert_eq!(config.forms["contact"].mode(), DeliveryMode::Postmark);
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let raw = SAMPLE.replace("def456", "abc123");
        let err = AppConfig::from_toml(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn form_without_recipients_is_rejected() {
        let raw = r#"
[forms.empty]
key = "k"
allowed_domains = ["https://a.com"]
recipients = []
"#;
        let err = AppConfig::from_toml(raw).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));
    }

    #[test]
    fn unknown_mode_is_a_parse_error() {
        let raw = SAMPLE.replace("mode = \"postmark\"", "mode = \"carrier-pigeon\"");
        let err = AppConfig::from_toml(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn origin_match_is_exact() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        let contact = &config.forms["contact"];
        assert!(contact.allows_origin("https://example.com"));
        assert!(contact.allows_origin("https://EXAMPLE.com/"));
        assert!(!contact.allows_origin("https://evil-example.com"));
        assert!(!contact.allows_origin("https://example.com.evil.net"));
        assert!(!contact.allows_origin("http://example.com"));
        assert!(!contact.allows_origin(""));

        let support = &config.forms["support"];
        assert!(support.allows_origin("https://support.example.com"));
    }

    #[test]
    fn lookup_by_key_and_mailbox() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.form_by_key("def456").unwrap().id, "support");
        assert!(config.form_by_key("nope").is_none());
        assert_eq!(
            config.form_for_mailbox("Contact@Example.com").unwrap().id,
            "contact"
        );
    }

    #[test]
    fn smtp_override_merges_field_by_field() {
        let defaults = SmtpSettings {
            host: Some("smtp.default".into()),
            port: Some(587),
            username: Some("default-user".into()),
            password: Some(SecretString::from("pw")),
            from_address: None,
            tls: None,
        };
        let overrides = SmtpSettings {
            username: Some("form-user".into()),
            ..Default::default()
        };
        let merged = overrides.merged_over(&defaults);
        assert_eq!(merged.host.as_deref(), Some("smtp.default"));
        assert_eq!(merged.username.as_deref(), Some("form-user"));
        assert_eq!(merged.port, Some(587));
        assert!(merged.password.is_some());
    }

    fn templates_for(mailboxes: &[&str]) -> TemplateStore {
        let sets: Vec<String> = mailboxes
            .iter()
            .map(|m| {
                format!(
                    r#""{m}": {{"subjects": {{"general": "Hi {{0}}"}},
                        "form_submission_template": {{"subject": "New: {{2}}", "body": "{{3}}"}}}}"#
                )
            })
            .collect();
        TemplateStore::from_json(&format!("{{{}}}", sets.join(","))).unwrap()
    }

    #[test]
    fn validate_resolves_every_route() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        let routes = config
            .validate(&templates_for(&["contact@example.com", "support@example.com"]))
            .unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes["contact"].mode(), DeliveryMode::Smtp);
        assert_eq!(routes["support"].mode(), DeliveryMode::Postmark);
    }

    #[test]
    fn validate_requires_template_set_per_form() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        let err = config
            .validate(&templates_for(&["contact@example.com"]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert!(config.form_by_key("abc123").is_some());
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = AppConfig::load(Path::new("/nonexistent/mailbridge.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
