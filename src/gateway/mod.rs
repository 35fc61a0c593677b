//! Submission gateway: turns one inbound form post into one notification
//! to the form's recipients.
//!
//! Stages run in a fixed order and any of them can reject:
//! authorization, validation, rate check, CAPTCHA, compose, dispatch,
//! notify. Nothing is delivered unless every earlier stage passed.

pub mod routes;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lettre::Address;
use lettre::message::Mailbox;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::captcha::{CaptchaVerifier, Verdict};
use crate::config::{AppConfig, FormConfig};
use crate::delivery::{DeliveryRouter, OutboundMessage, Route};
use crate::error::{ConfigError, GatewayError};
use crate::notify::{self, Notifier};
use crate::ratelimit::RateLimiter;
use crate::templates::TemplateStore;

const MAX_NAME_CHARS: usize = 100;
const MAX_EMAIL_CHARS: usize = 254;
const MAX_SUBJECT_CHARS: usize = 200;
const MAX_CONTENT_CHARS: usize = 10_000;

/// Upper bound on waiting for the push notification before responding.
const NOTIFY_WAIT: Duration = Duration::from_secs(5);

/// Form fields as posted by the client, JSON or url-encoded.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmissionPayload {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default, alias = "message")]
    pub content: String,
    #[serde(default, alias = "hcaptcha", alias = "h-captcha-response")]
    pub captcha_token: Option<String>,
}

/// Transport-level facts about the request.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub origin: Option<String>,
    /// Identity the rate limiter counts against.
    pub client_key: String,
    /// Forwarded to the CAPTCHA provider when known.
    pub client_ip: Option<String>,
}

/// A validated submission bound to its form.
#[derive(Debug, Clone)]
pub struct Submission<'a> {
    pub id: Uuid,
    pub form: &'a FormConfig,
    pub name: String,
    pub email: Address,
    pub subject: String,
    pub content: String,
    pub captcha_token: Option<String>,
    pub received_at: DateTime<Utc>,
    pub origin: Option<String>,
    pub client_key: String,
}

/// Checkpoints a request passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Validated,
    RateChecked,
    CaptchaChecked,
    Composed,
    Dispatched,
    Notified,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Validated => "validated",
            Stage::RateChecked => "rate_checked",
            Stage::CaptchaChecked => "captcha_checked",
            Stage::Composed => "composed",
            Stage::Dispatched => "dispatched",
            Stage::Notified => "notified",
        };
        f.write_str(name)
    }
}

fn enter(id: &Uuid, form: &str, stage: Stage) {
    debug!(request_id = %id, form, stage = %stage, "Submission advanced");
}

/// Check field presence and bounds, and parse the sender address.
pub fn validate(payload: &SubmissionPayload) -> Result<Address, GatewayError> {
    fn check(field: &str, value: &str, max: usize, required: bool) -> Result<(), GatewayError> {
        if required && value.trim().is_empty() {
            return Err(GatewayError::Validation(format!("Field '{field}' is required")));
        }
        if value.chars().count() > max {
            return Err(GatewayError::Validation(format!(
                "Field '{field}' must be at most {max} characters"
            )));
        }
        Ok(())
    }

    check("name", &payload.name, MAX_NAME_CHARS, true)?;
    check("email", &payload.email, MAX_EMAIL_CHARS, true)?;
    check("subject", &payload.subject, MAX_SUBJECT_CHARS, true)?;
    check("content", &payload.content, MAX_CONTENT_CHARS, true)?;

    payload
        .email
        .trim()
        .parse::<Address>()
        .map_err(|_| GatewayError::Validation("Field 'email' is not a valid address".into()))
}

/// Everything a submission needs, built once at startup.
pub struct SubmissionGateway {
    config: AppConfig,
    routes: HashMap<String, Route>,
    templates: Arc<TemplateStore>,
    limiter: RateLimiter,
    captcha: Arc<dyn CaptchaVerifier>,
    router: Arc<DeliveryRouter>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl SubmissionGateway {
    /// Validate the configuration against the template table and resolve
    /// every form's route. Fails on the first misconfigured form.
    pub fn new(
        config: AppConfig,
        templates: Arc<TemplateStore>,
        limiter: RateLimiter,
        captcha: Arc<dyn CaptchaVerifier>,
        router: Arc<DeliveryRouter>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Result<Self, ConfigError> {
        let routes = config.validate(&templates)?;
        Ok(Self {
            config,
            routes,
            templates,
            limiter,
            captcha,
            router,
            notifier,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Resolved route for a form id.
    pub fn route(&self, form_id: &str) -> Option<&Route> {
        self.routes.get(form_id)
    }

    /// Whether `origin` may call the form addressed by `form_key`.
    pub fn origin_allowed(&self, form_key: &str, origin: &str) -> bool {
        self.config
            .form_by_key(form_key)
            .is_some_and(|form| form.allows_origin(origin))
    }

    /// Resolve the form for `form_key` and check the caller's origin.
    pub fn authorize(&self, form_key: &str, origin: Option<&str>) -> Result<&FormConfig, GatewayError> {
        let form = self
            .config
            .form_by_key(form_key)
            .ok_or(GatewayError::UnknownForm)?;
        if !origin.is_some_and(|o| form.allows_origin(o)) {
            return Err(GatewayError::OriginNotAllowed {
                form: form.id.clone(),
                origin: origin.map(str::to_string),
            });
        }
        Ok(form)
    }

    /// Run one submission through every stage.
    pub async fn submit(
        &self,
        form_key: &str,
        payload: SubmissionPayload,
        meta: RequestMeta,
    ) -> Result<Uuid, GatewayError> {
        let id = Uuid::new_v4();

        let form = self.authorize(form_key, meta.origin.as_deref())?;
        enter(&id, &form.id, Stage::Received);

        let email = validate(&payload)?;
        let submission = Submission {
            id,
            form,
            name: payload.name.trim().to_string(),
            email,
            subject: payload.subject.trim().to_string(),
            content: payload.content,
            captcha_token: payload.captcha_token.filter(|t| !t.trim().is_empty()),
            received_at: Utc::now(),
            origin: meta.origin,
            client_key: meta.client_key,
        };
        enter(&id, &form.id, Stage::Validated);

        if !self
            .limiter
            .admit(&form.id, &submission.client_key, form.rate_limit)
            .await
            .is_allowed()
        {
            return Err(GatewayError::RateLimited {
                form: form.id.clone(),
            });
        }
        enter(&id, &form.id, Stage::RateChecked);

        self.check_captcha(&submission, meta.client_ip.as_deref())
            .await?;
        enter(&id, &form.id, Stage::CaptchaChecked);

        let route = self
            .routes
            .get(&form.id)
            .ok_or_else(|| GatewayError::Internal(format!("no route resolved for form {}", form.id)))?;
        let message = self.compose(&submission, route)?;
        enter(&id, &form.id, Stage::Composed);

        self.router.dispatch(route, message).await?;
        enter(&id, &form.id, Stage::Dispatched);

        self.notify(&submission).await;
        enter(&id, &form.id, Stage::Notified);

        info!(
            request_id = %id,
            form = %form.id,
            mode = %route.mode(),
            received_at = %submission.received_at.to_rfc3339(),
            "Submission delivered"
        );
        Ok(id)
    }

    async fn check_captcha(&self, submission: &Submission<'_>, client_ip: Option<&str>) -> Result<(), GatewayError> {
        let form = submission.form;
        let Some(captcha) = &form.captcha else {
            return Ok(());
        };
        let rejected = || GatewayError::CaptchaRejected {
            form: form.id.clone(),
        };

        let Some(token) = submission.captcha_token.as_deref() else {
            return Err(rejected());
        };

        match self.captcha.verify(captcha, token, client_ip).await {
            Ok(Verdict::Pass) => Ok(()),
            Ok(Verdict::Fail) => Err(rejected()),
            Err(e) => {
                warn!(request_id = %submission.id, form = %form.id, error = %e, "CAPTCHA provider unavailable; continuing");
                Ok(())
            }
        }
    }

    /// Build the recipient notification from the first recipient's
    /// submission template.
    fn compose(&self, submission: &Submission<'_>, route: &Route) -> Result<OutboundMessage, GatewayError> {
        let form = submission.form;
        let internal = |reason: String| GatewayError::Internal(reason);

        let recipient = form
            .primary_recipient()
            .ok_or_else(|| internal(format!("form {} has no recipients", form.id)))?;
        let email = submission.email.to_string();
        let (subject, html_body) = self
            .templates
            .render_submission(
                recipient,
                &submission.name,
                &email,
                &submission.subject,
                &submission.content,
            )
            .map_err(|e| internal(e.to_string()))?;

        let sender: Address = route
            .sender_address()
            .parse()
            .map_err(|e| internal(format!("invalid sender address for form {}: {e}", form.id)))?;
        let to = form
            .recipients
            .iter()
            .map(|r| r.parse::<Mailbox>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| internal(format!("invalid recipient for form {}: {e}", form.id)))?;

        Ok(OutboundMessage {
            from: Mailbox::new(Some(form.from_name.clone()), sender),
            to,
            reply_to: Some(Mailbox::new(
                Some(submission.name.clone()),
                submission.email.clone(),
            )),
            subject,
            html_body,
        })
    }

    /// Best-effort push; failures and timeouts are only logged.
    async fn notify(&self, submission: &Submission<'_>) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let (title, message) =
            notify::submission_alert(&submission.form.id, &submission.name, &submission.subject);

        match tokio::time::timeout(NOTIFY_WAIT, notifier.notify(&title, &message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(request_id = %submission.id, error = %e, "Push notification failed"),
            Err(_) => warn!(request_id = %submission.id, "Push notification timed out"),
        }
    }
}
