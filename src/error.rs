//! Error types for mailbridge.

use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Configuration-related errors. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a submission is rejected before or during delivery.
///
/// Each variant maps to one HTTP status; the message returned to the caller
/// is generic and never carries the inner detail.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Unknown form key")]
    UnknownForm,

    #[error("Origin {origin:?} not allowed for form {form}")]
    OriginNotAllowed { form: String, origin: Option<String> },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Rate limit exceeded for form {form}")]
    RateLimited { form: String },

    #[error("CAPTCHA rejected for form {form}")]
    CaptchaRejected { form: String },

    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status for this rejection.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::UnknownForm => StatusCode::NOT_FOUND,
            GatewayError::OriginNotAllowed { .. } => StatusCode::FORBIDDEN,
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CaptchaRejected { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Delivery(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Caller-facing message. Validation errors are the caller's own input,
    /// so their reason is echoed; everything else stays generic.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::UnknownForm => "Form not found".into(),
            GatewayError::OriginNotAllowed { .. } => "Domain not allowed".into(),
            GatewayError::Validation(reason) => reason.clone(),
            GatewayError::RateLimited { .. } => "Too many requests".into(),
            GatewayError::CaptchaRejected { .. } => "CAPTCHA verification failed".into(),
            GatewayError::Delivery(_) => "Failed to send email".into(),
            GatewayError::Internal(_) => "Internal server error".into(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Submission failed");
        } else {
            tracing::info!(status = status.as_u16(), error = %self, "Submission rejected");
        }

        (
            status,
            Json(serde_json::json!({
                "status": "error",
                "message": self.public_message(),
            })),
        )
            .into_response()
    }
}

/// Outbound delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Transient {mode} failure: {reason}")]
    Transient { mode: String, reason: String },

    #[error("Permanent {mode} failure: {reason}")]
    Permanent { mode: String, reason: String },

    #[error("Provider {provider} returned status {status}")]
    Provider { provider: String, status: u16 },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("{mode} delivery timed out after {timeout:?}")]
    Timeout { mode: String, timeout: Duration },
}

impl DeliveryError {
    /// Whether a retry could plausibly succeed without risking a duplicate.
    /// A timeout is not: the provider may already have accepted the message.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient { .. })
    }
}

/// CAPTCHA verification errors. Distinct from a provider rejecting a token.
#[derive(Debug, thiserror::Error)]
pub enum CaptchaError {
    #[error("CAPTCHA provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("CAPTCHA provider {provider} returned status {status}")]
    BadStatus { provider: String, status: u16 },

    #[error("Invalid response from CAPTCHA provider {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Rate-limit counter store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),

    #[error("Counter store timed out after {0:?}")]
    Timeout(Duration),

    #[error("Counter store returned an unexpected reply: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Push notification errors. Logged, never surfaced to a caller.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification request failed: {0}")]
    RequestFailed(String),

    #[error("Notification provider returned status {0}")]
    BadStatus(u16),
}

/// Inbound mailbox errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Mailbox connection to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    #[error("Mailbox login failed for {user}")]
    AuthFailed { user: String },

    #[error("Mailbox command {command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Mailbox protocol error: {0}")]
    Protocol(String),

    #[error("Mailbox IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Response template errors.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("No response templates configured for {recipient}")]
    UnknownRecipient { recipient: String },

    #[error("No template matches subject {subject:?} for {recipient}")]
    NoCategory { recipient: String, subject: String },

    #[error("Unknown category {category} for {recipient}")]
    UnknownCategory { recipient: String, category: String },

    #[error("Placeholder {{{index}}} has no value in pattern {pattern:?}")]
    MissingInterpolant { index: usize, pattern: String },

    #[error("Malformed placeholder in pattern {pattern:?}")]
    MalformedPattern { pattern: String },
}
