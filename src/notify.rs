//! Best-effort push notification to the site owner after a submission.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;

use crate::config::PushoverConfig;
use crate::error::NotifyError;

/// Pushover message endpoint.
pub const PUSHOVER_API_URL: &str = "https://api.pushover.net/1/messages.json";

/// Bound on one notification request.
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Sends a short title/message pair to the owner.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, message: &str) -> Result<(), NotifyError>;
}

/// Pushover client.
pub struct PushoverNotifier {
    config: PushoverConfig,
    client: reqwest::Client,
}

impl PushoverNotifier {
    pub fn new(config: PushoverConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(NOTIFY_TIMEOUT)
            .build()
            .map_err(|e| NotifyError::RequestFailed(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn api_url(&self) -> &str {
        self.config.api_url.as_deref().unwrap_or(PUSHOVER_API_URL)
    }
}

#[async_trait]
impl Notifier for PushoverNotifier {
    async fn notify(&self, title: &str, message: &str) -> Result<(), NotifyError> {
        let params = [
            ("token", self.config.token.expose_secret()),
            ("user", self.config.user.expose_secret()),
            ("title", title),
            ("message", message),
        ];

        let resp = self
            .client
            .post(self.api_url())
            .form(&params)
            .send()
            .await
            .map_err(|e| NotifyError::RequestFailed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(NotifyError::BadStatus(resp.status().as_u16()));
        }
        tracing::debug!(title, "Push notification sent");
        Ok(())
    }
}

/// Title and message for a new submission alert.
pub fn submission_alert(form_id: &str, name: &str, subject: &str) -> (String, String) {
    (
        format!("New submission: {form_id}"),
        format!("{name}: {subject}"),
    )
}
