//! Postmark transactional-email API client.

use std::time::Duration;

use secrecy::ExposeSecret;
use serde::Serialize;

use super::{OutboundMessage, PostmarkRoute};
use crate::error::DeliveryError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct EmailRequest<'a> {
    from: String,
    to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
    subject: &'a str,
    html_body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_stream: Option<&'a str>,
}

/// Thin client over `POST /email`.
pub struct PostmarkClient {
    client: reqwest::Client,
}

impl PostmarkClient {
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Permanent {
                mode: "postmark".into(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }

    pub async fn send(&self, route: &PostmarkRoute, message: &OutboundMessage) -> Result<(), DeliveryError> {
        let body = EmailRequest {
            from: message.from.to_string(),
            to: message
                .to
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
            reply_to: message.reply_to.as_ref().map(ToString::to_string),
            subject: &message.subject,
            html_body: &message.html_body,
            message_stream: route.message_stream.as_deref(),
        };

        let url = format!("{}/email", route.api_base.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .header("Accept", "application/json")
            .header("X-Postmark-Server-Token", route.server_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient {
                mode: "postmark".into(),
                reason: format!("Postmark request failed: {e}"),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), detail = %detail, "Postmark rejected message");
            return Err(DeliveryError::Provider {
                provider: "postmark".into(),
                status: status.as_u16(),
            });
        }

        Ok(())
    }
}
