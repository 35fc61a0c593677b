//! CAPTCHA verification against hCaptcha, reCAPTCHA or Turnstile.
//!
//! All three accept the same form-encoded `secret`/`response`/`remoteip`
//! request and answer `{"success": bool, ...}`.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;

use crate::config::CaptchaConfig;
use crate::error::CaptchaError;

/// Default bound on a verification round-trip.
pub const DEFAULT_CAPTCHA_TIMEOUT: Duration = Duration::from_secs(5);

/// Provider verdict on a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
}

/// Verifies CAPTCHA tokens.
#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    /// `Err` means the provider could not give an answer; `Ok(Fail)` means
    /// it explicitly rejected the token.
    async fn verify(
        &self,
        config: &CaptchaConfig,
        token: &str,
        client_ip: Option<&str>,
    ) -> Result<Verdict, CaptchaError>;
}

#[derive(Debug, Deserialize)]
struct SiteVerifyResponse {
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

/// Verifier that calls the provider's HTTP endpoint.
pub struct HttpCaptchaVerifier {
    client: reqwest::Client,
}

impl HttpCaptchaVerifier {
    pub fn new(timeout: Duration) -> Result<Self, CaptchaError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CaptchaError::RequestFailed {
                provider: "http".into(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CaptchaVerifier for HttpCaptchaVerifier {
    async fn verify(
        &self,
        config: &CaptchaConfig,
        token: &str,
        client_ip: Option<&str>,
    ) -> Result<Verdict, CaptchaError> {
        let provider = config.provider.name();
        let url = config
            .verify_url
            .as_deref()
            .unwrap_or_else(|| config.provider.verify_url());

        let mut params = vec![
            ("secret", config.secret.expose_secret()),
            ("response", token),
        ];
        if let Some(ip) = client_ip {
            params.push(("remoteip", ip));
        }

        let resp = self
            .client
            .post(url)
            .form(&params)
            .send()
            .await
            .map_err(|e| CaptchaError::RequestFailed {
                provider: provider.into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CaptchaError::BadStatus {
                provider: provider.into(),
                status: status.as_u16(),
            });
        }

        let body: SiteVerifyResponse =
            resp.json().await.map_err(|e| CaptchaError::InvalidResponse {
                provider: provider.into(),
                reason: e.to_string(),
            })?;

        if body.success {
            Ok(Verdict::Pass)
        } else {
            tracing::debug!(provider, codes = ?body.error_codes, "CAPTCHA token rejected");
            Ok(Verdict::Fail)
        }
    }
}
