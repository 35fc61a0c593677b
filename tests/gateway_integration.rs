//! Integration tests for the HTTP submission gateway.
//!
//! Each test spins up the real router on a random port with an in-memory
//! mail transport, and drives it over HTTP with reqwest.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{Form, Json, Router, routing::post};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::net::TcpListener;

use mailbridge::captcha::HttpCaptchaVerifier;
use mailbridge::config::AppConfig;
use mailbridge::delivery::{DeliveryRouter, MailTransport, OutboundMessage, Route};
use mailbridge::error::DeliveryError;
use mailbridge::gateway::{SubmissionGateway, routes};
use mailbridge::ratelimit::{MemoryCounterStore, RateLimiter};
use mailbridge::templates::TemplateStore;

const ORIGIN: &str = "https://example.com";

const RESPONSES: &str = r#"{
    "contact@example.com": {
        "subjects": { "general": "<p>Hi {0}</p>" },
        "form_submission_template": {
            "subject": "New Contact Form Submission: {2}",
            "body": "<p><b>Name:</b> {0}</p><p><b>Email:</b> {1}</p><p><b>Subject:</b> {2}</p><p>{3}</p>"
        }
    }
}"#;

/// Records every message instead of sending it.
#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<(Route, OutboundMessage)>>,
    fail: bool,
}

impl RecordingTransport {
    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn deliver(&self, route: &Route, message: &OutboundMessage) -> Result<(), DeliveryError> {
        if self.fail {
            return Err(DeliveryError::Permanent {
                mode: route.mode().to_string(),
                reason: "554 transaction failed".into(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((route.clone(), message.clone()));
        Ok(())
    }
}

/// Fake siteverify endpoint accepting exactly one token.
async fn start_captcha_provider() -> String {
    async fn siteverify(Form(params): Form<HashMap<String, String>>) -> Json<Value> {
        let ok = params.get("response").map(String::as_str) == Some("human");
        Json(serde_json::json!({ "success": ok }))
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, Router::new().route("/siteverify", post(siteverify)))
            .await
            .unwrap();
    });
    format!("http://127.0.0.1:{port}/siteverify")
}

fn config_toml(captcha_url: &str) -> String {
    format!(
        r#"
[global.smtp]
host = "smtp.mail.me.com"
username = "contact@example.com"
password = "app-password"

[global.postmark]
server_token = "pm-token"
from_address = "contact@example.com"

[forms.ada]
key = "ada-key"
allowed_domains = ["{ORIGIN}"]
recipients = ["contact@example.com"]
rate_limit = 1

[forms.branded]
key = "branded-key"
mode = "postmark"
allowed_domains = ["{ORIGIN}"]
recipients = ["contact@example.com"]

[forms.guarded]
key = "guarded-key"
allowed_domains = ["{ORIGIN}"]
recipients = ["contact@example.com"]

[forms.guarded.captcha]
provider = "turnstile"
secret = "captcha-secret"
verify_url = "{captcha_url}"
"#
    )
}

struct TestServer {
    base: String,
    transport: Arc<RecordingTransport>,
    client: reqwest::Client,
}

impl TestServer {
    async fn start(transport: RecordingTransport) -> Self {
        let captcha_url = start_captcha_provider().await;
        let config = AppConfig::from_toml(&config_toml(&captcha_url)).unwrap();
        let transport = Arc::new(transport);
        let router = DeliveryRouter::new(
            transport.clone(),
            config.global.branding.clone(),
            Duration::from_secs(5),
        );
        let limiter = RateLimiter::new(
            Arc::new(MemoryCounterStore::new()),
            &config.global.rate_limit,
        );
        let gateway = SubmissionGateway::new(
            config,
            Arc::new(TemplateStore::from_json(RESPONSES).unwrap()),
            limiter,
            Arc::new(HttpCaptchaVerifier::new(Duration::from_secs(2)).unwrap()),
            Arc::new(router),
            None,
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            routes::serve(listener, Arc::new(gateway), std::future::pending())
                .await
                .unwrap();
        });

        Self {
            base: format!("http://127.0.0.1:{port}"),
            transport,
            client: reqwest::Client::new(),
        }
    }

    async fn post_json(&self, key: &str, origin: &str, body: Value) -> (StatusCode, Value) {
        let resp = self
            .client
            .post(format!("{}/api/v1/form/{key}", self.base))
            .header("Origin", origin)
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }
}

fn ada() -> Value {
    serde_json::json!({
        "name": "Ada",
        "email": "ada@example.org",
        "subject": "Hello",
        "content": "Hi"
    })
}

#[tokio::test]
async fn ada_is_admitted_once_then_rate_limited() {
    let server = TestServer::start(RecordingTransport::default()).await;

    let (status, body) = server.post_json("ada-key", ORIGIN, ada()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["message"], "Form submitted successfully");

    let (status, body) = server.post_json("ada-key", ORIGIN, ada()).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["status"], "error");

    assert_eq!(server.transport.count(), 1);
    let sent = server.transport.sent.lock().unwrap();
    let (route, message) = &sent[0];
    assert!(matches!(route, Route::Smtp(_)));
    assert_eq!(message.subject, "New Contact Form Submission: Hello");
    assert_eq!(message.to[0].email.to_string(), "contact@example.com");
    assert_eq!(
        message.reply_to.as_ref().unwrap().email.to_string(),
        "ada@example.org"
    );
}

#[tokio::test]
async fn unknown_form_is_404() {
    let server = TestServer::start(RecordingTransport::default()).await;
    let (status, body) = server.post_json("nope", ORIGIN, ada()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "Form not found");
}

#[tokio::test]
async fn foreign_origin_is_403_and_consumes_no_quota() {
    let server = TestServer::start(RecordingTransport::default()).await;

    let (status, body) = server
        .post_json("ada-key", "https://evil-example.com", ada())
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "Domain not allowed");
    assert_eq!(server.transport.count(), 0);

    // Quota is 1: a counted rejection would make this a 429.
    let (status, _) = server.post_json("ada-key", ORIGIN, ada()).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn invalid_fields_are_400() {
    let server = TestServer::start(RecordingTransport::default()).await;
    let mut body = ada();
    body["email"] = Value::from("not-an-email");
    let (status, resp) = server.post_json("ada-key", ORIGIN, body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(resp["status"], "error");
    assert_eq!(server.transport.count(), 0);
}

#[tokio::test]
async fn unreadable_body_on_unknown_form_is_still_404() {
    let server = TestServer::start(RecordingTransport::default()).await;
    let resp = server
        .client
        .post(format!("{}/api/v1/form/nope", server.base))
        .header("Origin", ORIGIN)
        .header("Content-Type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn captcha_is_checked_before_dispatch() {
    let server = TestServer::start(RecordingTransport::default()).await;

    let mut body = ada();
    body["captcha_token"] = Value::from("robot");
    let (status, resp) = server.post_json("guarded-key", ORIGIN, body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(resp["message"], "CAPTCHA verification failed");
    assert_eq!(server.transport.count(), 0);

    let mut body = ada();
    body["h-captcha-response"] = Value::from("human");
    let (status, _) = server.post_json("guarded-key", ORIGIN, body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(server.transport.count(), 1);
}

#[tokio::test]
async fn delivery_failure_is_502() {
    let server = TestServer::start(RecordingTransport {
        fail: true,
        ..Default::default()
    })
    .await;
    let (status, body) = server.post_json("ada-key", ORIGIN, ada()).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["message"], "Failed to send email");
}

#[tokio::test]
async fn postmark_form_is_branded() {
    let server = TestServer::start(RecordingTransport::default()).await;
    let (status, _) = server.post_json("branded-key", ORIGIN, ada()).await;
    assert_eq!(status, StatusCode::OK);

    let sent = server.transport.sent.lock().unwrap();
    let (route, message) = &sent[0];
    assert!(matches!(route, Route::Postmark(_)));
    assert_eq!(
        message.subject,
        "Postmark Inquiry: New Contact Form Submission: Hello"
    );
}

#[tokio::test]
async fn url_encoded_body_is_accepted() {
    let server = TestServer::start(RecordingTransport::default()).await;
    let resp = server
        .client
        .post(format!("{}/api/v1/form/ada-key", server.base))
        .header("Origin", ORIGIN)
        .form(&[
            ("name", "Ada"),
            ("email", "ada@example.org"),
            ("subject", "Hello"),
            ("content", "Line one\nLine two"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let sent = server.transport.sent.lock().unwrap();
    assert!(sent[0].1.html_body.contains("Line one<br>Line two"));
}

#[tokio::test]
async fn cors_reflects_only_allowed_origins() {
    let server = TestServer::start(RecordingTransport::default()).await;
    let preflight = |origin: &'static str| {
        server
            .client
            .request(
                reqwest::Method::OPTIONS,
                format!("{}/api/v1/form/ada-key", server.base),
            )
            .header("Origin", origin)
            .header("Access-Control-Request-Method", "POST")
            .send()
    };

    let allowed = preflight(ORIGIN).await.unwrap();
    assert_eq!(
        allowed
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some(ORIGIN)
    );

    let denied = preflight("https://evil-example.com").await.unwrap();
    assert!(denied.headers().get("access-control-allow-origin").is_none());
}

#[tokio::test]
async fn health_reports_service() {
    let server = TestServer::start(RecordingTransport::default()).await;
    let body: Value = server
        .client
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "mailbridge");
}
