//! Authenticated SMTP submission via lettre.

use std::time::Duration;

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;

use super::{OutboundMessage, SmtpRoute};
use crate::config::SmtpTls;
use crate::error::DeliveryError;

fn invalid(reason: impl std::fmt::Display) -> DeliveryError {
    DeliveryError::InvalidMessage(reason.to_string())
}

/// Build the RFC 5322 message for `message`.
pub fn build_message(message: &OutboundMessage) -> Result<Message, DeliveryError> {
    if message.to.is_empty() {
        return Err(invalid("message has no recipients"));
    }

    let mut builder = Message::builder()
        .from(message.from.clone())
        .subject(message.subject.clone())
        .header(ContentType::TEXT_HTML);
    for to in &message.to {
        builder = builder.to(to.clone());
    }
    if let Some(reply_to) = &message.reply_to {
        builder = builder.reply_to(reply_to.clone());
    }

    builder
        .body(message.html_body.clone())
        .map_err(|e| invalid(format!("Failed to build email: {e}")))
}

/// Send one message. The SMTP client is blocking, so the session runs on
/// the blocking pool.
pub async fn send(
    route: &SmtpRoute,
    message: &OutboundMessage,
    timeout: Duration,
) -> Result<(), DeliveryError> {
    let email = build_message(message)?;
    let route = route.clone();

    tokio::task::spawn_blocking(move || send_blocking(&route, &email, timeout))
        .await
        .map_err(|e| DeliveryError::Permanent {
            mode: "smtp".into(),
            reason: format!("SMTP task panicked: {e}"),
        })?
}

fn send_blocking(route: &SmtpRoute, email: &Message, timeout: Duration) -> Result<(), DeliveryError> {
    let creds = Credentials::new(
        route.username.clone(),
        route.password.expose_secret().to_string(),
    );

    let builder = match route.tls {
        SmtpTls::Implicit => SmtpTransport::relay(&route.host),
        SmtpTls::Starttls => SmtpTransport::starttls_relay(&route.host),
    }
    .map_err(|e| DeliveryError::Permanent {
        mode: "smtp".into(),
        reason: format!("SMTP relay error: {e}"),
    })?;

    let transport = builder
        .port(route.port)
        .credentials(creds)
        .timeout(Some(timeout))
        .build();

    transport.send(email).map_err(classify)?;
    tracing::debug!(host = %route.host, port = route.port, "SMTP session completed");
    Ok(())
}

/// Rejections from the server (5xx) and client-side errors are final;
/// everything else (connection, TLS, 4xx) may succeed on retry.
fn classify(err: lettre::transport::smtp::Error) -> DeliveryError {
    let reason = format!("SMTP send failed: {err}");
    if err.is_permanent() || err.is_client() {
        DeliveryError::Permanent {
            mode: "smtp".into(),
            reason,
        }
    } else {
        DeliveryError::Transient {
            mode: "smtp".into(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> OutboundMessage {
        OutboundMessage {
            from: "Website Contact Form <owner@example.com>".parse().unwrap(),
            to: vec![
                "contact@example.com".parse().unwrap(),
                "backup@example.com".parse().unwrap(),
            ],
            reply_to: Some("Ada Lovelace <ada@example.org>".parse().unwrap()),
            subject: "New Contact Form Submission: Hello".into(),
            html_body: "<p>Hi there</p>".into(),
        }
    }

    #[test]
    fn builds_html_message_with_reply_to() {
        let email = build_message(&message()).unwrap();
        let raw = String::from_utf8(email.formatted()).unwrap();
        assert!(raw.contains("Subject: New Contact Form Submission: Hello"));
        assert!(raw.contains("Reply-To: "));
        assert!(raw.contains("<ada@example.org>"));
        assert!(raw.contains("contact@example.com"));
        assert!(raw.contains("backup@example.com"));
        assert!(raw.contains("Content-Type: text/html"));
        assert!(raw.contains("<p>Hi there</p>"));
    }

    #[test]
    fn message_without_recipients_is_invalid() {
        let mut msg = message();
        msg.to.clear();
        let err = build_message(&msg).unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidMessage(_)));
    }
}
