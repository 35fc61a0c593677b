//! HTTP surface for the gateway.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRequest, Path, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Method, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use tokio::net::TcpListener;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use super::{RequestMeta, SubmissionGateway, SubmissionPayload};
use crate::error::GatewayError;

const FORM_PATH_PREFIX: &str = "/api/v1/form/";

/// Form key addressed by a request path, if it is a form route.
fn form_key_from_path(path: &str) -> Option<&str> {
    path.strip_prefix(FORM_PATH_PREFIX)
        .map(|rest| rest.trim_end_matches('/'))
        .filter(|key| !key.is_empty() && !key.contains('/'))
}

/// Build the router. CORS reflects an origin only for the form the
/// request path addresses.
pub fn router(gateway: Arc<SubmissionGateway>) -> Router {
    let cors_gateway = Arc::clone(&gateway);
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, parts: &Parts| {
                let Some(key) = form_key_from_path(parts.uri.path()) else {
                    return false;
                };
                origin
                    .to_str()
                    .is_ok_and(|o| cors_gateway.origin_allowed(key, o))
            },
        ))
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/v1/form/{form_key}", post(submit_form))
        .route("/health", get(health))
        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

/// Serve until `shutdown` resolves. Peer addresses are exposed to
/// handlers for rate-limit keying.
pub async fn serve<F>(listener: TcpListener, gateway: Arc<SubmissionGateway>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(gateway).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "service": "mailbridge" }))
}

fn first_forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn request_meta(request: &Request, trust_forwarded_for: bool) -> RequestMeta {
    let headers = request.headers();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let forwarded = trust_forwarded_for
        .then(|| first_forwarded_for(headers))
        .flatten();
    let client_ip = forwarded.or(peer);

    RequestMeta {
        origin: headers
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        client_key: client_ip.clone().unwrap_or_else(|| "unknown".into()),
        client_ip,
    }
}

async fn parse_payload(request: Request) -> Result<SubmissionPayload, String> {
    let is_form = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

    if is_form {
        Form::<SubmissionPayload>::from_request(request, &())
            .await
            .map(|Form(p)| p)
            .map_err(|e| e.body_text())
    } else {
        Json::<SubmissionPayload>::from_request(request, &())
            .await
            .map(|Json(p)| p)
            .map_err(|e| e.body_text())
    }
}

async fn submit_form(
    State(gateway): State<Arc<SubmissionGateway>>,
    Path(form_key): Path<String>,
    request: Request,
) -> Response {
    let meta = request_meta(
        &request,
        gateway.config().global.rate_limit.trust_forwarded_for,
    );

    let payload = match parse_payload(request).await {
        Ok(payload) => payload,
        Err(reason) => {
            // An unreadable body never outranks a 404/403.
            if let Err(e) = gateway.authorize(&form_key, meta.origin.as_deref()) {
                return e.into_response();
            }
            tracing::debug!(form_key = %form_key, reason = %reason, "Unparseable submission body");
            return GatewayError::Validation("Invalid request body".into()).into_response();
        }
    };

    match gateway.submit(&form_key, payload, meta).await {
        Ok(_) => Json(serde_json::json!({
            "status": "success",
            "message": "Form submitted successfully",
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}
