use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tracing::{info, warn};

use mailbridge::captcha::{DEFAULT_CAPTCHA_TIMEOUT, HttpCaptchaVerifier};
use mailbridge::config::{AppConfig, ServerConfig};
use mailbridge::daemon::imap::{ImapConfig, ImapMailbox};
use mailbridge::daemon::{MailboxWatcher, WatchConfig, WatchHandle};
use mailbridge::delivery::{DeliveryRouter, LiveTransport};
use mailbridge::error::ConfigError;
use mailbridge::gateway::{SubmissionGateway, routes};
use mailbridge::notify::{Notifier, PushoverNotifier};
use mailbridge::ratelimit::{CounterStore, MemoryCounterStore, RateLimiter, RedisCounterStore};
use mailbridge::templates::TemplateStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let server = ServerConfig::from_env();

    // ── Configuration ───────────────────────────────────────────────────
    let config_path = AppConfig::default_path();
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let templates = Arc::new(
        TemplateStore::load(&server.responses_path).with_context(|| {
            format!(
                "Failed to load response templates from {}",
                server.responses_path.display()
            )
        })?,
    );
    info!(
        forms = config.forms.len(),
        template_sets = templates.len(),
        "mailbridge v{} configured",
        env!("CARGO_PKG_VERSION")
    );

    // ── Rate limiting ───────────────────────────────────────────────────
    let store: Arc<dyn CounterStore> = match &server.redis_url {
        Some(url) => Arc::new(RedisCounterStore::connect(url).await?),
        None => {
            warn!("REDIS_URL not set; rate-limit counters are per-process");
            Arc::new(MemoryCounterStore::new())
        }
    };
    let limiter = RateLimiter::new(store, &config.global.rate_limit);

    // ── Delivery ────────────────────────────────────────────────────────
    let global = config.global.clone();
    let transport = Arc::new(LiveTransport::new(global.delivery_timeout())?);
    let router = Arc::new(DeliveryRouter::new(
        transport,
        global.branding.clone(),
        global.delivery_timeout(),
    ));

    let notifier: Option<Arc<dyn Notifier>> = match global.pushover.clone() {
        Some(pushover) => Some(Arc::new(PushoverNotifier::new(pushover)?)),
        None => None,
    };

    let gateway = Arc::new(SubmissionGateway::new(
        config,
        Arc::clone(&templates),
        limiter,
        Arc::new(HttpCaptchaVerifier::new(DEFAULT_CAPTCHA_TIMEOUT)?),
        Arc::clone(&router),
        notifier,
    )?);

    // ── Mailbox watcher ─────────────────────────────────────────────────
    let watcher = match &server.instance_email {
        Some(mailbox) => Some(start_watcher(
            mailbox,
            &gateway,
            Arc::clone(&router),
            Arc::clone(&templates),
            &global.branding.subject_tag,
        )?),
        None => {
            info!("INSTANCE_EMAIL not set; auto-reply daemon disabled");
            None
        }
    };

    // ── HTTP server ─────────────────────────────────────────────────────
    let addr = SocketAddr::from(([0, 0, 0, 0], server.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Listening on http://{addr}");

    routes::serve(listener, gateway, shutdown_signal()).await?;

    if let Some(handle) = watcher {
        handle.shutdown();
        handle.join().await;
    }
    info!("Shut down cleanly");
    Ok(())
}

/// The watched mailbox must be the first recipient of some form; that
/// form's route carries the replies.
fn start_watcher(
    mailbox: &str,
    gateway: &SubmissionGateway,
    router: Arc<DeliveryRouter>,
    templates: Arc<TemplateStore>,
    brand_tag: &str,
) -> anyhow::Result<WatchHandle> {
    let route = gateway
        .config()
        .form_for_mailbox(mailbox)
        .and_then(|form| gateway.route(&form.id))
        .cloned()
        .ok_or_else(|| ConfigError::MissingRequired {
            key: "INSTANCE_EMAIL".into(),
            hint: format!("{mailbox} is not the first recipient of any form."),
        })?;

    let imap = ImapConfig::from_env(mailbox)?;
    info!(mailbox, host = %imap.host, mode = %route.mode(), "Starting auto-reply daemon");

    let mut watch = WatchConfig::new(mailbox).with_env_overrides();
    watch.brand_tag = brand_tag.to_string();

    Ok(MailboxWatcher::new(
        watch,
        Arc::new(ImapMailbox::new(imap)),
        router,
        route,
        templates,
    )
    .spawn())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
