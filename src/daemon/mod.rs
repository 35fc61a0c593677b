//! Mailbox watch daemon: auto-replies to unread form notifications.
//!
//! Every cycle lists unseen, unflagged messages. Only form notifications
//! get an answer: mail from the route's sender address whose body carries
//! the submitter's email and subject fields. Anything else is left unread
//! for a human. For a notification the daemon picks a category from the
//! subject, resolves the reply template and sends it to the submitter.
//!
//! The provider's `\Seen` flag is the authoritative "already replied"
//! ledger and `\Flagged` marks messages the daemon gave up on; a small
//! in-process cache guards against a flag update that lags or fails.

pub mod imap;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::Address;
use regex::Regex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_BRAND_TAG;
use crate::delivery::{DeliveryRouter, OutboundMessage, Route};
use crate::error::MailboxError;
use crate::templates::TemplateStore;

/// Replied message ids remembered in-process.
const RECENT_CAPACITY: usize = 512;

static NAME_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<b>\s*Name:\s*</b>\s*(.*?)\s*</p>").expect("static pattern"));
static EMAIL_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<b>\s*Email:\s*</b>\s*(.*?)\s*</p>").expect("static pattern"));
static SUBJECT_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<b>\s*Subject:\s*</b>\s*(.*?)\s*</p>").expect("static pattern"));
static REPLY_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(re|fwd?)\s*:\s*").expect("static pattern"));

/// An unread message in the watched mailbox.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub uid: u32,
    /// Falls back to `uid:<n>` when the message has no Message-ID.
    pub message_id: String,
    pub from: Option<String>,
    pub reply_to: Option<String>,
    pub reply_to_name: Option<String>,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    /// The raw message could not be parsed; only `uid` is meaningful.
    pub unparseable: bool,
}

impl InboundMessage {
    /// Placeholder for a message whose bytes did not parse.
    pub fn unparseable(uid: u32) -> Self {
        Self {
            uid,
            message_id: format!("uid:{uid}"),
            from: None,
            reply_to: None,
            reply_to_name: None,
            subject: String::new(),
            received_at: Utc::now(),
            html_body: None,
            text_body: None,
            unparseable: true,
        }
    }
}

/// The watched mailbox.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Unseen, unflagged messages. Listing must not mark anything seen.
    async fn list_unseen(&self) -> Result<Vec<InboundMessage>, MailboxError>;

    async fn mark_seen(&self, uid: u32) -> Result<(), MailboxError>;

    /// Flag a message that keeps failing so a human can look at it.
    async fn flag(&self, uid: u32) -> Result<(), MailboxError>;
}

/// Daemon settings.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Address of the watched mailbox; also the template-set key.
    pub mailbox: String,
    pub poll_interval: Duration,
    /// Consecutive failures before a message is flagged and skipped.
    pub max_attempts: u32,
    /// Stripped from inbound subjects in branded mode.
    pub brand_tag: String,
}

impl WatchConfig {
    pub fn new(mailbox: impl Into<String>) -> Self {
        Self {
            mailbox: mailbox.into(),
            poll_interval: Duration::from_secs(30),
            max_attempts: 3,
            brand_tag: DEFAULT_BRAND_TAG.to_string(),
        }
    }

    /// Apply `EMAIL_POLL_INTERVAL_SECS` and `EMAIL_MAX_ATTEMPTS`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(secs) = std::env::var("EMAIL_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|s| *s > 0)
        {
            self.poll_interval = Duration::from_secs(secs);
        }
        if let Some(max) = std::env::var("EMAIL_MAX_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|m| *m > 0)
        {
            self.max_attempts = max;
        }
        self
    }
}

/// Bounded insertion-ordered set.
#[derive(Debug)]
struct RecentSet {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl RecentSet {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    fn insert(&mut self, id: String) {
        if !self.members.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity
            && let Some(evicted) = self.order.pop_front()
        {
            self.members.remove(&evicted);
        }
    }
}

/// What one cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub replied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub flagged: usize,
}

enum Outcome {
    Replied,
    Skipped,
    Failed,
    Flagged,
}

/// Fields recovered from a form notification body, as plain text.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct NotificationFields {
    pub name: Option<String>,
    pub email: Option<String>,
    pub subject: Option<String>,
}

/// Pull the submitter's name, email and subject out of a notification body.
pub fn extract_fields(body: &str) -> NotificationFields {
    let capture = |re: &Regex| {
        re.captures(body)
            .and_then(|c| c.get(1))
            .map(|m| unescape_html(m.as_str().trim()))
            .filter(|s| !s.is_empty())
    };
    NotificationFields {
        name: capture(&NAME_FIELD),
        email: capture(&EMAIL_FIELD),
        subject: capture(&SUBJECT_FIELD),
    }
}

fn unescape_html(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Strip any number of leading `Re:`/`Fwd:` prefixes, and the brand tag
/// when `brand_tag` is given.
pub fn clean_subject(subject: &str, brand_tag: Option<&str>) -> String {
    let mut current = subject.trim().to_string();
    loop {
        let before = current.len();
        current = REPLY_PREFIX.replace(&current, "").into_owned();
        if let Some(tag) = brand_tag.map(str::trim).filter(|t| !t.is_empty())
            && current
                .get(..tag.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(tag))
        {
            current = current[tag.len()..].trim_start().to_string();
        }
        if current.len() == before {
            return current;
        }
    }
}

fn first_name(full: &str) -> Option<&str> {
    full.split_whitespace().next()
}

/// Polls one mailbox and replies to what it finds.
pub struct MailboxWatcher {
    config: WatchConfig,
    mailbox: Arc<dyn Mailbox>,
    router: Arc<DeliveryRouter>,
    route: Route,
    templates: Arc<TemplateStore>,
    recent: RecentSet,
    attempts: HashMap<String, u32>,
    given_up: HashSet<String>,
}

impl MailboxWatcher {
    pub fn new(
        config: WatchConfig,
        mailbox: Arc<dyn Mailbox>,
        router: Arc<DeliveryRouter>,
        route: Route,
        templates: Arc<TemplateStore>,
    ) -> Self {
        Self {
            config,
            mailbox,
            router,
            route,
            templates,
            recent: RecentSet::new(RECENT_CAPACITY),
            attempts: HashMap::new(),
            given_up: HashSet::new(),
        }
    }

    /// Run cycles until the handle is shut down.
    pub fn spawn(mut self) -> WatchHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let (loop_stop, loop_wake) = (Arc::clone(&stop), Arc::clone(&wake));

        let task = tokio::spawn(async move {
            info!(
                mailbox = %self.config.mailbox,
                interval = ?self.config.poll_interval,
                mode = %self.route.mode(),
                "Mailbox watcher started"
            );
            while !loop_stop.load(Ordering::Acquire) {
                self.poll_once().await;
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = loop_wake.notified() => {}
                }
            }
            info!(mailbox = %self.config.mailbox, "Mailbox watcher stopped");
        });

        WatchHandle { stop, wake, task }
    }

    /// One listing plus one pass over the unseen messages.
    pub async fn poll_once(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        let messages = match self.mailbox.list_unseen().await {
            Ok(messages) => messages,
            Err(e) => {
                error!(mailbox = %self.config.mailbox, error = %e, "Listing unseen messages failed; skipping cycle");
                return report;
            }
        };
        debug!(mailbox = %self.config.mailbox, count = messages.len(), "Polled mailbox");

        // Failure state only matters while the message is still listed.
        let listed: HashSet<&str> = messages.iter().map(|m| m.message_id.as_str()).collect();
        self.attempts.retain(|id, _| listed.contains(id.as_str()));
        self.given_up.retain(|id| listed.contains(id.as_str()));

        for message in messages {
            match self.handle(&message).await {
                Outcome::Replied => report.replied += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::Flagged => report.flagged += 1,
            }
        }
        report
    }

    async fn handle(&mut self, message: &InboundMessage) -> Outcome {
        let id = message.message_id.as_str();
        if self.recent.contains(id) || self.given_up.contains(id) {
            return Outcome::Skipped;
        }
        if message.unparseable {
            return self.record_failure(message, "message could not be parsed").await;
        }

        let from_sender = message
            .from
            .as_deref()
            .is_some_and(|from| from.eq_ignore_ascii_case(self.route.sender_address()));
        let fields = message
            .html_body
            .as_deref()
            .or(message.text_body.as_deref())
            .map(extract_fields)
            .unwrap_or_default();
        let (Some(email), Some(_)) = (fields.email.as_deref(), fields.subject.as_deref()) else {
            debug!(uid = message.uid, from = ?message.from, "Not a form notification; leaving unread");
            return Outcome::Skipped;
        };
        if !from_sender {
            debug!(uid = message.uid, from = ?message.from, "Notification fields from an unexpected sender; leaving unread");
            return Outcome::Skipped;
        }

        let target = message.reply_to.clone().unwrap_or_else(|| email.to_string());
        if target.eq_ignore_ascii_case(&self.config.mailbox) {
            debug!(uid = message.uid, "Skipping self-addressed notification");
            self.mark_seen(message).await;
            return Outcome::Skipped;
        }

        match self.reply(message, &fields, &target).await {
            Ok(category) => {
                info!(uid = message.uid, to = %target, category = %category, "Auto-reply sent");
                self.attempts.remove(id);
                self.recent.insert(id.to_string());
                self.mark_seen(message).await;
                Outcome::Replied
            }
            Err(reason) => self.record_failure(message, &reason).await,
        }
    }

    /// Resolve and dispatch the reply. Returns the category on success.
    async fn reply(
        &self,
        message: &InboundMessage,
        fields: &NotificationFields,
        target: &str,
    ) -> Result<String, String> {
        let brand_tag = self
            .route
            .mode()
            .is_branded()
            .then_some(self.config.brand_tag.as_str());
        let subject = clean_subject(&message.subject, brand_tag);

        let category = self
            .templates
            .categorize(&self.config.mailbox, &subject)
            .map_err(|e| e.to_string())?;

        let full_name = fields
            .name
            .clone()
            .or_else(|| message.reply_to_name.clone())
            .unwrap_or_default();
        let name = first_name(&full_name).unwrap_or("there");
        let original_subject = fields.subject.clone().unwrap_or(subject);

        let resolved = self
            .templates
            .resolve(
                &self.config.mailbox,
                &category,
                &[name, original_subject.as_str(), category.as_str()],
            )
            .map_err(|e| e.to_string())?;

        let to: Address = target
            .parse()
            .map_err(|e| format!("invalid reply address {target}: {e}"))?;
        let from: Address = self
            .route
            .sender_address()
            .parse()
            .map_err(|e| format!("invalid sender address: {e}"))?;

        let outbound = OutboundMessage {
            from: lettre::message::Mailbox::new(None, from),
            to: vec![lettre::message::Mailbox::new(
                Some(full_name).filter(|n| !n.is_empty()),
                to,
            )],
            reply_to: None,
            subject: resolved.subject,
            html_body: resolved.body,
        };
        self.router
            .dispatch(&self.route, outbound)
            .await
            .map_err(|e| e.to_string())?;
        Ok(category)
    }

    async fn record_failure(&mut self, message: &InboundMessage, reason: &str) -> Outcome {
        let id = message.message_id.clone();
        let attempts = self.attempts.entry(id.clone()).or_insert(0);
        *attempts += 1;
        let attempts = *attempts;

        if attempts < self.config.max_attempts {
            warn!(uid = message.uid, attempts, reason, "Auto-reply failed; will retry next cycle");
            return Outcome::Failed;
        }

        error!(uid = message.uid, attempts, reason, "Auto-reply keeps failing; flagging message");
        if let Err(e) = self.mailbox.flag(message.uid).await {
            warn!(uid = message.uid, error = %e, "Failed to flag message");
        }
        self.attempts.remove(&id);
        self.given_up.insert(id);
        Outcome::Flagged
    }

    async fn mark_seen(&self, message: &InboundMessage) {
        if let Err(e) = self.mailbox.mark_seen(message.uid).await {
            warn!(
                uid = message.uid,
                message_id = %message.message_id,
                error = %e,
                "Failed to mark message seen; duplicate reply possible after restart"
            );
        }
    }
}

/// Control over a spawned watcher.
pub struct WatchHandle {
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Ask the loop to exit after its current cycle.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Wait for the loop to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(error = %e, "Mailbox watcher task failed");
        }
    }
}
