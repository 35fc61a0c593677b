//! Fixed-window rate limiting keyed by (form, client).
//!
//! The counter store owns the only atomic step: "increment unless the
//! window is already full". The limiter adds the store timeout and the
//! fail-open / fail-closed policy on top.

mod memory;
mod redis_store;

pub use self::memory::MemoryCounterStore;
pub use self::redis_store::RedisCounterStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::{FailPolicy, RateLimitConfig};
use crate::error::StoreError;

/// Length of one counting window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Shared expiring counter store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key` if its count is below `limit`.
    ///
    /// Creates the key with count 1 and the given TTL when absent. Returns
    /// the new count, or `None` when the window is full (nothing recorded).
    async fn incr_below(
        &self,
        key: &str,
        limit: u32,
        ttl: Duration,
    ) -> Result<Option<u64>, StoreError>;
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Per-form, per-client fixed-window limiter.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    policy: FailPolicy,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: &RateLimitConfig) -> Self {
        Self {
            store,
            policy: config.fail_policy,
            timeout: config.store_timeout(),
        }
    }

    /// Storage key for a (form, client) window.
    pub fn window_key(form_id: &str, client_key: &str) -> String {
        format!("ratelimit:{form_id}:{client_key}")
    }

    /// Admit or deny one submission.
    pub async fn admit(&self, form_id: &str, client_key: &str, quota: u32) -> Admission {
        let key = Self::window_key(form_id, client_key);

        let result = match tokio::time::timeout(
            self.timeout,
            self.store.incr_below(&key, quota, WINDOW),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        };

        match result {
            Ok(Some(count)) => {
                debug!(form = form_id, client = client_key, count, quota, "Rate window admitted");
                Admission::Allowed
            }
            Ok(None) => {
                debug!(form = form_id, client = client_key, quota, "Rate window full");
                Admission::Denied
            }
            Err(e) => match self.policy {
                FailPolicy::Open => {
                    warn!(form = form_id, error = %e, "Counter store failed; admitting (fail-open)");
                    Admission::Allowed
                }
                FailPolicy::Closed => {
                    warn!(form = form_id, error = %e, "Counter store failed; denying (fail-closed)");
                    Admission::Denied
                }
            },
        }
    }
}
