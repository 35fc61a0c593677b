//! In-process counter store, for single-instance deployments and tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::CounterStore;
use crate::error::StoreError;

/// Sweep expired windows once the map grows past this many entries.
const SWEEP_THRESHOLD: usize = 1024;

struct Window {
    count: u64,
    expires_at: Instant,
}

/// Counter store backed by a mutex-guarded map.
pub struct MemoryCounterStore {
    windows: Mutex<HashMap<String, Window>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Current count for `key`, ignoring expired windows.
    pub async fn count(&self, key: &str) -> u64 {
        let windows = self.windows.lock().await;
        windows
            .get(key)
            .filter(|w| w.expires_at > Instant::now())
            .map(|w| w.count)
            .unwrap_or(0)
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr_below(
        &self,
        key: &str,
        limit: u32,
        ttl: Duration,
    ) -> Result<Option<u64>, StoreError> {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        if windows.len() > SWEEP_THRESHOLD {
            windows.retain(|_, w| w.expires_at > now);
        }

        let window = windows
            .entry(key.to_string())
            .and_modify(|w| {
                if w.expires_at <= now {
                    w.count = 0;
                    w.expires_at = now + ttl;
                }
            })
            .or_insert(Window {
                count: 0,
                expires_at: now + ttl,
            });

        if window.count >= u64::from(limit) {
            return Ok(None);
        }
        window.count += 1;
        Ok(Some(window.count))
    }
}
