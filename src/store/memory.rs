//! In-process hit counter store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::Result;
use crate::store::{ClientRateLimitInfo, Store, StoreOptions};

/// An in-process [`Store`] backed by a concurrent map.
///
/// Expiry is passive: each access checks the key's scheduled reset instant
/// and zeroes the counter if it has passed. A background sweep task evicts
/// expired entries so abandoned keys do not accumulate; the sweep only
/// reclaims memory and never changes observable counter values.
///
/// The map's per-entry locking gives each key its own critical section, so
/// concurrent increments on one key cannot lose updates.
pub struct MemoryStore {
    /// Counter state per key.
    clients: Arc<DashMap<String, ClientRateLimitInfo>>,
    /// Active window length in milliseconds, set by `init`.
    window_ms: AtomicU64,
    /// Handle to the background sweep task, once spawned.
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryStore {
    /// Create a new, empty memory store.
    pub fn new() -> Self {
        Self {
            clients: Arc::new(DashMap::new()),
            window_ms: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        }
    }

    /// Number of keys currently tracked. Primarily useful for tests.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether the store currently tracks no keys.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn spawn_sweeper(&self, window_ms: u64) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let clients = Arc::clone(&self.clients);
        let interval = Duration::from_millis(window_ms.max(1));
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let before = clients.len();
                clients.retain(|_, info| match info.reset_time {
                    Some(reset) => reset > now,
                    None => false,
                });
                let evicted = before.saturating_sub(clients.len());
                if evicted > 0 {
                    trace!(evicted, "Swept expired rate limit entries");
                }
            }
        }));
        debug!(window_ms, "Started memory store sweep task");
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn init(&self, options: StoreOptions) -> Result<()> {
        self.window_ms.store(options.window_ms, Ordering::SeqCst);
        self.spawn_sweeper(options.window_ms);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<ClientRateLimitInfo>> {
        let now = Utc::now();
        Ok(self.clients.get(key).and_then(|entry| {
            match entry.reset_time {
                // An expired window reads as absent; the next increment
                // will reset it for real.
                Some(reset) if reset <= now => None,
                _ => Some(entry.value().clone()),
            }
        }))
    }

    async fn increment(&self, key: &str) -> Result<ClientRateLimitInfo> {
        let now = Utc::now();
        let window = chrono::Duration::milliseconds(
            self.window_ms.load(Ordering::SeqCst) as i64
        );

        let mut entry = self.clients.entry(key.to_string()).or_default();
        let info = entry.value_mut();

        match info.reset_time {
            // First hit for this key: open a window.
            None => info.reset_time = Some(now + window),
            // Window elapsed: zero the counter and open a fresh window.
            Some(reset) if reset <= now => {
                info.total_hits = 0;
                info.reset_time = Some(now + window);
            }
            // Window still active: the scheduled reset is not touched,
            // even if the window length changed since it was opened.
            Some(_) => {}
        }

        info.total_hits += 1;
        Ok(info.clone())
    }

    async fn decrement(&self, key: &str) -> Result<()> {
        if let Some(mut entry) = self.clients.get_mut(key) {
            entry.total_hits = entry.total_hits.saturating_sub(1);
        }
        Ok(())
    }

    async fn reset_key(&self, key: &str) -> Result<()> {
        self.clients.remove(key);
        Ok(())
    }

    async fn reset_all(&self) -> Result<()> {
        self.clients.clear();
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.clients.clear();
        debug!("Memory store shut down");
        Ok(())
    }

    fn local_keys(&self) -> bool {
        true
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}
