//! Per-key actor hit counter store.
//!
//! Models a durable-object-per-key backend: every key maps to an isolated
//! actor that exclusively owns its counter and its expiry alarm. All access
//! to a key flows through that actor's mailbox, which serializes it and
//! makes increments linearizable without any shared lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::error::{RateGateError, Result};
use crate::store::{ClientRateLimitInfo, Store, StoreOptions};

/// Default text prepended to keys before routing them to an actor.
const DEFAULT_PREFIX: &str = "rl:";

/// Mailbox depth per actor. Commands are tiny and replied to immediately,
/// so a small buffer suffices.
const MAILBOX_SIZE: usize = 32;

/// Commands a key's actor understands.
enum Command {
    /// Read the current counter state.
    Value(oneshot::Sender<Option<ClientRateLimitInfo>>),
    /// Apply a hit delta and return the updated state. Negative deltas
    /// floor at zero.
    Update {
        hits: i64,
        window_ms: u64,
        reply: oneshot::Sender<ClientRateLimitInfo>,
    },
    /// Zero the counter. The scheduled alarm, if any, stays in place.
    Reset(oneshot::Sender<()>),
}

/// Handle to a single key's actor.
#[derive(Clone)]
struct ActorHandle {
    tx: mpsc::Sender<Command>,
}

/// A [`Store`] that gives each key an isolated, independently serialized
/// actor, the way an external durable-object backend would.
///
/// Expiry is proactive: each actor arms an alarm when a window opens and
/// zeroes its counter the moment the alarm fires, whether or not anyone is
/// looking. The update path still checks the scheduled instant against the
/// wall clock, so a command racing the alarm observes the same state either
/// way.
pub struct ActorStore {
    /// Live actors, keyed by prefixed key.
    actors: Arc<DashMap<String, ActorHandle>>,
    /// Text prepended to keys.
    prefix: String,
    /// Active window length in milliseconds, set by `init`.
    window_ms: AtomicU64,
}

impl ActorStore {
    /// Create a new actor store with the default key prefix.
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }

    /// Create a new actor store with a custom key prefix.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            actors: Arc::new(DashMap::new()),
            prefix: prefix.into(),
            window_ms: AtomicU64::new(0),
        }
    }

    /// Number of live actors. Primarily useful for tests.
    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Look up the actor for a key, spawning one if the key has never been
    /// seen. Spawning is idempotent under races: the entry lock makes the
    /// first caller win and later callers reuse its handle.
    fn actor_for(&self, key: &str) -> ActorHandle {
        let prefixed = self.prefixed(key);
        self.actors
            .entry(prefixed.clone())
            .or_insert_with(|| {
                trace!(key = %prefixed, "Spawning rate limit actor");
                let (tx, rx) = mpsc::channel(MAILBOX_SIZE);
                tokio::spawn(run_actor(prefixed, rx));
                ActorHandle { tx }
            })
            .clone()
    }

    async fn send(&self, key: &str, command: Command) -> Result<()> {
        self.actor_for(key)
            .tx
            .send(command)
            .await
            .map_err(|_| RateGateError::Store(format!("actor unavailable for key {}", key)))
    }
}

impl Default for ActorStore {
    fn default() -> Self {
        Self::new()
    }
}

/// The actor body: single-threaded ownership of one key's counter state
/// and alarm.
async fn run_actor(key: String, mut rx: mpsc::Receiver<Command>) {
    let mut value: Option<ClientRateLimitInfo> = None;
    // Wall-clock instant the armed alarm fires at, if armed.
    let mut alarm: Option<DateTime<Utc>> = None;

    let sleep = tokio::time::sleep_until(far_future());
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            () = &mut sleep, if alarm.is_some() => {
                trace!(key = %key, "Rate limit alarm fired");
                value = Some(ClientRateLimitInfo::default());
                alarm = None;
                sleep.as_mut().reset(far_future());
            }
            command = rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::Value(reply) => {
                        let _ = reply.send(value.clone());
                    }
                    Command::Update { hits, window_ms, reply } => {
                        let mut payload = value.clone().unwrap_or_default();
                        let now = Utc::now();
                        let window = chrono::Duration::milliseconds(window_ms as i64);

                        let deadline = match alarm {
                            // No alarm armed: open a window. A window length
                            // change while an alarm is armed does not
                            // reschedule it.
                            None => {
                                let deadline = now + window;
                                arm(&mut sleep, deadline, now);
                                alarm = Some(deadline);
                                deadline
                            }
                            // Alarm already due but the command got here
                            // first: reset and rearm, same as if it fired.
                            Some(deadline) if deadline <= now => {
                                payload = ClientRateLimitInfo::default();
                                let deadline = now + window;
                                arm(&mut sleep, deadline, now);
                                alarm = Some(deadline);
                                deadline
                            }
                            Some(deadline) => deadline,
                        };

                        payload.total_hits =
                            payload.total_hits.saturating_add_signed(hits);
                        payload.reset_time = Some(deadline);

                        value = Some(payload.clone());
                        let _ = reply.send(payload);
                    }
                    Command::Reset(reply) => {
                        value = Some(ClientRateLimitInfo::default());
                        let _ = reply.send(());
                    }
                }
            }
        }
    }

    trace!(key = %key, "Rate limit actor stopped");
}

fn arm(
    sleep: &mut std::pin::Pin<&mut tokio::time::Sleep>,
    deadline: DateTime<Utc>,
    now: DateTime<Utc>,
) {
    let delay = (deadline - now)
        .to_std()
        .unwrap_or(Duration::ZERO);
    sleep.as_mut().reset(tokio::time::Instant::now() + delay);
}

fn far_future() -> tokio::time::Instant {
    // Effectively "never"; rearmed whenever an alarm is scheduled.
    tokio::time::Instant::now() + Duration::from_secs(86400 * 365)
}

#[async_trait]
impl Store for ActorStore {
    async fn init(&self, options: StoreOptions) -> Result<()> {
        self.window_ms.store(options.window_ms, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<ClientRateLimitInfo>> {
        let (reply, rx) = oneshot::channel();
        self.send(key, Command::Value(reply)).await?;
        rx.await
            .map_err(|_| RateGateError::Store(format!("actor dropped reply for key {}", key)))
    }

    async fn increment(&self, key: &str) -> Result<ClientRateLimitInfo> {
        self.update(key, 1).await
    }

    async fn decrement(&self, key: &str) -> Result<()> {
        self.update(key, -1).await?;
        Ok(())
    }

    async fn reset_key(&self, key: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(key, Command::Reset(reply)).await?;
        rx.await
            .map_err(|_| RateGateError::Store(format!("actor dropped reply for key {}", key)))
    }

    async fn reset_all(&self) -> Result<()> {
        let handles: Vec<(String, ActorHandle)> = self
            .actors
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (key, handle) in handles {
            let (reply, rx) = oneshot::channel();
            handle
                .tx
                .send(Command::Reset(reply))
                .await
                .map_err(|_| RateGateError::Store(format!("actor unavailable for key {}", key)))?;
            rx.await
                .map_err(|_| RateGateError::Store(format!("actor dropped reply for key {}", key)))?;
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        // Dropping the senders closes each actor's mailbox; the tasks
        // drain and exit on their own.
        self.actors.clear();
        debug!("Actor store shut down");
        Ok(())
    }

    fn local_keys(&self) -> bool {
        // Each key's actor stands in for externally shared, per-key
        // isolated storage.
        false
    }

    fn prefix(&self) -> Option<&str> {
        Some(&self.prefix)
    }
}

impl ActorStore {
    async fn update(&self, key: &str, hits: i64) -> Result<ClientRateLimitInfo> {
        let window_ms = self.window_ms.load(Ordering::SeqCst);
        let (reply, rx) = oneshot::channel();
        self.send(
            key,
            Command::Update {
                hits,
                window_ms,
                reply,
            },
        )
        .await?;
        rx.await
            .map_err(|_| RateGateError::Store(format!("actor dropped reply for key {}", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW_MS: u64 = 60_000;

    async fn test_store(window_ms: u64) -> ActorStore {
        let store = ActorStore::new();
        store.init(StoreOptions { window_ms }).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_first_increment_opens_window() {
        let store = test_store(WINDOW_MS).await;
        let before = Utc::now();

        let info = store.increment("client").await.unwrap();

        assert_eq!(info.total_hits, 1);
        let reset = info.reset_time.unwrap();
        let expected = before + chrono::Duration::milliseconds(WINDOW_MS as i64);
        let drift = (reset - expected).num_milliseconds().abs();
        assert!(drift < 1000, "reset time {}ms off from now + window", drift);
    }

    #[tokio::test]
    async fn test_reset_time_stable_within_window() {
        let store = test_store(WINDOW_MS).await;

        let first = store.increment("client").await.unwrap();
        for expected_hits in 2..=5 {
            let info = store.increment("client").await.unwrap();
            assert_eq!(info.total_hits, expected_hits);
            assert_eq!(info.reset_time, first.reset_time);
        }
    }

    #[tokio::test]
    async fn test_alarm_resets_counter() {
        let store = test_store(100).await;

        for _ in 0..3 {
            store.increment("client").await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(150)).await;

        // The alarm fired while nobody was looking.
        let info = store.get("client").await.unwrap().unwrap();
        assert_eq!(info.total_hits, 0);

        let info = store.increment("client").await.unwrap();
        assert_eq!(info.total_hits, 1);
    }

    #[tokio::test]
    async fn test_unseen_key_reads_as_absent() {
        let store = test_store(WINDOW_MS).await;
        assert_eq!(store.get("client").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_window_reads_as_zeroed_snapshot() {
        let store = test_store(100).await;
        store.increment("client").await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        // The fired alarm leaves a zeroed snapshot behind, where the
        // in-process store reports the key as absent. Both read as "no
        // hits, no open window"; the next increment behaves identically.
        let info = store.get("client").await.unwrap().unwrap();
        assert_eq!(info.total_hits, 0);
        assert_eq!(info.reset_time, None);

        let info = store.increment("client").await.unwrap();
        assert_eq!(info.total_hits, 1);
        assert!(info.reset_time.is_some());
    }

    #[tokio::test]
    async fn test_decrement_floors_at_zero() {
        let store = test_store(WINDOW_MS).await;
        store.increment("client").await.unwrap();

        store.decrement("client").await.unwrap();
        store.decrement("client").await.unwrap();

        let info = store.get("client").await.unwrap().unwrap();
        assert_eq!(info.total_hits, 0);
    }

    #[tokio::test]
    async fn test_reset_key_zeroes_immediately() {
        let store = test_store(WINDOW_MS).await;
        for _ in 0..5 {
            store.increment("client").await.unwrap();
        }

        store.reset_key("client").await.unwrap();

        let info = store.get("client").await.unwrap().unwrap();
        assert_eq!(info.total_hits, 0);
    }

    #[tokio::test]
    async fn test_reset_all() {
        let store = test_store(WINDOW_MS).await;
        store.increment("a").await.unwrap();
        store.increment("b").await.unwrap();

        store.reset_all().await.unwrap();

        assert_eq!(store.get("a").await.unwrap().unwrap().total_hits, 0);
        assert_eq!(store.get("b").await.unwrap().unwrap().total_hits, 0);
    }

    #[tokio::test]
    async fn test_concurrent_increments_do_not_lose_updates() {
        let store = Arc::new(test_store(WINDOW_MS).await);

        let mut handles = Vec::new();
        for _ in 0..100 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.increment("client").await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let info = store.get("client").await.unwrap().unwrap();
        assert_eq!(info.total_hits, 100);
    }

    #[tokio::test]
    async fn test_window_change_keeps_scheduled_reset() {
        let store = test_store(60_000).await;

        let first = store.increment("client").await.unwrap();

        store.init(StoreOptions { window_ms: 1_000 }).await.unwrap();
        let second = store.increment("client").await.unwrap();

        assert_eq!(second.total_hits, 2);
        assert_eq!(second.reset_time, first.reset_time);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let store = test_store(WINDOW_MS).await;

        store.increment("a").await.unwrap();
        store.increment("a").await.unwrap();
        let b = store.increment("b").await.unwrap();

        assert_eq!(b.total_hits, 1);
        assert_eq!(store.actor_count(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_actors() {
        let store = test_store(WINDOW_MS).await;
        store.increment("client").await.unwrap();
        assert_eq!(store.actor_count(), 1);

        store.shutdown().await.unwrap();
        assert_eq!(store.actor_count(), 0);
    }

    #[test]
    fn test_metadata_flags() {
        let store = ActorStore::new();
        assert!(!store.local_keys());
        assert_eq!(store.prefix(), Some("rl:"));

        let store = ActorStore::with_prefix("custom:");
        assert_eq!(store.prefix(), Some("custom:"));
    }
}
