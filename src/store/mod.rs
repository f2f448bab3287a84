//! Hit counter stores.
//!
//! A [`Store`] owns all counter state for the engine: one
//! [`ClientRateLimitInfo`] per key, created lazily on first increment and
//! destroyed either by window expiry or an explicit reset. Callers only ever
//! observe snapshots.

mod actor;
mod memory;

pub use actor::ActorStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Counter state returned by a store when a client's hit count is read or
/// incremented.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientRateLimitInfo {
    /// Cumulative hits for this client since the last window reset.
    pub total_hits: u64,
    /// The instant at which the current window expires and the counter
    /// resets to zero. Absent until the first increment opens a window.
    pub reset_time: Option<DateTime<Utc>>,
}

/// Options pushed into a store before any key is touched for a given
/// settings resolution. The store does not own configuration; it is told
/// the active window length here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Length of the counting window, in milliseconds.
    pub window_ms: u64,
}

/// The contract all hit counter backends implement.
///
/// On `increment`, every implementation follows the same window algorithm:
/// load the key's state (or a zeroed default), schedule an expiry at
/// `now + window_ms` if none is scheduled, perform an expiry reset if the
/// scheduled instant has passed, add the hit, and return the resulting
/// snapshot. Expiry may be driven proactively (a per-key alarm) or lazily
/// (check on access); both must produce the same observable sequence.
///
/// Increments must be atomic per key: concurrent increments for the same
/// key must not lose updates.
#[async_trait]
pub trait Store: Send + Sync {
    /// Record the active window length. Idempotent across repeated calls
    /// with the same value; a different `window_ms` after state exists only
    /// affects windows opened afterwards and must not corrupt existing
    /// counters.
    async fn init(&self, options: StoreOptions) -> Result<()> {
        let _ = options;
        Ok(())
    }

    /// Fetch a client's hit count and reset time without mutating it.
    async fn get(&self, key: &str) -> Result<Option<ClientRateLimitInfo>>;

    /// Increment a client's hit counter and return the updated snapshot.
    async fn increment(&self, key: &str) -> Result<ClientRateLimitInfo>;

    /// Subtract one hit, floored so the count never goes negative. Used to
    /// undo a speculative increment when a downstream step fails.
    async fn decrement(&self, key: &str) -> Result<()>;

    /// Force the named key's counter to zero state immediately,
    /// independent of timer state.
    async fn reset_key(&self, key: &str) -> Result<()>;

    /// Reset every key the store currently tracks.
    async fn reset_all(&self) -> Result<()> {
        Ok(())
    }

    /// Release timers and resources. After shutdown no further operation
    /// is guaranteed to succeed.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// True if keys incremented through one engine instance are invisible
    /// to other instances. Used for double-count misconfiguration
    /// diagnostics only; the engine does not enforce anything based on it.
    fn local_keys(&self) -> bool {
        true
    }

    /// The text this store prepends to keys, if any. Lets the double-count
    /// diagnostics tell apart a key counted twice under different prefixes.
    fn prefix(&self) -> Option<&str> {
        None
    }
}
