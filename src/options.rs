//! Engine configuration surface.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{RenderedMessage, Result, DEFAULT_MESSAGE};
use crate::request::RequestContext;
use crate::rules::{LimitValue, RouteMap};
use crate::store::{MemoryStore, Store};

/// Default status code reported on rejection.
pub const DEFAULT_STATUS_CODE: u16 = 429;

/// Derives the rate limit key for a request. Receives the request context
/// and the resolved route path.
pub type KeyGeneratorFn =
    dyn Fn(&RequestContext, &str) -> BoxFuture<'static, String> + Send + Sync;

/// Decides whether a request bypasses limiting entirely.
pub type SkipFn = dyn Fn(&RequestContext) -> BoxFuture<'static, bool> + Send + Sync;

/// The rejection body configuration.
///
/// Dynamic messages are resolved at rejection time; if rendering fails the
/// engine falls back to the generic default rather than failing the
/// rejection path.
#[derive(Clone)]
pub enum Message {
    /// A static text body.
    Static(String),
    /// A static structured body, emitted as JSON.
    Json(serde_json::Value),
    /// A body derived from the request on every rejection.
    Dynamic(Arc<dyn Fn(&RequestContext) -> BoxFuture<'static, Result<RenderedMessage>> + Send + Sync>),
}

impl Message {
    /// Build a dynamic message from an async function of the request.
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&RequestContext) -> BoxFuture<'static, Result<RenderedMessage>>
            + Send
            + Sync
            + 'static,
    {
        Message::Dynamic(Arc::new(f))
    }
}

impl Default for Message {
    fn default() -> Self {
        Message::Static(DEFAULT_MESSAGE.to_string())
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Static(text) => f.debug_tuple("Static").field(text).finish(),
            Message::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Message::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Options for building a [`RateLimiter`](crate::limiter::RateLimiter).
///
/// Exactly one rule shape may be supplied: either `window_ms` + `limit`
/// (applied to every path) or `routes` (a per-path map). Supplying both is
/// a configuration error raised at construction.
#[derive(Clone)]
pub struct RateLimiterOptions {
    /// Single-mode window length, in milliseconds.
    pub window_ms: Option<u64>,
    /// Single-mode hit threshold.
    pub limit: Option<LimitValue>,
    /// Multi-mode per-path rules.
    pub routes: Option<RouteMap>,
    /// Rejection body. Defaults to a generic plain-text message.
    pub message: Message,
    /// Status code reported on rejection. Defaults to 429.
    pub status_code: u16,
    /// Custom key derivation. When absent the engine derives keys from
    /// client-address headers plus the route path.
    pub key_generator: Option<Arc<KeyGeneratorFn>>,
    /// Skip predicate. Defaults to never skipping.
    pub skip: Option<Arc<SkipFn>>,
    /// The backing hit counter store.
    pub store: Arc<dyn Store>,
}

impl Default for RateLimiterOptions {
    fn default() -> Self {
        Self {
            window_ms: None,
            limit: None,
            routes: None,
            message: Message::default(),
            status_code: DEFAULT_STATUS_CODE,
            key_generator: None,
            skip: None,
            store: Arc::new(MemoryStore::new()),
        }
    }
}

impl RateLimiterOptions {
    /// Single-mode options: one `(window_ms, limit)` pair for every path.
    pub fn single(window_ms: u64, limit: u64) -> Self {
        Self {
            window_ms: Some(window_ms),
            limit: Some(LimitValue::Fixed(limit)),
            ..Self::default()
        }
    }

    /// Multi-mode options: per-path rules with an optional default entry.
    pub fn routes(routes: RouteMap) -> Self {
        Self {
            routes: Some(routes),
            ..Self::default()
        }
    }

    /// Use a dynamic single-mode limit, evaluated per request.
    pub fn with_limit(mut self, limit: LimitValue) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Replace the backing store.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = store;
        self
    }

    /// Replace the rejection message.
    pub fn with_message(mut self, message: Message) -> Self {
        self.message = message;
        self
    }

    /// Replace the rejection status code.
    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    /// Install a custom key generator.
    pub fn with_key_generator<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestContext, &str) -> BoxFuture<'static, String> + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(f));
        self
    }

    /// Install a skip predicate.
    pub fn with_skip<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestContext) -> BoxFuture<'static, bool> + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(f));
        self
    }
}
