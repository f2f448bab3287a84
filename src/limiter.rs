//! Core rate limiter engine.
//!
//! Per-request flow: skip check, settings resolution, store
//! initialization, key generation, increment, threshold comparison. Each
//! step is awaited before the next; the engine does no work in parallel
//! within one request.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, trace, warn};

use crate::error::{RateGateError, RenderedMessage, Result, DEFAULT_MESSAGE};
use crate::options::{KeyGeneratorFn, Message, RateLimiterOptions, SkipFn};
use crate::request::RequestContext;
use crate::rules::RouteRules;
use crate::store::{ClientRateLimitInfo, Store, StoreOptions};

/// Trusted edge-provided client address header, preferred for key
/// derivation.
const CLIENT_IP_HEADER: &str = "cf-connecting-ip";
/// Fallback forwarded-for header; only the first (client-most) entry is
/// used.
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
/// Key marker when no client address can be derived.
const UNKNOWN_CLIENT: &str = "unknown";

/// Terminal state of a request that was not rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The request was counted and is within its limit.
    Allowed(ClientRateLimitInfo),
    /// No limiting applies to this path; the request passed through
    /// unmetered.
    Unlimited,
    /// The skip predicate matched; the request was not counted.
    Skipped,
}

/// The rate limiter engine.
///
/// Holds validated rules and a backend-agnostic [`Store`]; shared by all
/// concurrent requests. Rejections surface as
/// [`RateGateError::TooManyRequests`] for the caller's transport layer to
/// translate; store failures propagate unmodified, and the engine takes no
/// default-allow/deny stance on them.
pub struct RateLimiter {
    rules: RouteRules,
    message: Message,
    status_code: u16,
    key_generator: Option<Arc<KeyGeneratorFn>>,
    skip: Option<Arc<SkipFn>>,
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rules", &self.rules)
            .field("message", &self.message)
            .field("status_code", &self.status_code)
            .field("key_generator", &self.key_generator.is_some())
            .field("skip", &self.skip.is_some())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Build an engine from options.
    ///
    /// Rule shape validation happens here: ambiguous or incomplete rule
    /// configuration is rejected before any request is processed.
    pub fn new(options: RateLimiterOptions) -> Result<Self> {
        let RateLimiterOptions {
            window_ms,
            limit,
            routes,
            message,
            status_code,
            key_generator,
            skip,
            store,
        } = options;

        let rules = RouteRules::from_options(window_ms, limit, routes)?;

        // Double-count misconfiguration aid: record what kind of store
        // backs this engine instance.
        debug!(
            local_keys = store.local_keys(),
            prefix = ?store.prefix(),
            rules = ?rules,
            "Rate limiter initialized"
        );

        Ok(Self {
            rules,
            message,
            status_code,
            key_generator,
            skip,
            store,
        })
    }

    /// Run the limiting flow for one request.
    ///
    /// Returns the terminal [`Outcome`] on acceptance, or
    /// [`RateGateError::TooManyRequests`] on rejection.
    pub async fn check(&self, ctx: &RequestContext) -> Result<Outcome> {
        if let Some(skip) = &self.skip {
            if skip(ctx).await {
                trace!(path = %ctx.path(), "Request skipped");
                return Ok(Outcome::Skipped);
            }
        }

        let Some(settings) = self.rules.resolve(ctx.path(), ctx).await? else {
            trace!(path = %ctx.path(), "No limiting applies");
            return Ok(Outcome::Unlimited);
        };

        self.store
            .init(StoreOptions {
                window_ms: settings.window_ms,
            })
            .await?;

        let key = match &self.key_generator {
            Some(generator) => generator(ctx, ctx.path()).await,
            None => default_key(ctx),
        };

        let info = self.store.increment(&key).await?;

        trace!(
            key = %key,
            total_hits = info.total_hits,
            limit = settings.limit,
            "Checked rate limit"
        );

        if info.total_hits > settings.limit {
            let retry_after_secs = info.reset_time.map(|reset| {
                let remaining_ms = (reset - Utc::now()).num_milliseconds().max(0);
                // Ceiling in whole seconds.
                ((remaining_ms + 999) / 1000) as u64
            });

            debug!(
                key = %key,
                total_hits = info.total_hits,
                limit = settings.limit,
                retry_after_secs = ?retry_after_secs,
                "Rate limit exceeded"
            );

            return Err(RateGateError::TooManyRequests {
                status_code: self.status_code,
                message: self.render_message(ctx).await,
                retry_after_secs,
            });
        }

        Ok(Outcome::Allowed(info))
    }

    /// A reference to the backing store, for explicit resets and
    /// shutdown.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Resolve the configured message for a rejection. Rendering failures
    /// never fail the rejection path; they fall back to the generic
    /// default.
    async fn render_message(&self, ctx: &RequestContext) -> RenderedMessage {
        match &self.message {
            Message::Static(text) => RenderedMessage::Text(text.clone()),
            Message::Json(value) => RenderedMessage::Json(value.clone()),
            Message::Dynamic(f) => match f(ctx).await {
                Ok(message) => message,
                Err(error) => {
                    warn!(%error, "Failed to render rate limit message, using default");
                    RenderedMessage::Text(DEFAULT_MESSAGE.to_string())
                }
            },
        }
    }
}

/// Default key derivation: trusted client address header, else the first
/// forwarded-for entry, else a literal unknown marker; always prefixed
/// with the route path so per-route limits stay isolated.
fn default_key(ctx: &RequestContext) -> String {
    if let Some(ip) = ctx.header(CLIENT_IP_HEADER) {
        return format!("{}:{}", ctx.path(), ip);
    }

    let forwarded = ctx
        .header(FORWARDED_FOR_HEADER)
        .and_then(|list| list.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    format!("{}:{}", ctx.path(), forwarded.unwrap_or(UNKNOWN_CLIENT))
}
