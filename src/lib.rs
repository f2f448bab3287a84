//! Rategate - Request Rate Limiting Engine
//!
//! This crate implements request rate limiting for RPC-style endpoints: it
//! counts requests per client-derived key within a time window and rejects
//! requests once a configurable threshold is exceeded. Counting is backed
//! by a pluggable [`Store`]; an in-process store and a per-key actor store
//! are provided. The transport layer stays outside: callers hand the
//! engine a [`RequestContext`] and translate its outcome into a wire-level
//! response.

pub mod error;
pub mod limiter;
pub mod options;
pub mod request;
pub mod rules;
pub mod store;

pub use error::{RateGateError, RenderedMessage, Result, DEFAULT_MESSAGE};
pub use limiter::{Outcome, RateLimiter};
pub use options::{Message, RateLimiterOptions, DEFAULT_STATUS_CODE};
pub use request::RequestContext;
pub use rules::{LimitValue, RateLimiterSettings, RouteMap, RouteRule};
pub use store::{ActorStore, ClientRateLimitInfo, MemoryStore, Store, StoreOptions};
