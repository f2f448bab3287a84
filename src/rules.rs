//! Route rule configuration and settings resolution.
//!
//! This module decides which `(window_ms, limit)` pair applies to a given
//! request path. Rules come in exactly one of two shapes: a single pair
//! applied to every path, or a per-path map with an optional `default`
//! entry used as a fallback. Supplying both shapes at once is rejected
//! before any request is processed.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::info;

use crate::error::{RateGateError, Result};
use crate::request::RequestContext;

/// The map key used as the fallback entry in per-route rule maps.
pub const DEFAULT_ROUTE: &str = "default";

/// A limit evaluated per request: either a fixed value or an async
/// function of the request (e.g. to give authenticated callers a higher
/// quota).
#[derive(Clone, Deserialize)]
#[serde(from = "u64")]
pub enum LimitValue {
    /// A fixed hit threshold.
    Fixed(u64),
    /// A threshold computed from the request on every call.
    Dynamic(Arc<dyn Fn(&RequestContext) -> BoxFuture<'static, u64> + Send + Sync>),
}

impl LimitValue {
    /// Build a dynamic limit from an async function of the request.
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&RequestContext) -> BoxFuture<'static, u64> + Send + Sync + 'static,
    {
        LimitValue::Dynamic(Arc::new(f))
    }

    /// Evaluate the limit for this request.
    pub async fn evaluate(&self, ctx: &RequestContext) -> u64 {
        match self {
            LimitValue::Fixed(limit) => *limit,
            LimitValue::Dynamic(f) => f(ctx).await,
        }
    }
}

impl From<u64> for LimitValue {
    fn from(limit: u64) -> Self {
        LimitValue::Fixed(limit)
    }
}

impl std::fmt::Debug for LimitValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitValue::Fixed(limit) => f.debug_tuple("Fixed").field(limit).finish(),
            LimitValue::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// The rule for a single route (or for the `default` fallback entry).
///
/// Either field may be absent; resolution falls back to the `default`
/// entry independently for each one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteRule {
    /// Length of the counting window, in milliseconds.
    #[serde(default)]
    pub window_ms: Option<u64>,
    /// Maximum hits allowed within the window.
    #[serde(default)]
    pub limit: Option<LimitValue>,
}

impl RouteRule {
    /// A complete rule with a fixed limit.
    pub fn new(window_ms: u64, limit: u64) -> Self {
        Self {
            window_ms: Some(window_ms),
            limit: Some(LimitValue::Fixed(limit)),
        }
    }
}

/// A per-route rule map, keyed by request path.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct RouteMap {
    routes: HashMap<String, RouteRule>,
}

impl RouteMap {
    /// Create an empty rule map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule for a path.
    pub fn route(mut self, path: impl Into<String>, rule: RouteRule) -> Self {
        self.routes.insert(path.into(), rule);
        self
    }

    /// Add the `default` fallback rule.
    pub fn default_rule(self, rule: RouteRule) -> Self {
        self.route(DEFAULT_ROUTE, rule)
    }

    /// Look up the rule for a path.
    pub fn get(&self, path: &str) -> Option<&RouteRule> {
        self.routes.get(path)
    }

    /// Load a rule map from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RateGateError::Config(format!("Failed to parse route rules: {}", e)))
    }

    /// Load a rule map from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading route rule configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }
}

/// The effective settings for one request, after resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterSettings {
    /// Length of the counting window, in milliseconds.
    pub window_ms: u64,
    /// Maximum hits allowed within the window.
    pub limit: u64,
}

/// Validated rule configuration held by the engine. Exactly one shape.
#[derive(Debug, Clone)]
pub enum RouteRules {
    /// One `(window_ms, limit)` pair applied to every path.
    Single { window_ms: u64, limit: LimitValue },
    /// Per-path rules with an optional `default` fallback entry.
    PerRoute(RouteMap),
}

impl RouteRules {
    /// Build validated rules from the raw option fields.
    ///
    /// Ambiguous input (both shapes at once) and incomplete single-mode
    /// input are rejected here, before any request is processed.
    pub(crate) fn from_options(
        window_ms: Option<u64>,
        limit: Option<LimitValue>,
        routes: Option<RouteMap>,
    ) -> Result<Self> {
        if (window_ms.is_some() || limit.is_some()) && routes.is_some() {
            return Err(RateGateError::Config(
                "`window_ms`/`limit` and `routes` cannot be combined".to_string(),
            ));
        }

        if let Some(map) = routes {
            for (path, rule) in &map.routes {
                if rule.window_ms == Some(0) {
                    return Err(RateGateError::Config(format!(
                        "window_ms must be positive for path {}",
                        path
                    )));
                }
                if matches!(rule.limit, Some(LimitValue::Fixed(0))) {
                    return Err(RateGateError::Config(format!(
                        "limit must be positive for path {}",
                        path
                    )));
                }
            }
            return Ok(RouteRules::PerRoute(map));
        }

        match (window_ms, limit) {
            (Some(0), _) => Err(RateGateError::Config(
                "window_ms must be positive".to_string(),
            )),
            (_, Some(LimitValue::Fixed(0))) => {
                Err(RateGateError::Config("limit must be positive".to_string()))
            }
            (Some(window_ms), Some(limit)) => Ok(RouteRules::Single { window_ms, limit }),
            (None, None) => Err(RateGateError::Config(
                "no rate limiter settings found".to_string(),
            )),
            _ => Err(RateGateError::Config(
                "missing window_ms or limit".to_string(),
            )),
        }
    }

    /// Resolve the effective settings for a request path.
    ///
    /// Returns `Ok(None)` when no limiting applies to the path (not an
    /// error; the request passes through unmetered). A path left with
    /// exactly one of `window_ms`/`limit` after fallback is a
    /// configuration error.
    pub async fn resolve(
        &self,
        path: &str,
        ctx: &RequestContext,
    ) -> Result<Option<RateLimiterSettings>> {
        match self {
            RouteRules::Single { window_ms, limit } => Ok(Some(RateLimiterSettings {
                window_ms: *window_ms,
                limit: limit.evaluate(ctx).await,
            })),
            RouteRules::PerRoute(map) => {
                let specific = map.get(path);
                let fallback = map.get(DEFAULT_ROUTE);

                // window_ms and limit fall back to the default entry
                // independently of each other.
                let window_ms = specific
                    .and_then(|r| r.window_ms)
                    .or_else(|| fallback.and_then(|r| r.window_ms));
                let limit = specific
                    .and_then(|r| r.limit.clone())
                    .or_else(|| fallback.and_then(|r| r.limit.clone()));

                match (window_ms, limit) {
                    (Some(window_ms), Some(limit)) => Ok(Some(RateLimiterSettings {
                        window_ms,
                        limit: limit.evaluate(ctx).await,
                    })),
                    (None, None) => Ok(None),
                    _ => Err(RateGateError::Config(format!(
                        "missing window_ms or limit for path {}",
                        path
                    ))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(path: &str) -> RequestContext {
        RequestContext::new(path)
    }

    #[test]
    fn test_single_mode_resolution() {
        let rules =
            RouteRules::from_options(Some(1000), Some(LimitValue::Fixed(5)), None).unwrap();

        let settings =
            tokio_test::block_on(rules.resolve("/anything", &ctx("/anything"))).unwrap();
        assert_eq!(
            settings,
            Some(RateLimiterSettings {
                window_ms: 1000,
                limit: 5
            })
        );
    }

    #[tokio::test]
    async fn test_per_route_resolution_with_default() {
        let map = RouteMap::new()
            .route("/a", RouteRule::new(1000, 5))
            .default_rule(RouteRule::new(2000, 10));
        let rules = RouteRules::from_options(None, None, Some(map)).unwrap();

        let a = rules.resolve("/a", &ctx("/a")).await.unwrap().unwrap();
        assert_eq!(a, RateLimiterSettings { window_ms: 1000, limit: 5 });

        let b = rules.resolve("/b", &ctx("/b")).await.unwrap().unwrap();
        assert_eq!(b, RateLimiterSettings { window_ms: 2000, limit: 10 });
    }

    #[tokio::test]
    async fn test_per_route_no_default_means_unlimited() {
        let map = RouteMap::new().route("/a", RouteRule::new(1000, 5));
        let rules = RouteRules::from_options(None, None, Some(map)).unwrap();

        let settings = rules.resolve("/c", &ctx("/c")).await.unwrap();
        assert_eq!(settings, None);
    }

    #[tokio::test]
    async fn test_independent_fallback() {
        // The path inherits window_ms from its own entry and limit from
        // the default entry.
        let map = RouteMap::new()
            .route(
                "/a",
                RouteRule {
                    window_ms: Some(500),
                    limit: None,
                },
            )
            .default_rule(RouteRule::new(2000, 10));
        let rules = RouteRules::from_options(None, None, Some(map)).unwrap();

        let settings = rules.resolve("/a", &ctx("/a")).await.unwrap().unwrap();
        assert_eq!(settings, RateLimiterSettings { window_ms: 500, limit: 10 });
    }

    #[tokio::test]
    async fn test_partial_rule_after_fallback_is_error() {
        let map = RouteMap::new().route(
            "/a",
            RouteRule {
                window_ms: Some(500),
                limit: None,
            },
        );
        let rules = RouteRules::from_options(None, None, Some(map)).unwrap();

        let err = rules.resolve("/a", &ctx("/a")).await.unwrap_err();
        assert!(matches!(err, RateGateError::Config(_)));
    }

    #[test]
    fn test_both_shapes_rejected() {
        let map = RouteMap::new().route("/a", RouteRule::new(1000, 5));
        let err =
            RouteRules::from_options(Some(1000), Some(LimitValue::Fixed(5)), Some(map))
                .unwrap_err();
        assert!(matches!(err, RateGateError::Config(_)));
    }

    #[test]
    fn test_incomplete_single_mode_rejected() {
        let err = RouteRules::from_options(Some(1000), None, None).unwrap_err();
        assert!(matches!(err, RateGateError::Config(_)));

        let err = RouteRules::from_options(None, Some(LimitValue::Fixed(5)), None).unwrap_err();
        assert!(matches!(err, RateGateError::Config(_)));
    }

    #[test]
    fn test_no_settings_rejected() {
        let err = RouteRules::from_options(None, None, None).unwrap_err();
        assert!(matches!(err, RateGateError::Config(_)));
    }

    #[test]
    fn test_zero_values_rejected() {
        let err = RouteRules::from_options(Some(0), Some(LimitValue::Fixed(5)), None).unwrap_err();
        assert!(matches!(err, RateGateError::Config(_)));

        let map = RouteMap::new().route("/a", RouteRule::new(1000, 0));
        let err = RouteRules::from_options(None, None, Some(map)).unwrap_err();
        assert!(matches!(err, RateGateError::Config(_)));
    }

    #[tokio::test]
    async fn test_dynamic_limit_evaluated_per_call() {
        let limit = LimitValue::dynamic(|ctx: &RequestContext| {
            let premium = ctx.header("x-premium").is_some();
            Box::pin(async move { if premium { 100 } else { 10 } })
        });
        let rules = RouteRules::from_options(Some(1000), Some(limit), None).unwrap();

        let basic = rules.resolve("/a", &ctx("/a")).await.unwrap().unwrap();
        assert_eq!(basic.limit, 10);

        let premium_ctx = RequestContext::new("/a").with_header("x-premium", "1");
        let premium = rules.resolve("/a", &premium_ctx).await.unwrap().unwrap();
        assert_eq!(premium.limit, 100);
    }

    #[test]
    fn test_parse_route_map_yaml() {
        let yaml = r#"
"/users.list":
  window_ms: 1000
  limit: 5
default:
  window_ms: 2000
  limit: 10
"#;
        let map = RouteMap::from_yaml(yaml).unwrap();
        assert_eq!(map.get("/users.list").unwrap().window_ms, Some(1000));
        assert!(matches!(
            map.get(DEFAULT_ROUTE).unwrap().limit,
            Some(LimitValue::Fixed(10))
        ));
    }

    #[test]
    fn test_parse_partial_rule_yaml() {
        let yaml = r#"
"/search":
  window_ms: 500
"#;
        let map = RouteMap::from_yaml(yaml).unwrap();
        let rule = map.get("/search").unwrap();
        assert_eq!(rule.window_ms, Some(500));
        assert!(rule.limit.is_none());
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let err = RouteMap::from_yaml("not: [valid").unwrap_err();
        assert!(matches!(err, RateGateError::Config(_)));
    }
}
