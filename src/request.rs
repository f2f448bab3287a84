//! Transport-agnostic request metadata.
//!
//! The engine never touches the caller's HTTP/RPC framework directly. The
//! framework glue extracts the normalized route path and the request headers
//! it wants the limiter to see, and hands them over as a `RequestContext`.

use std::collections::HashMap;

/// Metadata about one in-flight request.
///
/// Header names are matched case-insensitively; they are lowercased on
/// insertion and on lookup.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// The normalized route path, already extracted from the transport's
    /// routing scheme by the caller.
    path: String,
    /// Request headers relevant to key derivation and skip decisions.
    headers: HashMap<String, String>,
}

impl RequestContext {
    /// Create a new request context for the given route path.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            headers: HashMap::new(),
        }
    }

    /// Attach a header to the context.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// The normalized route path for this request.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Look up a header by name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}
