//! Request envelope and per-call options.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::correlation_id::CorrelationId;

/// Method used when the caller does not pick one.
pub const DEFAULT_METHOD: &str = "GET";

/// Request envelope published on the request channel.
///
/// `path`, `method`, `headers` and `body` are opaque to the bridge and
/// forwarded verbatim; only `id` carries meaning for correlation.
///
/// ```text
/// { "id": "01J...", "path": "/about", "method": "GET",
///   "headers": {...}, "body": null, "timestamp": 1718000000000 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: CorrelationId,
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Milliseconds since the Unix epoch at which the request was built.
    pub timestamp: i64,
}

impl Request {
    /// Build the envelope for an issued id from caller-supplied options.
    pub fn new(id: CorrelationId, path: impl Into<String>, options: &RequestOptions) -> Self {
        Self {
            id,
            path: path.into(),
            method: options
                .method
                .clone()
                .unwrap_or_else(|| DEFAULT_METHOD.to_string()),
            headers: options.headers.clone(),
            body: options.body.clone(),
            timestamp: unix_millis(),
        }
    }

    /// Serialize for publishing.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode a request consumed from the request channel.
    pub fn from_slice(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Per-call options for `Bridge::send_request`.
///
/// Everything is optional: the method defaults to `GET` and the timeout to
/// the bridge's configured default.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Add a header, replacing any previous value for the same name.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
