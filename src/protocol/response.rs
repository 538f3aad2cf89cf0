//! Response envelope consumed from the response channel.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::correlation_id::CorrelationId;

/// Response envelope.
///
/// ```text
/// { "requestId"?: "01J...", "type"?: "nav-event", "error"?: ..., "payload"?: ... }
/// ```
///
/// `requestId` and `type` may both be present; routing gives `requestId`
/// priority. A `null` error is treated as absent.
///
/// Servers that predate the `payload` field put their data at the top level
/// (`{ "requestId", "html", "state", "status", ... }`). Those fields are kept
/// in `extra` and become the payload when `payload` itself is missing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Response {
    /// Successful answer to a request.
    pub fn reply(id: CorrelationId, payload: Value) -> Self {
        Self {
            request_id: Some(id.to_string()),
            payload,
            ..Self::default()
        }
    }

    /// Failed answer to a request. The error value reaches the caller verbatim.
    pub fn failure(id: CorrelationId, error: Value) -> Self {
        Self {
            request_id: Some(id.to_string()),
            error: Some(error),
            ..Self::default()
        }
    }

    /// Unsolicited message routed by type.
    pub fn broadcast(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: Some(kind.into()),
            payload,
            ..Self::default()
        }
    }

    pub fn from_slice(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Consume the envelope and return the data delivered to the caller.
    ///
    /// Returns `payload` when present, otherwise the legacy top-level fields
    /// as an object, otherwise `null`.
    pub fn into_payload(self) -> Value {
        if !self.payload.is_null() {
            self.payload
        } else if !self.extra.is_empty() {
            Value::Object(self.extra)
        } else {
            Value::Null
        }
    }
}

/// A type-tagged broadcast handed to a registered response handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Broadcast {
    pub kind: String,
    pub payload: Value,
}
