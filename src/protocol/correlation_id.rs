//! Correlation ID type for matching responses to outstanding requests.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Opaque identifier linking a published request to its eventual response.
///
/// Wraps a 128-bit ULID (48-bit millisecond timestamp + 80 random bits), so
/// ids generated concurrently in the same process or across processes collide
/// with negligible probability. The bridge generates ids; callers never choose
/// them.
///
/// # Wire Format
///
/// Serialized as the canonical 26-character Crockford base32 string, both in
/// the request's `id` field and in the response's `requestId` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Ulid);

impl CorrelationId {
    /// Generate a fresh, globally unique id.
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Parse an id from its wire representation.
    ///
    /// Returns `None` for strings that are not valid ULIDs. Such ids can never
    /// match a pending request, so callers treat them as unknown correlations.
    pub fn parse(raw: &str) -> Option<Self> {
        Ulid::from_string(raw).ok().map(Self)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for CorrelationId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}
