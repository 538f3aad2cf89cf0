//! Registry of handlers for type-tagged broadcasts.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::HandlerError;
use crate::protocol::Broadcast;

/// A registered broadcast handler.
pub type ResponseHandler = Arc<dyn Fn(Broadcast) -> Result<(), HandlerError> + Send + Sync>;

/// Maps a message `type` to at most one handler.
///
/// Lookups clone the handler `Arc` out of the map so the handler runs with no
/// shard lock held and may itself register or unregister handlers.
#[derive(Default, Clone)]
pub struct HandlerTable {
    handlers: Arc<DashMap<String, ResponseHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one.
    ///
    /// Returns `true` if a handler was replaced.
    pub fn register<F>(&self, kind: impl Into<String>, handler: F) -> bool
    where
        F: Fn(Broadcast) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handlers
            .insert(kind.into(), Arc::new(handler))
            .is_some()
    }

    pub fn unregister(&self, kind: &str) -> bool {
        self.handlers.remove(kind).is_some()
    }

    pub(crate) fn get(&self, kind: &str) -> Option<ResponseHandler> {
        self.handlers.get(kind).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        kinds.sort();
        f.debug_struct("HandlerTable").field("kinds", &kinds).finish()
    }
}
