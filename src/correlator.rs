//! Correlation of published requests with their eventual responses.
//!
//! The Correlator owns the pending set: issued ids mapped to the oneshot
//! senders behind each caller's `ResponseHandle`, plus a deadline index
//! serviced by one expiry task.
//!
//! # Exactly-once completion
//!
//! Every terminal transition (response, remote error, timeout, cancellation,
//! rollback, disconnect) starts by removing the entry under the mutex. Only
//! the caller that removed it completes the handle, and it does so after
//! releasing the lock. A response racing its deadline therefore yields exactly
//! one outcome, and a late response finds nothing and is dropped.
//!
//! # Usage
//!
//! ```ignore
//! let correlator = Correlator::new();
//! let (id, handle) = correlator.issue(Duration::from_secs(5)); // before publishing
//! // ... publish a request carrying `id` ...
//! // the dispatcher calls `correlator.resolve(&id, response)` on arrival
//! let payload = handle.await?;
//! ```

mod expiry;
mod handle;
mod pending;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, trace};
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;

use crate::diagnostics::{Diagnostics, Event};
use crate::error::BridgeError;
use crate::protocol::{CorrelationId, Response};

pub use handle::ResponseHandle;
use pending::{PendingEntry, PendingSet};

const LOG_TARGET: &str = "azofly_bridge::correlator";

/// Longest accepted timeout (one year). Larger values are clamped so the
/// deadline arithmetic cannot overflow.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// State shared between the correlator, its expiry task and live handles.
#[derive(Debug)]
pub(crate) struct Shared {
    state: Mutex<PendingSet>,
    /// Wakes the expiry task when a new earliest deadline is inserted.
    wake: Notify,
    diagnostics: Arc<Diagnostics>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PendingSet> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cancel(&self, id: &CorrelationId) -> bool {
        let Some(entry) = self.lock().take(id) else {
            return false;
        };

        debug!(target: LOG_TARGET, "Request {} cancelled", id);
        self.diagnostics.record(Event::Cancelled);
        entry.complete(Err(BridgeError::Cancelled { id: *id }));
        true
    }

    /// Expire everything due at `now` and return the next deadline, if any.
    fn expire_due(&self, now: Instant) -> Option<Instant> {
        let (expired, next_deadline) = {
            let mut state = self.lock();
            let expired = state.drain_expired(now);
            (expired, state.next_deadline())
        };

        // Complete outside the lock
        for (id, entry) in expired {
            let elapsed = now.saturating_duration_since(entry.issued_at);
            debug!(
                target: LOG_TARGET,
                "Request {} timed out after {:?}",
                id,
                elapsed
            );
            self.diagnostics.record(Event::TimedOut);
            entry.complete(Err(BridgeError::Timeout { id, elapsed }));
        }

        next_deadline
    }
}

/// Tracks in-flight requests and completes their handles.
///
/// Thread-safe; share it behind an `Arc`. Dropping the correlator stops its
/// expiry task and fails any remaining handles with `Disconnected`.
#[derive(Debug)]
pub struct Correlator {
    shared: Arc<Shared>,
    _expiry: ExpiryGuard,
}

/// Owns the expiry task handle; separate so `Correlator` can derive Debug.
struct ExpiryGuard(expiry::ExpiryTaskHandle);

impl std::fmt::Debug for ExpiryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ExpiryTask")
    }
}

impl Correlator {
    /// Create a correlator with its own diagnostics.
    ///
    /// Must be called from within a Tokio runtime (spawns the expiry task).
    pub fn new() -> Self {
        Self::with_diagnostics(Arc::new(Diagnostics::new()))
    }

    /// Create a correlator reporting into shared diagnostics.
    pub fn with_diagnostics(diagnostics: Arc<Diagnostics>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(PendingSet::default()),
            wake: Notify::new(),
            diagnostics,
        });
        let expiry = expiry::spawn_expiry_task(Arc::clone(&shared));

        Self {
            shared,
            _expiry: ExpiryGuard(expiry),
        }
    }

    /// Register a new pending request and return its id and handle.
    ///
    /// Must be called before the request is published so a fast response
    /// always finds its entry. The handle rejects with `Timeout` once
    /// `timeout` elapses without a response.
    pub fn issue(&self, timeout: Duration) -> (CorrelationId, ResponseHandle) {
        let (tx, rx) = oneshot::channel();
        let issued_at = Instant::now();
        let deadline = issued_at + timeout.min(MAX_TIMEOUT);

        let (id, wake) = {
            let mut state = self.shared.lock();
            // ULID collisions are practically impossible; never reuse a live id regardless.
            let id = loop {
                let candidate = CorrelationId::generate();
                if !state.contains(&candidate) {
                    break candidate;
                }
            };
            let wake = state.next_deadline().is_none_or(|next| deadline < next);
            state.insert(id, PendingEntry::new(tx, issued_at, deadline));
            (id, wake)
        };

        if wake {
            self.shared.wake.notify_one();
        }
        trace!(
            target: LOG_TARGET,
            "Issued request {} with timeout {:?}",
            id,
            timeout
        );

        (id, ResponseHandle::new(id, rx, Arc::downgrade(&self.shared)))
    }

    /// Complete the pending request `id` with `response`.
    ///
    /// A response carrying `error` rejects the handle with
    /// `BridgeError::Remote`; otherwise the handle resolves with the payload.
    ///
    /// Returns `true` if the request was pending. Unknown ids (late, duplicate
    /// or never issued) are a silent no-op returning `false`.
    pub fn resolve(&self, id: &CorrelationId, mut response: Response) -> bool {
        let Some(entry) = self.shared.lock().take(id) else {
            debug!(
                target: LOG_TARGET,
                "Response for unknown request {}, dropping",
                id
            );
            self.shared.diagnostics.record(Event::UnknownCorrelation);
            return false;
        };

        let outcome = match response.error.take() {
            Some(error) => {
                self.shared.diagnostics.record(Event::Rejected);
                Err(BridgeError::Remote { id: *id, error })
            }
            None => {
                self.shared.diagnostics.record(Event::Resolved);
                Ok(response.into_payload())
            }
        };

        if !entry.complete(outcome) {
            trace!(
                target: LOG_TARGET,
                "Caller for request {} went away before completion",
                id
            );
        }
        true
    }

    /// Cancel a pending request; its handle rejects with `Cancelled`.
    ///
    /// Returns `false` if `id` is not pending.
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        self.shared.cancel(id)
    }

    /// Withdraw a pending request without completing its handle.
    ///
    /// Used to roll back an entry whose request never left the process
    /// (encode or publish failure); the caller reports the error directly.
    pub fn remove(&self, id: &CorrelationId) -> bool {
        self.shared.lock().take(id).is_some()
    }

    /// Reject every pending request with `Disconnected`.
    ///
    /// Called when no response can arrive any more (subscription lost or
    /// bridge shut down).
    pub fn fail_all(&self, reason: &str) -> usize {
        let entries = self.shared.lock().drain_all();
        let count = entries.len();

        for (_, entry) in entries {
            entry.complete(Err(BridgeError::disconnected(reason)));
        }
        if count > 0 {
            debug!(
                target: LOG_TARGET,
                "Failed {} pending requests: {}",
                count,
                reason
            );
        }
        count
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.shared.lock().contains(id)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().len()
    }

    /// Ids currently pending, in no particular order.
    pub fn pending_ids(&self) -> Vec<CorrelationId> {
        self.shared.lock().ids()
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.shared.diagnostics
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.fail_all("correlator dropped");
    }
}
