//! Pending-set state guarded by the correlator's mutex.
//!
//! Every entry is indexed twice: by id for response lookup and by
//! `(deadline, id)` for expiry. Both indexes change together inside one
//! critical section, so removing an entry also disarms its timer.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::BridgeError;
use crate::protocol::CorrelationId;

/// What a `ResponseHandle` eventually yields.
pub(crate) type Outcome = Result<Value, BridgeError>;

/// One outstanding request.
pub(crate) struct PendingEntry {
    completion: oneshot::Sender<Outcome>,
    pub(crate) issued_at: Instant,
    pub(crate) deadline: Instant,
}

impl PendingEntry {
    pub(crate) fn new(
        completion: oneshot::Sender<Outcome>,
        issued_at: Instant,
        deadline: Instant,
    ) -> Self {
        Self {
            completion,
            issued_at,
            deadline,
        }
    }

    /// Complete the handle. Returns `false` if the caller dropped it.
    pub(crate) fn complete(self, outcome: Outcome) -> bool {
        self.completion.send(outcome).is_ok()
    }
}

#[derive(Default)]
pub(crate) struct PendingSet {
    entries: HashMap<CorrelationId, PendingEntry>,
    /// Timer index: one `(deadline, id)` per entry.
    deadlines: BTreeSet<(Instant, CorrelationId)>,
}

impl PendingSet {
    /// Insert an entry. Returns `false` (and keeps the old entry) on duplicates.
    pub(crate) fn insert(&mut self, id: CorrelationId, entry: PendingEntry) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        self.deadlines.insert((entry.deadline, id));
        self.entries.insert(id, entry);
        true
    }

    /// Remove an entry and its timer.
    pub(crate) fn take(&mut self, id: &CorrelationId) -> Option<PendingEntry> {
        let entry = self.entries.remove(id)?;
        self.deadlines.remove(&(entry.deadline, *id));
        Some(entry)
    }

    /// Remove every entry whose deadline is at or before `now`.
    pub(crate) fn drain_expired(&mut self, now: Instant) -> Vec<(CorrelationId, PendingEntry)> {
        let mut expired = Vec::new();
        while let Some(&(deadline, id)) = self.deadlines.first() {
            if deadline > now {
                break;
            }
            self.deadlines.pop_first();
            if let Some(entry) = self.entries.remove(&id) {
                expired.push((id, entry));
            }
        }
        expired
    }

    pub(crate) fn drain_all(&mut self) -> Vec<(CorrelationId, PendingEntry)> {
        self.deadlines.clear();
        self.entries.drain().collect()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|&(deadline, _)| deadline)
    }

    pub(crate) fn contains(&self, id: &CorrelationId) -> bool {
        self.entries.contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn ids(&self) -> Vec<CorrelationId> {
        self.entries.keys().copied().collect()
    }
}

impl std::fmt::Debug for PendingSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingSet")
            .field("len", &self.len())
            .field("next_deadline", &self.next_deadline())
            .finish()
    }
}
