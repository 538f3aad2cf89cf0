//! Completion handle returned to callers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;

use super::Shared;
use super::pending::Outcome;
use crate::error::BridgeError;
use crate::protocol::CorrelationId;

/// Future resolving exactly once to the response payload or an error.
///
/// Dropping the handle does not withdraw the request: the entry stays pending
/// until its response, deadline or an explicit `cancel`.
#[derive(Debug)]
pub struct ResponseHandle {
    id: CorrelationId,
    rx: oneshot::Receiver<Outcome>,
    shared: Weak<Shared>,
}

impl ResponseHandle {
    pub(super) fn new(id: CorrelationId, rx: oneshot::Receiver<Outcome>, shared: Weak<Shared>) -> Self {
        Self { id, rx, shared }
    }

    /// The correlation id attached to the outgoing request.
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Cancel the request if it is still pending.
    ///
    /// The handle then resolves to `BridgeError::Cancelled`. Returns `false`
    /// if the request already reached a terminal state.
    pub fn cancel(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.cancel(&self.id),
            None => false,
        }
    }
}

impl Future for ResponseHandle {
    type Output = Result<Value, BridgeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(outcome) => outcome,
            // Sender dropped without completing: the correlator itself is gone.
            Err(_) => Err(BridgeError::disconnected("correlator dropped")),
        })
    }
}
