//! Dispatch of inbound response-channel messages.
//!
//! The dispatcher is the single consumer of the response channel. Each
//! message is decoded and routed:
//!
//! 1. undecodable → reported to diagnostics, loop continues
//! 2. `requestId` present → `Correlator::resolve`
//! 3. `type` present with a registered handler → that handler
//! 4. anything else → dropped
//!
//! Inside the running loop, broadcast handlers do not run on the loop task.
//! They are queued to a handler worker that invokes them one at a time on the
//! blocking pool, in arrival order, so a slow handler never delays replies.
//!
//! Nothing a single message does can stop the loop. Only the subscription
//! ending is unrecoverable: pending requests are rejected with
//! `Disconnected` and the `on_unrecoverable` callback fires once.

mod handler_table;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use log::{debug, trace, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::correlator::Correlator;
use crate::diagnostics::{Diagnostics, Event};
use crate::error::DispatchError;
use crate::protocol::{Broadcast, CorrelationId, Response};
use crate::transport::Subscription;

pub use handler_table::{HandlerTable, ResponseHandler};

const LOG_TARGET: &str = "azofly_bridge::dispatcher";

/// How a single message was routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Completed the pending request with this id.
    Resolved(CorrelationId),
    /// Carried a `requestId` matching nothing pending.
    UnknownCorrelation,
    /// Handed to the handler registered for this type.
    BroadcastDelivered(String),
    /// The handler for this type returned an error or panicked.
    HandlerFailed(String),
    /// No `requestId` and no handler for its type (or no type at all).
    Unhandled,
    /// Not a decodable response envelope.
    Malformed,
}

/// Outcome of routing, before any handler has run.
enum Routed {
    Done(Dispatched),
    Deliver(ResponseHandler, Broadcast),
}

/// Broadcast waiting for the handler worker.
type HandlerJob = (ResponseHandler, Broadcast);

/// Routes response-channel messages to the correlator or handler table.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    correlator: Arc<Correlator>,
    handlers: HandlerTable,
    diagnostics: Arc<Diagnostics>,
}

impl Dispatcher {
    pub fn new(
        correlator: Arc<Correlator>,
        handlers: HandlerTable,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            correlator,
            handlers,
            diagnostics,
        }
    }

    /// Spawn the consumer loop over `subscription`.
    ///
    /// `on_unrecoverable` is called at most once, after the subscription ends
    /// and every pending request has been rejected. It is not called when the
    /// returned handle is dropped.
    pub fn start<F>(&self, subscription: Subscription, on_unrecoverable: F) -> DispatcherHandle
    where
        F: FnOnce(DispatchError) + Send + 'static,
    {
        let cancel_token = CancellationToken::new();
        let terminated = CancellationToken::new();
        let join_handle = tokio::spawn(dispatch_loop(
            self.clone(),
            subscription,
            cancel_token.clone(),
            terminated.clone(),
            on_unrecoverable,
        ));

        DispatcherHandle {
            join_handle,
            cancel_token,
            terminated,
        }
    }

    /// Route one raw message, running any broadcast handler on the calling
    /// thread.
    pub fn dispatch(&self, raw: &[u8]) -> Dispatched {
        match self.route(raw) {
            Routed::Done(dispatched) => dispatched,
            Routed::Deliver(handler, broadcast) => self.deliver(handler, broadcast),
        }
    }

    fn route(&self, raw: &[u8]) -> Routed {
        let mut response = match Response::from_slice(raw) {
            Ok(response) => response,
            Err(e) => {
                self.diagnostics.report(&DispatchError::Decode(e));
                return Routed::Done(Dispatched::Malformed);
            }
        };

        if let Some(request_id) = response.request_id.take() {
            return Routed::Done(self.dispatch_reply(&request_id, response));
        }

        match response.kind.take() {
            Some(kind) => self.route_broadcast(kind, response),
            None => {
                trace!(target: LOG_TARGET, "Message with neither requestId nor type, dropping");
                self.diagnostics.record(Event::UnhandledBroadcast);
                Routed::Done(Dispatched::Unhandled)
            }
        }
    }

    fn dispatch_reply(&self, request_id: &str, response: Response) -> Dispatched {
        let Some(id) = CorrelationId::parse(request_id) else {
            // Not an id this process could have issued.
            debug!(
                target: LOG_TARGET,
                "Response for foreign request id {:?}, dropping",
                request_id
            );
            self.diagnostics.record(Event::UnknownCorrelation);
            return Dispatched::UnknownCorrelation;
        };

        if self.correlator.resolve(&id, response) {
            Dispatched::Resolved(id)
        } else {
            Dispatched::UnknownCorrelation
        }
    }

    fn route_broadcast(&self, kind: String, response: Response) -> Routed {
        // Clone the handler out so it runs with no table lock held.
        let Some(handler) = self.handlers.get(&kind) else {
            trace!(target: LOG_TARGET, "No handler for broadcast {:?}, dropping", kind);
            self.diagnostics.record(Event::UnhandledBroadcast);
            return Routed::Done(Dispatched::Unhandled);
        };

        let broadcast = Broadcast {
            kind,
            payload: response.into_payload(),
        };
        Routed::Deliver(handler, broadcast)
    }

    /// Invoke `handler` once, containing errors and panics.
    fn deliver(&self, handler: ResponseHandler, broadcast: Broadcast) -> Dispatched {
        let kind = broadcast.kind.clone();

        match catch_unwind(AssertUnwindSafe(|| handler(broadcast))) {
            Ok(Ok(())) => {
                self.diagnostics.record(Event::BroadcastDelivered);
                Dispatched::BroadcastDelivered(kind)
            }
            Ok(Err(e)) => {
                self.diagnostics.report(&DispatchError::HandlerFailed {
                    kind: kind.clone(),
                    message: e.to_string(),
                });
                Dispatched::HandlerFailed(kind)
            }
            Err(_) => {
                self.diagnostics
                    .report(&DispatchError::HandlerPanicked { kind: kind.clone() });
                Dispatched::HandlerFailed(kind)
            }
        }
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }
}

/// Handle to a running dispatch loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct DispatcherHandle {
    join_handle: JoinHandle<()>,
    cancel_token: CancellationToken,
    terminated: CancellationToken,
}

impl DispatcherHandle {
    /// Whether the loop has exited (cancelled or subscription closed).
    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Whether the loop has stopped routing responses.
    ///
    /// Becomes true before pending requests are failed on a closed
    /// subscription, so a request registered after this flips is never
    /// left waiting for a reply that cannot arrive.
    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn dispatch_loop<F>(
    dispatcher: Dispatcher,
    mut subscription: Subscription,
    cancel_token: CancellationToken,
    terminated: CancellationToken,
    on_unrecoverable: F,
) where
    F: FnOnce(DispatchError) + Send + 'static,
{
    debug!(
        target: LOG_TARGET,
        "Dispatching responses from {}",
        subscription.channel()
    );

    let (jobs, job_rx) = mpsc::unbounded_channel();
    tokio::spawn(handler_worker(dispatcher.clone(), job_rx));

    let closed = loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                debug!(target: LOG_TARGET, "Dispatcher cancelled, shutting down");
                break false;
            }

            delivery = subscription.next() => {
                match delivery {
                    Some(Ok(message)) => match dispatcher.route(&message.payload) {
                        Routed::Done(routed) => {
                            trace!(target: LOG_TARGET, "Dispatched message: {:?}", routed);
                        }
                        Routed::Deliver(handler, broadcast) => {
                            if jobs.send((handler, broadcast)).is_err() {
                                warn!(target: LOG_TARGET, "Handler worker gone, dropping broadcast");
                            }
                        }
                    },
                    // Transient; the subscription is still alive.
                    Some(Err(e)) => dispatcher.diagnostics.report(&DispatchError::Transport(e)),
                    None => break true,
                }
            }
        }
    };

    // Queued broadcasts still run; the worker exits once the queue drains.
    drop(jobs);
    terminated.cancel();

    if closed {
        let channel = subscription.channel().to_string();
        dispatcher
            .correlator
            .fail_all(&format!("subscription to {channel} closed"));

        let err = DispatchError::SubscriptionClosed { channel };
        dispatcher.diagnostics.report(&err);
        on_unrecoverable(err);
    }
}

/// Run queued broadcast handlers one at a time, in arrival order.
async fn handler_worker(dispatcher: Dispatcher, mut jobs: mpsc::UnboundedReceiver<HandlerJob>) {
    while let Some((handler, broadcast)) = jobs.recv().await {
        let dispatcher = dispatcher.clone();
        // deliver() contains handler panics, so a join error means the
        // runtime is shutting down.
        match tokio::task::spawn_blocking(move || dispatcher.deliver(handler, broadcast)).await {
            Ok(routed) => trace!(target: LOG_TARGET, "Delivered broadcast: {:?}", routed),
            Err(e) => {
                debug!(target: LOG_TARGET, "Handler worker stopping: {}", e);
                break;
            }
        }
    }
}
