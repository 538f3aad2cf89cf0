//! Public request/response API over a pub/sub transport.
//!
//! A `Bridge` publishes requests on the configured request channel and
//! consumes the response channel through one `Dispatcher`. Callers get a
//! `ResponseHandle` per request:
//!
//! ```ignore
//! let bridge = Bridge::new(transport, BridgeConfig::default());
//! bridge.start(|err| log::error!("bridge lost its subscription: {err}"))?;
//!
//! let page = bridge.request("/about", RequestOptions::new()).await?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use serde_json::Value;

use crate::config::BridgeConfig;
use crate::correlator::{Correlator, ResponseHandle};
use crate::diagnostics::{DiagnosticSink, Diagnostics, DiagnosticsSnapshot, Event};
use crate::dispatcher::{Dispatcher, DispatcherHandle, HandlerTable};
use crate::error::{BridgeError, BridgeResult, DispatchError, HandlerError};
use crate::protocol::{Broadcast, CorrelationId, Request, RequestOptions};
use crate::transport::{Transport, publish_bounded};

const LOG_TARGET: &str = "azofly_bridge::bridge";

/// Headers `fetch_data` sends unless the caller overrides them.
const JSON_HEADERS: [(&str, &str); 2] = [
    ("Content-Type", "application/json"),
    ("Accept", "application/json"),
];

/// Request/response correlation over a `Transport`.
///
/// All methods take `&self`; share the bridge behind an `Arc` to issue
/// requests from many tasks.
pub struct Bridge<T: Transport> {
    transport: Arc<T>,
    config: BridgeConfig,
    correlator: Arc<Correlator>,
    handlers: HandlerTable,
    diagnostics: Arc<Diagnostics>,
    dispatcher: Mutex<Option<DispatcherHandle>>,
    shut_down: AtomicBool,
}

/// Withdraws an issued entry unless disarmed.
///
/// Covers early returns and a `send_request` future dropped mid-publish.
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: CorrelationId,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    fn new(correlator: &'a Correlator, id: CorrelationId) -> Self {
        Self {
            correlator,
            id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.correlator.remove(&self.id) {
            debug!(target: LOG_TARGET, "Withdrew unsent request {}", self.id);
        }
    }
}

impl<T: Transport> Bridge<T> {
    /// Create a bridge. Must be called from within a Tokio runtime.
    ///
    /// Nothing is consumed until `start` is called.
    pub fn new(transport: T, config: BridgeConfig) -> Self {
        Self::with_shared_transport(Arc::new(transport), config)
    }

    /// Create a bridge over a transport that is also used elsewhere
    /// (for example by an in-process `Responder`).
    pub fn with_shared_transport(transport: Arc<T>, config: BridgeConfig) -> Self {
        let diagnostics = Arc::new(Diagnostics::new());
        let correlator = Arc::new(Correlator::with_diagnostics(Arc::clone(&diagnostics)));

        Self {
            transport,
            config,
            correlator,
            handlers: HandlerTable::new(),
            diagnostics,
            dispatcher: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    fn dispatcher_slot(&self) -> MutexGuard<'_, Option<DispatcherHandle>> {
        self.dispatcher.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to the response channel and start dispatching.
    ///
    /// `on_unrecoverable` fires once if the subscription ends; by then every
    /// pending request has been rejected with `Disconnected`. A bridge whose
    /// subscription ended may be started again; a shut down bridge may not.
    pub fn start<F>(&self, on_unrecoverable: F) -> BridgeResult<()>
    where
        F: FnOnce(DispatchError) + Send + 'static,
    {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BridgeError::disconnected("bridge shut down"));
        }

        let mut slot = self.dispatcher_slot();
        if slot.as_ref().is_some_and(|handle| !handle.is_terminated()) {
            return Err(BridgeError::AlreadyStarted);
        }

        let subscription = self
            .transport
            .subscribe(&self.config.response_channel)
            .map_err(BridgeError::Subscribe)?;

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.correlator),
            self.handlers.clone(),
            Arc::clone(&self.diagnostics),
        );
        *slot = Some(dispatcher.start(subscription, on_unrecoverable));

        info!(
            target: LOG_TARGET,
            "Bridge started: requests -> {}, responses <- {}",
            self.config.request_channel,
            self.config.response_channel
        );
        Ok(())
    }

    /// Publish a request for `path` and return its completion handle.
    ///
    /// The pending entry is registered before publishing, so even an
    /// immediate response is correlated. If encoding or publishing fails, or
    /// the returned future is dropped before publishing completes, the entry
    /// is withdrawn; nothing stays pending.
    ///
    /// Fails with `Disconnected` without publishing once the bridge is shut
    /// down or its response subscription has ended.
    pub async fn send_request(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> BridgeResult<ResponseHandle> {
        let timeout = options.timeout.unwrap_or(self.config.default_timeout);
        let (id, handle) = self.correlator.issue(timeout);
        let guard = PendingGuard::new(&self.correlator, id);

        // Checked after issuing: a disconnect that lands later fails the entry.
        if let Some(reason) = self.disconnect_reason() {
            return Err(BridgeError::disconnected(reason));
        }

        let payload = Request::new(id, path, &options)
            .to_bytes()
            .map_err(BridgeError::Encode)?;

        if let Err(source) = publish_bounded(
            self.transport.as_ref(),
            &self.config.request_channel,
            &id.to_string(),
            payload,
            self.config.publish_timeout,
        )
        .await
        {
            drop(guard);
            self.diagnostics.record(Event::PublishFailure);
            warn!(
                target: LOG_TARGET,
                "Failed to publish request {} for {}: {}",
                id,
                path,
                source
            );
            return Err(BridgeError::Publish { id, source });
        }

        guard.disarm();
        debug!(target: LOG_TARGET, "Published request {} for {}", id, path);
        Ok(handle)
    }

    /// Why no response can arrive any more, if that is the case.
    fn disconnect_reason(&self) -> Option<String> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Some("bridge shut down".to_string());
        }
        self.dispatcher_slot()
            .as_ref()
            .filter(|handle| handle.is_terminated())
            .map(|_| format!("subscription to {} closed", self.config.response_channel))
    }

    /// Send a request and wait for its payload.
    pub async fn request(&self, path: &str, options: RequestOptions) -> BridgeResult<Value> {
        self.send_request(path, options).await?.await
    }

    /// Request `path` as JSON and return the decoded `state` of the response.
    ///
    /// `Content-Type` and `Accept` default to `application/json`; headers in
    /// `options` take precedence. A string `state` is parsed as JSON, any
    /// other non-null value is returned as-is, and a missing or null `state`
    /// yields `None`.
    pub async fn fetch_data(
        &self,
        path: &str,
        mut options: RequestOptions,
    ) -> BridgeResult<Option<Value>> {
        for (name, value) in JSON_HEADERS {
            options
                .headers
                .entry(name.to_string())
                .or_insert_with(|| value.to_string());
        }

        let payload = self.request(path, options).await?;
        decode_state(payload)
    }

    /// Register the handler for broadcasts of type `kind`, replacing any
    /// previous one. Returns `true` if a handler was replaced.
    ///
    /// Handlers run one at a time off the dispatch loop, in arrival order.
    /// A slow handler delays later broadcasts but never replies.
    pub fn register_response_handler<F>(&self, kind: impl Into<String>, handler: F) -> bool
    where
        F: Fn(Broadcast) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handlers.register(kind, handler)
    }

    pub fn unregister_response_handler(&self, kind: &str) -> bool {
        self.handlers.unregister(kind)
    }

    /// Cancel a pending request. Returns `false` if it already completed.
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        self.correlator.cancel(id)
    }

    /// Ids of requests still awaiting a response.
    pub fn pending_requests(&self) -> Vec<CorrelationId> {
        self.correlator.pending_ids()
    }

    pub fn pending_count(&self) -> usize {
        self.correlator.pending_count()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Forward every dispatch error (decode, handler, transport) to `sink`.
    pub fn set_diagnostic_sink(&self, sink: DiagnosticSink) {
        self.diagnostics.set_sink(sink);
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Whether responses are currently being dispatched.
    ///
    /// False before `start`, after `shutdown`, and once the response
    /// subscription has ended.
    pub fn is_started(&self) -> bool {
        self.dispatcher_slot()
            .as_ref()
            .is_some_and(|handle| !handle.is_terminated())
    }

    /// Stop dispatching and reject every pending request with `Disconnected`.
    ///
    /// The bridge cannot be restarted afterwards. Returns the number of
    /// requests rejected.
    pub fn shutdown(&self) -> usize {
        let was_shut_down = self.shut_down.swap(true, Ordering::SeqCst);
        let dispatcher = self.dispatcher_slot().take();
        drop(dispatcher);

        let failed = self.correlator.fail_all("bridge shut down");
        if !was_shut_down {
            info!(
                target: LOG_TARGET,
                "Bridge shut down, {} pending requests rejected",
                failed
            );
        }
        failed
    }
}

impl<T: Transport> Drop for Bridge<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Extract and decode `state` from a response payload.
fn decode_state(mut payload: Value) -> BridgeResult<Option<Value>> {
    match payload.get_mut("state").map(Value::take) {
        Some(Value::String(raw)) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(BridgeError::InvalidState),
        None | Some(Value::Null) => Ok(None),
        Some(state) => Ok(Some(state)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Response;
    use crate::transport::MemoryTransport;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn decode_state_parses_string_state() {
        let state = decode_state(json!({"state": "{\"user\":\"ada\"}"})).unwrap();
        assert_eq!(state, Some(json!({"user": "ada"})));
    }

    #[test]
    fn decode_state_passes_objects_through() {
        let state = decode_state(json!({"state": {"user": "ada"}})).unwrap();
        assert_eq!(state, Some(json!({"user": "ada"})));
    }

    #[test]
    fn decode_state_treats_missing_and_null_as_none() {
        assert_eq!(decode_state(json!({"html": "<p/>"})).unwrap(), None);
        assert_eq!(decode_state(json!({"state": null})).unwrap(), None);
        assert_eq!(decode_state(json!("not an object")).unwrap(), None);
    }

    #[test]
    fn decode_state_rejects_invalid_json_string() {
        assert!(matches!(
            decode_state(json!({"state": "{oops"})),
            Err(BridgeError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let bridge = Bridge::new(MemoryTransport::new(8), BridgeConfig::default());

        bridge.start(|_| {}).unwrap();
        assert!(matches!(bridge.start(|_| {}), Err(BridgeError::AlreadyStarted)));
        assert!(bridge.is_started());
    }

    #[tokio::test]
    async fn start_reports_subscribe_failure() {
        let transport = MemoryTransport::new(8);
        let config = BridgeConfig::default();
        let _taken = transport.subscribe(&config.response_channel).unwrap();

        let bridge = Bridge::new(transport, config);
        assert!(matches!(
            bridge.start(|_| {}),
            Err(BridgeError::Subscribe(_))
        ));
        assert!(!bridge.is_started());
    }

    #[tokio::test]
    async fn send_request_publishes_envelope_keyed_by_id() {
        let transport = MemoryTransport::new(8);
        let config = BridgeConfig::default();
        let mut requests = transport.subscribe(&config.request_channel).unwrap();
        let bridge = Bridge::new(transport, config);

        let handle = bridge
            .send_request("/about", RequestOptions::new().method("POST"))
            .await
            .unwrap();

        let message = requests.next().await.unwrap().unwrap();
        let request = Request::from_slice(&message.payload).unwrap();
        assert_eq!(request.id, handle.id());
        assert_eq!(request.path, "/about");
        assert_eq!(request.method, "POST");
        assert_eq!(message.key, Some(handle.id().to_string()));
        assert_eq!(bridge.pending_requests(), vec![handle.id()]);
    }

    #[tokio::test]
    async fn publish_failure_rolls_back_pending_entry() {
        let transport = MemoryTransport::new(8);
        transport.set_fail_publishes(true);
        let bridge = Bridge::new(transport, BridgeConfig::default());

        let err = bridge
            .send_request("/about", RequestOptions::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::Publish { .. }));
        assert_eq!(bridge.pending_count(), 0);
        assert_eq!(bridge.diagnostics().publish_failures, 1);
    }

    #[tokio::test]
    async fn fetch_data_sends_json_headers_unless_overridden() {
        let transport = MemoryTransport::new(8);
        let config = BridgeConfig::default();
        let mut requests = transport.subscribe(&config.request_channel).unwrap();
        let bridge = Arc::new(Bridge::new(transport.clone(), config.clone()));
        bridge.start(|_| {}).unwrap();

        let caller = Arc::clone(&bridge);
        let fetch = tokio::spawn(async move {
            caller
                .fetch_data("/api/user", RequestOptions::new().header("Accept", "text/plain"))
                .await
        });

        let message = requests.next().await.unwrap().unwrap();
        let request = Request::from_slice(&message.payload).unwrap();
        assert_eq!(request.headers["Content-Type"], "application/json");
        assert_eq!(request.headers["Accept"], "text/plain");

        let reply = Response::reply(request.id, json!({"state": "{\"name\":\"ada\"}"}));
        transport
            .publish(&config.response_channel, "k", reply.to_bytes().unwrap())
            .await
            .unwrap();

        let state = fetch.await.unwrap().unwrap();
        assert_eq!(state, Some(json!({"name": "ada"})));
    }

    #[tokio::test]
    async fn shutdown_rejects_pending_with_disconnected() {
        let bridge = Bridge::new(MemoryTransport::new(8), BridgeConfig::default());
        bridge.start(|_| {}).unwrap();

        let handle = bridge
            .send_request(
                "/slow",
                RequestOptions::new().timeout(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        assert_eq!(bridge.shutdown(), 1);
        assert!(!bridge.is_started());
        assert!(matches!(handle.await, Err(BridgeError::Disconnected { .. })));
    }

    #[tokio::test]
    async fn send_request_fails_fast_after_subscription_closes() {
        let transport = MemoryTransport::new(8);
        let config = BridgeConfig::default();
        let bridge = Bridge::new(transport.clone(), config.clone());
        let (tx, rx) = tokio::sync::oneshot::channel();
        bridge
            .start(move |_| {
                let _ = tx.send(());
            })
            .unwrap();

        transport.close(&config.response_channel);
        rx.await.unwrap();

        assert!(!bridge.is_started());
        match bridge.send_request("/about", RequestOptions::new()).await {
            Err(BridgeError::Disconnected { reason }) => {
                assert!(reason.contains(&config.response_channel))
            }
            other => panic!("expected disconnect, got {other:?}"),
        }
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn shut_down_bridge_rejects_requests_and_restart() {
        let bridge = Bridge::new(MemoryTransport::new(8), BridgeConfig::default());
        bridge.start(|_| {}).unwrap();
        bridge.shutdown();

        assert!(matches!(
            bridge.send_request("/about", RequestOptions::new()).await,
            Err(BridgeError::Disconnected { .. })
        ));
        assert!(matches!(
            bridge.start(|_| {}),
            Err(BridgeError::Disconnected { .. })
        ));
        assert_eq!(bridge.pending_count(), 0);
    }

    struct StalledTransport;

    impl Transport for StalledTransport {
        async fn publish(
            &self,
            _: &str,
            _: &str,
            _: Vec<u8>,
        ) -> Result<(), crate::error::TransportError> {
            std::future::pending().await
        }

        fn subscribe(
            &self,
            channel: &str,
        ) -> Result<crate::transport::Subscription, crate::error::TransportError> {
            Err(crate::error::TransportError::ChannelClosed {
                channel: channel.to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_send_request_future_withdraws_entry() {
        let bridge = Bridge::new(StalledTransport, BridgeConfig::default());

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            bridge.send_request("/about", RequestOptions::new()),
        )
        .await;

        assert!(abandoned.is_err(), "publish should still be in flight");
        assert_eq!(bridge.pending_count(), 0);
        assert_eq!(bridge.diagnostics().publish_failures, 0);
    }

    #[tokio::test]
    async fn cancel_by_id_rejects_handle() {
        let bridge = Bridge::new(MemoryTransport::new(8), BridgeConfig::default());
        let handle = bridge
            .send_request("/about", RequestOptions::new())
            .await
            .unwrap();

        assert!(bridge.cancel(&handle.id()));
        assert!(matches!(handle.await, Err(BridgeError::Cancelled { .. })));
        assert_eq!(bridge.diagnostics().cancelled, 1);
    }
}
