//! Serving side of the bridge.
//!
//! A `Responder` consumes the request channel, runs a `RequestHandler` for
//! each request in its own task, and publishes the result on the response
//! channel keyed by the request id. It can also publish unsolicited typed
//! broadcasts.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::error::{HandlerError, TransportError};
use crate::protocol::{Request, Response};
use crate::transport::{Subscription, Transport, publish_bounded};

const LOG_TARGET: &str = "azofly_bridge::responder";

/// Produces the payload for one request.
///
/// An `Err` is sent back to the caller as the response `error`.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: Request)
    -> impl Future<Output = Result<Value, HandlerError>> + Send;
}

/// Adapts an async closure into a `RequestHandler`.
pub struct FnHandler<F>(F);

/// Build a handler from `|request| async move { ... }`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    FnHandler(f)
}

impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn handle(&self, request: Request) -> Result<Value, HandlerError> {
        (self.0)(request).await
    }
}

/// Answers every request with a small page describing it.
///
/// ```text
/// { "path", "method", "status": 200, "html": "<h1>/about</h1>",
///   "state": { "rendered": true, "path", "data": <request body> } }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl RequestHandler for EchoHandler {
    async fn handle(&self, request: Request) -> Result<Value, HandlerError> {
        Ok(json!({
            "path": request.path,
            "method": request.method,
            "status": 200,
            "html": format!("<h1>{}</h1>", escape_html(&request.path)),
            "state": {
                "rendered": true,
                "path": request.path,
                "data": request.body,
            },
        }))
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Consumes requests and publishes responses.
pub struct Responder<T: Transport, H: RequestHandler> {
    inner: Arc<ResponderInner<T, H>>,
}

struct ResponderInner<T, H> {
    transport: Arc<T>,
    handler: Arc<H>,
    request_channel: String,
    response_channel: String,
    publish_timeout: Duration,
}

impl<T: Transport, H: RequestHandler> Responder<T, H> {
    pub fn new(transport: Arc<T>, handler: H, config: &BridgeConfig) -> Self {
        Self {
            inner: Arc::new(ResponderInner {
                transport,
                handler: Arc::new(handler),
                request_channel: config.request_channel.clone(),
                response_channel: config.response_channel.clone(),
                publish_timeout: config.publish_timeout,
            }),
        }
    }

    /// Subscribe to the request channel and start serving.
    pub fn start(&self) -> Result<ResponderHandle, TransportError> {
        let subscription = self.inner.transport.subscribe(&self.inner.request_channel)?;
        let cancel_token = CancellationToken::new();
        let join_handle = tokio::spawn(serve_loop(
            Arc::clone(&self.inner),
            subscription,
            cancel_token.clone(),
        ));

        info!(
            target: LOG_TARGET,
            "Responder serving {} -> {}",
            self.inner.request_channel,
            self.inner.response_channel
        );
        Ok(ResponderHandle {
            join_handle,
            cancel_token,
        })
    }

    /// Publish an unsolicited broadcast of type `kind`.
    pub async fn broadcast(&self, kind: &str, payload: Value) -> Result<(), TransportError> {
        let message = Response::broadcast(kind, payload);
        let bytes = message
            .to_bytes()
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        self.inner.publish(kind, bytes).await
    }
}

impl<T: Transport, H: RequestHandler> ResponderInner<T, H> {
    async fn publish(&self, key: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        publish_bounded(
            self.transport.as_ref(),
            &self.response_channel,
            key,
            bytes,
            self.publish_timeout,
        )
        .await
    }
}

/// Handle to a running responder. Dropping it stops consuming requests;
/// requests already being served still get their response.
#[derive(Debug)]
pub struct ResponderHandle {
    join_handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

impl ResponderHandle {
    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }
}

impl Drop for ResponderHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn serve_loop<T: Transport, H: RequestHandler>(
    inner: Arc<ResponderInner<T, H>>,
    mut subscription: Subscription,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                debug!(target: LOG_TARGET, "Responder cancelled, shutting down");
                break;
            }

            delivery = subscription.next() => {
                match delivery {
                    Some(Ok(message)) => match Request::from_slice(&message.payload) {
                        Ok(request) => {
                            tokio::spawn(serve_one(Arc::clone(&inner), request));
                        }
                        Err(e) => {
                            warn!(target: LOG_TARGET, "Failed to decode request: {}", e);
                        }
                    },
                    Some(Err(e)) => {
                        warn!(target: LOG_TARGET, "Error on request channel: {}", e);
                    }
                    None => {
                        warn!(
                            target: LOG_TARGET,
                            "Request channel {} closed, responder stopping",
                            subscription.channel()
                        );
                        break;
                    }
                }
            }
        }
    }
}

async fn serve_one<T: Transport, H: RequestHandler>(inner: Arc<ResponderInner<T, H>>, request: Request) {
    let id = request.id;
    let path = request.path.clone();
    let handler = Arc::clone(&inner.handler);

    // Run the handler in its own task so a panic becomes an error response.
    let outcome = tokio::spawn(async move { handler.handle(request).await }).await;

    let response = match outcome {
        Ok(Ok(payload)) => Response::reply(id, payload),
        Ok(Err(e)) => {
            warn!(target: LOG_TARGET, "Handler failed for {} ({}): {}", path, id, e);
            Response::failure(id, Value::String(e.to_string()))
        }
        Err(e) => {
            warn!(target: LOG_TARGET, "Handler aborted for {} ({}): {}", path, id, e);
            Response::failure(id, Value::String("request handler panicked".to_string()))
        }
    };

    let bytes = match response.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(target: LOG_TARGET, "Failed to encode response {}: {}", id, e);
            return;
        }
    };

    if let Err(e) = inner.publish(&id.to_string(), bytes).await {
        warn!(target: LOG_TARGET, "Failed to publish response {}: {}", id, e);
    }
}
