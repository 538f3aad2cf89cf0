//! Request/response correlation over fire-and-forget publish/subscribe.
//!
//! A [`Bridge`] publishes requests on one channel and matches the responses
//! that come back on another, in any order and with any latency, to the
//! caller that is waiting for them. Messages on the response channel that
//! carry no request id are routed by `type` to registered handlers.

pub mod bridge;
pub mod config;
pub mod correlator;
pub mod diagnostics;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod responder;
pub mod transport;

pub use bridge::Bridge;
pub use config::{BridgeConfig, BridgeSettings};
pub use correlator::{Correlator, ResponseHandle};
pub use diagnostics::{DiagnosticSink, Diagnostics, DiagnosticsSnapshot};
pub use dispatcher::{Dispatched, Dispatcher, DispatcherHandle, HandlerTable};
pub use error::{BridgeError, BridgeResult, DispatchError, HandlerError, TransportError};
pub use protocol::{Broadcast, CorrelationId, Request, RequestOptions, Response};
pub use responder::{EchoHandler, RequestHandler, Responder, ResponderHandle, handler_fn};
#[cfg(feature = "kafka")]
pub use transport::KafkaTransport;
pub use transport::{InboundMessage, MemoryTransport, Subscription, Transport};
