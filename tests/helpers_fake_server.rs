//! Scripted rendering server on top of `MemoryTransport`.
//!
//! Tests drive the server by hand: read what the bridge published, then
//! answer in any order, late, twice, or not at all.

#![allow(dead_code)]

use azofly_bridge::{
    Bridge, BridgeConfig, CorrelationId, MemoryTransport, Request, Response, Subscription,
    Transport,
};
use serde_json::Value;

/// Consumes the request channel and publishes on the response channel.
pub struct FakeServer {
    transport: MemoryTransport,
    requests: Subscription,
    response_channel: String,
}

impl FakeServer {
    /// Attach to the request channel of `config` on `transport`.
    pub fn attach(transport: &MemoryTransport, config: &BridgeConfig) -> Self {
        let requests = transport
            .subscribe(&config.request_channel)
            .expect("request channel should be free");

        Self {
            transport: transport.clone(),
            requests,
            response_channel: config.response_channel.clone(),
        }
    }

    /// Wait for the next request the bridge published.
    pub async fn next_request(&mut self) -> Request {
        let message = self
            .requests
            .next()
            .await
            .expect("request channel closed")
            .expect("request delivery failed");
        Request::from_slice(&message.payload).expect("bridge published a malformed request")
    }

    pub async fn reply(&self, id: CorrelationId, payload: Value) {
        self.send(&Response::reply(id, payload)).await;
    }

    pub async fn fail(&self, id: CorrelationId, error: Value) {
        self.send(&Response::failure(id, error)).await;
    }

    pub async fn broadcast(&self, kind: &str, payload: Value) {
        self.send(&Response::broadcast(kind, payload)).await;
    }

    /// Publish arbitrary bytes on the response channel.
    pub async fn raw(&self, bytes: &[u8]) {
        self.transport
            .publish(&self.response_channel, "raw", bytes.to_vec())
            .await
            .expect("response channel should accept messages");
    }

    async fn send(&self, response: &Response) {
        self.raw(&response.to_bytes().expect("response should encode"))
            .await;
    }
}

/// A started bridge plus the fake server answering it.
pub fn started_bridge() -> (Bridge<MemoryTransport>, FakeServer, MemoryTransport) {
    let transport = MemoryTransport::new(256);
    let config = BridgeConfig::default();
    let server = FakeServer::attach(&transport, &config);

    let bridge = Bridge::new(transport.clone(), config);
    bridge.start(|_| {}).expect("bridge should start");

    (bridge, server, transport)
}
