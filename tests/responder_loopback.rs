//! Bridge and Responder wired together in one process.

use std::sync::Arc;
use std::time::Duration;

use azofly_bridge::{
    Bridge, BridgeConfig, BridgeError, EchoHandler, HandlerError, MemoryTransport, RequestOptions,
    Responder, handler_fn,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;

fn loopback_config() -> BridgeConfig {
    BridgeConfig {
        default_timeout: Duration::from_secs(5),
        ..BridgeConfig::default()
    }
}

#[tokio::test]
async fn echo_round_trip_returns_rendered_page() {
    let transport = Arc::new(MemoryTransport::new(32));
    let config = loopback_config();
    let responder = Responder::new(Arc::clone(&transport), EchoHandler, &config);
    let _serving = responder.start().unwrap();
    let bridge = Bridge::with_shared_transport(transport, config);
    bridge.start(|_| {}).unwrap();

    let page = bridge
        .request("/about", RequestOptions::new().body(json!({"lang": "en"})))
        .await
        .unwrap();

    assert_eq!(page["status"], 200);
    assert_eq!(page["method"], "GET");
    assert_eq!(page["html"], "<h1>/about</h1>");

    let state = bridge
        .fetch_data("/about", RequestOptions::new().body(json!({"lang": "en"})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state["rendered"], true);
    assert_eq!(state["data"], json!({"lang": "en"}));
}

#[tokio::test]
async fn handler_error_and_panic_reach_the_caller_as_remote_errors() {
    let transport = Arc::new(MemoryTransport::new(32));
    let config = loopback_config();
    let handler = handler_fn(|request: azofly_bridge::Request| async move {
        match request.path.as_str() {
            "/missing" => Err::<Value, HandlerError>("no template for /missing".into()),
            "/crash" => panic!("renderer crashed"),
            path => Ok(json!({ "path": path })),
        }
    });
    let responder = Responder::new(Arc::clone(&transport), handler, &config);
    let _serving = responder.start().unwrap();
    let bridge = Bridge::with_shared_transport(transport, config);
    bridge.start(|_| {}).unwrap();

    match bridge.request("/missing", RequestOptions::new()).await {
        Err(BridgeError::Remote { error, .. }) => {
            assert_eq!(error, json!("no template for /missing"))
        }
        other => panic!("expected remote error, got {other:?}"),
    }
    assert!(matches!(
        bridge.request("/crash", RequestOptions::new()).await,
        Err(BridgeError::Remote { .. })
    ));
    assert_eq!(
        bridge.request("/fine", RequestOptions::new()).await.unwrap(),
        json!({"path": "/fine"})
    );
}

#[tokio::test]
async fn responder_broadcast_reaches_bridge_handler() {
    let transport = Arc::new(MemoryTransport::new(32));
    let config = loopback_config();
    let responder = Responder::new(Arc::clone(&transport), EchoHandler, &config);
    let bridge = Bridge::with_shared_transport(transport, config);
    bridge.start(|_| {}).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    bridge.register_response_handler("nav-event", move |broadcast| {
        let _ = tx.send(broadcast.payload);
        Ok(())
    });

    responder
        .broadcast("nav-event", json!({"to": "/home"}))
        .await
        .unwrap();

    assert_eq!(rx.recv().await.unwrap(), json!({"to": "/home"}));
    assert_eq!(bridge.pending_count(), 0);
}
