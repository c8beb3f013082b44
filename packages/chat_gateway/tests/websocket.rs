//! End-to-end over real sockets: HTTP listener, WebSocket sessions, shared broker.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite;

use chat_gateway::broker::MemoryBroker;
use chat_gateway::config::InstanceSettings;
use chat_gateway::retry::RetryPolicy;
use chat_gateway::{AppState, GatewayInstance, create_router};

type Client = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn serve(fleet: &MemoryBroker, origin: &str) -> (Arc<GatewayInstance>, SocketAddr) {
    let settings = InstanceSettings {
        origin: origin.to_string(),
        retry: RetryPolicy::none(),
        outbound_capacity: 64,
    };
    let instance = Arc::new(
        GatewayInstance::start(Arc::new(fleet.handle()), settings)
            .await
            .unwrap(),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(
        AppState {
            instance: instance.clone(),
            port: addr.port(),
        },
        axum::http::HeaderValue::from_static("http://localhost:3000"),
    );
    let closing = instance.closing_token();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(closing.cancelled_owned())
            .await
    });
    (instance, addr)
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    client
}

/// Next JSON text frame, skipping pings.
async fn next_frame(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        if let tungstenite::Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn next_event(client: &mut Client, event: &str) -> Value {
    loop {
        let frame = next_frame(client).await;
        if frame["event"] == event {
            return frame["data"].clone();
        }
    }
}

async fn wait_for_count(client: &mut Client, expected: &str) {
    loop {
        let data = next_event(client, "chat:connection-count-updated").await;
        if data["count"] == expected {
            return;
        }
    }
}

#[tokio::test]
async fn test_chat_over_two_instances() {
    let fleet = MemoryBroker::new();
    let (_a, addr_a) = serve(&fleet, "a").await;
    let (_b, addr_b) = serve(&fleet, "b").await;

    let mut alice = connect(addr_a).await;
    wait_for_count(&mut alice, "1").await;
    let mut bob = connect(addr_b).await;
    wait_for_count(&mut bob, "2").await;
    wait_for_count(&mut alice, "2").await;

    alice
        .send(tungstenite::Message::Text(
            r#"{"event":"chat:new-message","data":{"message":"hello"}}"#.into(),
        ))
        .await
        .unwrap();

    let echoed = next_event(&mut alice, "chat:new-message").await;
    let received = next_event(&mut bob, "chat:new-message").await;
    assert_eq!(echoed["message"], "hello");
    assert_eq!(received["message"], "hello");
    assert_eq!(echoed["origin"], "a");
    assert_eq!(received["origin"], "b");
    assert!(received["createdAt"].is_string());
    assert_ne!(echoed["id"], received["id"]);

    bob.close(None).await.unwrap();
    wait_for_count(&mut alice, "1").await;
}

#[tokio::test]
async fn test_invalid_frames_are_ignored() {
    let fleet = MemoryBroker::new();
    let (_a, addr) = serve(&fleet, "a").await;
    let mut client = connect(addr).await;
    wait_for_count(&mut client, "1").await;

    for frame in [
        "not json",
        r#"{"event":"chat:new-message","data":{"message":""}}"#,
        r#"{"event":"chat:typing","data":{}}"#,
    ] {
        client
            .send(tungstenite::Message::Text(frame.into()))
            .await
            .unwrap();
    }
    client
        .send(tungstenite::Message::Text(
            r#"{"event":"chat:new-message","data":{"message":"still here"}}"#.into(),
        ))
        .await
        .unwrap();

    // The session survives and the first message it sees is the valid one.
    let data = next_event(&mut client, "chat:new-message").await;
    assert_eq!(data["message"], "still here");
}

#[tokio::test]
async fn test_shutdown_closes_sessions_and_refuses_new_ones() {
    let fleet = MemoryBroker::new();
    let (instance, addr) = serve(&fleet, "a").await;
    let mut client = connect(addr).await;
    wait_for_count(&mut client, "1").await;

    let report = instance.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(report.drained, 1);
    assert_eq!(report.count, 0);

    // The socket ends without another decrement.
    let end = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(Ok(msg)) = client.next().await {
            if msg.is_close() {
                break;
            }
        }
    })
    .await;
    assert!(end.is_ok());
    assert!(tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.is_err());
}
