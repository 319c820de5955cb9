use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use mission_relay::client::{
    ConnectionManager, ConnectionStatus, HttpMissionSource, Lifecycle, MissionSource,
};
use mission_relay::config::{BackoffConfig, ClientConfig, ServerConfig};
use mission_relay::diagnostics::CLOSE_HANDSHAKE_TIMEOUT;
use mission_relay::envelope::{Envelope, EventType, EVENT_SCHEMA_VERSION};
use mission_relay::model::MissionStatus;
use mission_relay::runtime::RelayRuntime;
use mission_relay::server;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start(config: ServerConfig) -> (Arc<RelayRuntime>, SocketAddr) {
    let runtime = RelayRuntime::new(config);
    runtime.spawn_background();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server::router(runtime.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (runtime, addr)
}

async fn next_envelope(ws: &mut Socket) -> Envelope {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            return Envelope::decode(&text).unwrap();
        }
    }
}

async fn send(ws: &mut Socket, envelope: &Envelope) {
    ws.send(Message::Text(serde_json::to_string(envelope).unwrap()))
        .await
        .unwrap();
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn mission_update(id: &str, status: &str, progress: u8) -> Envelope {
    Envelope::new(EventType::MissionUpdate, "engine", Default::default())
        .with_field("id", json!(id))
        .with_field("status", json!(status))
        .with_field("progress", json!(progress))
}

#[tokio::test]
async fn test_handshake_then_broadcast() {
    let (runtime, addr) = start(ServerConfig::default()).await;
    let (mut ws, _) = connect_async(format!("ws://{}/ws/events", addr)).await.unwrap();

    let ready = Envelope::control(EventType::ClientReady, "dash")
        .with_field("page_id", json!("dash"))
        .with_field("reconnect_attempts", json!(2));
    send(&mut ws, &ready).await;

    let ack = next_envelope(&mut ws).await;
    assert_eq!(ack.event_type, EventType::Heartbeat);
    assert_eq!(ack.payload["state"], "OPEN");
    assert_eq!(ack.payload["schema_version"], EVENT_SCHEMA_VERSION);
    assert_eq!(runtime.registry.open_count(), 1);

    runtime.publish(mission_update("m1", "running", 40));
    let received = next_envelope(&mut ws).await;
    assert_eq!(received.event_type, EventType::MissionUpdate);
    assert_eq!(received.mission_id(), Some("m1"));

    send(&mut ws, &Envelope::control(EventType::Ping, "dash").with_field("sent_at", json!(1234))).await;
    let pong = next_envelope(&mut ws).await;
    assert_eq!(pong.event_type, EventType::Pong);
    assert_eq!(pong.payload["sent_at"], 1234);

    ws.send(Message::Text("{not json".to_string())).await.unwrap();
    let complaint = next_envelope(&mut ws).await;
    assert_eq!(complaint.event_type, EventType::ParseError);
    // Channel survives a bad frame
    assert_eq!(runtime.registry.open_count(), 1);
    assert_eq!(runtime.telemetry.snapshot().parse_errors, 1);

    send(&mut ws, &Envelope::control(EventType::ClientDisconnect, "dash")).await;
    let registry = runtime.registry.clone();
    wait_for(move || registry.is_empty()).await;
}

#[tokio::test]
async fn test_silent_client_is_closed_after_handshake_window() {
    let (runtime, addr) = start(ServerConfig {
        handshake_timeout: Duration::from_millis(200),
        ..ServerConfig::default()
    })
    .await;
    let (mut ws, _) = connect_async(format!("ws://{}/ws/events", addr)).await.unwrap();

    let code = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(msg) = ws.next().await {
            if let Ok(Message::Close(Some(frame))) = msg {
                return Some(u16::from(frame.code));
            }
        }
        None
    })
    .await
    .unwrap();

    assert_eq!(code, Some(CLOSE_HANDSHAKE_TIMEOUT));
    assert!(runtime.registry.is_empty());
}

#[tokio::test]
async fn test_manager_follows_lifecycle_and_loads_snapshot() {
    let (runtime, addr) = start(ServerConfig::default()).await;
    runtime.publish(mission_update("m0", "planning", 5));

    let config = ClientConfig {
        url: format!("ws://{}/ws/events", addr),
        snapshot_url: Some(format!("http://{}/missions", addr)),
        page_id: "it".to_string(),
        backoff: BackoffConfig {
            base: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            ..BackoffConfig::default()
        },
        ..ClientConfig::default()
    };

    let source = HttpMissionSource::new(config.snapshot_url.clone().unwrap(), Duration::from_secs(5)).unwrap();
    let snapshot = source.load().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].status, MissionStatus::Planning);

    let lifecycle = Arc::new(Lifecycle::new());
    let (manager, mut events) = ConnectionManager::new(config, lifecycle.clone());
    let status = manager.status();
    let task = tokio::spawn(manager.run());

    let registry = runtime.registry.clone();
    wait_for(move || registry.open_count() == 1).await;
    assert!(status.borrow().is_connected());

    runtime.publish(mission_update("m1", "running", 40));
    let envelope = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.mission_id(), Some("m1"));

    // Hidden: clean close, no reconnect
    lifecycle.on_hidden();
    let registry = runtime.registry.clone();
    wait_for(move || registry.is_empty()).await;
    let watched = status.clone();
    wait_for(move || *watched.borrow() == ConnectionStatus::Suspended).await;

    // Visible: reconnects right away
    lifecycle.on_visible();
    let registry = runtime.registry.clone();
    wait_for(move || registry.open_count() == 1).await;

    lifecycle.on_unload();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert_eq!(*status.borrow(), ConnectionStatus::Stopped);
    let registry = runtime.registry.clone();
    wait_for(move || registry.is_empty()).await;
}
