// [[MISSION-RELAY]]/apps/relay-server/src/server/handlers.rs
// Purpose: HTTP + WebSocket handlers. One task per session plus one writer task.
// Architecture: API Layer
// Dependencies: Axum, Runtime

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Json, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::diagnostics::{DiagnosticKind, CLOSE_HANDSHAKE_TIMEOUT, CLOSE_NORMAL};
use crate::envelope::{Envelope, EventType, Severity, EVENT_SCHEMA_VERSION};
use crate::model::Mission;
use crate::runtime::RelayRuntime;
use crate::safety::SafePayload;
use crate::server::session::{ChannelSink, SessionState, TransportSession};

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    open_sessions: usize,
    sessions: usize,
}

#[derive(Deserialize)]
pub struct DiagnosticsQuery {
    limit: Option<usize>,
}

pub async fn health(State(runtime): State<Arc<RelayRuntime>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        open_sessions: runtime.registry.open_count(),
        sessions: runtime.registry.len(),
    })
}

/// Producer ingress for the mission engine.
pub async fn publish_event(
    State(runtime): State<Arc<RelayRuntime>>,
    Json(envelope): Json<Envelope>,
) -> (StatusCode, Json<Value>) {
    let event_type = envelope.event_type.to_string();
    let receivers = runtime.publish(envelope);
    tracing::debug!(event_type = %event_type, receivers, "Published event");
    (
        StatusCode::ACCEPTED,
        Json(json!({ "accepted": true, "event_type": event_type })),
    )
}

pub async fn list_missions(State(runtime): State<Arc<RelayRuntime>>) -> Json<Vec<Mission>> {
    Json(runtime.missions())
}

pub async fn get_diagnostics(
    State(runtime): State<Arc<RelayRuntime>>,
    Query(query): Query<DiagnosticsQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(100);
    Json(json!({
        "metrics": runtime.telemetry.snapshot(),
        "sessions": runtime.registry.describe(),
        "records": runtime.diagnostics.recent(limit),
    }))
}

pub async fn ws_events(
    State(runtime): State<Arc<RelayRuntime>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_event_stream(socket, runtime))
}

enum Flow {
    Continue,
    Close,
}

async fn handle_event_stream(socket: WebSocket, runtime: Arc<RelayRuntime>) {
    let session_id = Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (sink, mut outbound) = ChannelSink::new(runtime.config.outbound_queue);

    if !runtime.registry.register(TransportSession::new(session_id.clone(), sink.clone())) {
        tracing::error!(session_id = %session_id, "Session id collision");
        return;
    }

    // Writer: drains the queue until the registry closes the sink
    let writer_sink = sink.clone();
    let mut writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = writer_sink.closed() => {
                    let (code, reason) = writer_sink
                        .close_frame()
                        .unwrap_or((CLOSE_NORMAL, String::new()));
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                        .await;
                    break;
                }
                frame = outbound.recv() => match frame {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text.to_string())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    let handshake = tokio::time::sleep(runtime.config.handshake_timeout);
    tokio::pin!(handshake);
    let mut ready = false;
    let mut writer_done = false;
    let mut end = (CLOSE_NORMAL, "session ended".to_string());

    loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    runtime.registry.touch(&session_id);
                    match handle_inbound(&runtime, &session_id, &text) {
                        Flow::Continue => {}
                        Flow::Close => {
                            end = (CLOSE_NORMAL, "client disconnect".to_string());
                            break;
                        }
                    }
                    ready = ready || runtime.registry.state_of(&session_id) == Some(SessionState::Open);
                }
                Some(Ok(Message::Close(frame))) => {
                    end = frame
                        .map(|f| (f.code, f.reason.to_string()))
                        .unwrap_or((1005, "no close frame".to_string()));
                    break;
                }
                Some(Ok(_)) => runtime.registry.touch(&session_id),
                Some(Err(e)) => {
                    runtime.diagnostics.record(
                        Some(&session_id),
                        DiagnosticKind::Error { message: e.to_string() },
                    );
                    end = (1006, e.to_string());
                    break;
                }
                None => {
                    end = (1006, "stream ended".to_string());
                    break;
                }
            },
            _ = &mut handshake, if !ready => {
                if runtime.registry.expire_handshake(&session_id) {
                    end = (CLOSE_HANDSHAKE_TIMEOUT, "client_ready not received".to_string());
                    break;
                }
                ready = true;
            }
            _ = &mut writer, if !writer_done => {
                writer_done = true;
                end = writer_exit(&sink);
                break;
            }
        }
    }

    runtime.registry.unregister(&session_id, end.0, &end.1);
    drop(sink);
    if !writer_done {
        let _ = tokio::time::timeout(Duration::from_secs(2), writer).await;
    }
    tracing::info!(session_id = %session_id, "Event stream closed");
}

/// Why the writer stopped: a registry close carries its own frame, anything
/// else means the socket refused a write.
fn writer_exit(sink: &ChannelSink) -> (u16, String) {
    sink.close_frame().unwrap_or((1006, "write failed".to_string()))
}

/// Out-of-range counts saturate instead of wrapping.
fn reconnect_attempts(payload: &serde_json::Map<String, Value>) -> u32 {
    payload
        .get("reconnect_attempts")
        .and_then(Value::as_u64)
        .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX))
}

fn reply(runtime: &RelayRuntime, session_id: &str, envelope: Envelope) {
    let _ = runtime.registry.send_control(session_id, &envelope);
}

fn handle_inbound(runtime: &RelayRuntime, session_id: &str, text: &str) -> Flow {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            runtime.telemetry.record_parse_error();
            runtime.diagnostics.record(
                Some(session_id),
                DiagnosticKind::ParseError { message: e.to_string() },
            );
            reply(
                runtime,
                session_id,
                Envelope::control(EventType::ParseError, "relay")
                    .with_severity(Severity::Warning)
                    .with_field("error", json!(e.to_string())),
            );
            return Flow::Continue;
        }
    };

    match envelope.event_type {
        EventType::ClientReady => {
            let page_id = envelope
                .payload
                .get("page_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            let attempts = reconnect_attempts(&envelope.payload);
            let schema = envelope.payload.get("schema_version").and_then(Value::as_u64);
            if matches!(schema, Some(v) if v != u64::from(EVENT_SCHEMA_VERSION)) {
                tracing::warn!(session_id, ?schema, "Observer speaks a different event schema");
            }
            match runtime.registry.mark_ready(session_id, page_id, attempts) {
                Ok(()) => {
                    let state = runtime.registry.state_of(session_id).unwrap_or(SessionState::Closed);
                    let ack = SafePayload::new()
                        .field("session_id", session_id)
                        .state("state", &state)
                        .field("schema_version", &EVENT_SCHEMA_VERSION)
                        .build();
                    reply(runtime, session_id, Envelope::new(EventType::Heartbeat, "relay", ack));
                }
                Err(e) => tracing::warn!(session_id, error = %e, "Ignoring client_ready"),
            }
        }
        EventType::Ping => {
            runtime.diagnostics.record(Some(session_id), DiagnosticKind::Ping);
            let mut pong = Envelope::control(EventType::Pong, "relay");
            if let Some(sent_at) = envelope.payload.get("sent_at") {
                pong = pong.with_field("sent_at", sent_at.clone());
            }
            reply(runtime, session_id, pong);
        }
        EventType::Pong | EventType::Heartbeat => {}
        EventType::ClientDisconnect => {
            let reason = envelope
                .payload
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("client disconnect");
            tracing::info!(session_id, reason, "Client announced disconnect");
            if let Err(e) = runtime.registry.begin_close(session_id) {
                tracing::debug!(session_id, error = %e, "Disconnect outside OPEN");
            }
            return Flow::Close;
        }
        EventType::ParseError => {
            let message = envelope
                .payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unspecified")
                .to_string();
            runtime.diagnostics.record(
                Some(session_id),
                DiagnosticKind::ParseError { message: format!("client could not parse a frame: {message}") },
            );
        }
        EventType::SerializationIssueDetected => {
            runtime.diagnostics.record(
                Some(session_id),
                DiagnosticKind::SerializationIssue { detail: Value::Object(envelope.payload).to_string() },
            );
        }
        other => {
            tracing::debug!(session_id, event_type = %other, "Ignoring content envelope from observer");
        }
    }

    Flow::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::session::FrameSink;

    #[test]
    fn test_writer_exit_reports_registry_close_or_failed_write() {
        let (sink, _outbound) = ChannelSink::new(4);
        assert_eq!(writer_exit(&sink), (1006, "write failed".to_string()));

        sink.close(4429, "outbound queue full");
        assert_eq!(writer_exit(&sink), (4429, "outbound queue full".to_string()));
    }

    #[test]
    fn test_reconnect_attempts_saturate() {
        let payload = |v: Value| v.as_object().cloned().unwrap();
        assert_eq!(reconnect_attempts(&payload(json!({}))), 0);
        assert_eq!(reconnect_attempts(&payload(json!({"reconnect_attempts": 7}))), 7);
        assert_eq!(reconnect_attempts(&payload(json!({"reconnect_attempts": 4294967296u64}))), u32::MAX);
        assert_eq!(reconnect_attempts(&payload(json!({"reconnect_attempts": -1}))), 0);
    }
}
