// [[MISSION-RELAY]]/apps/relay-server/src/client/manager.rs
// Purpose: Client connection manager. Keeps one channel to the relay alive across
//          failures, visibility changes and unload.
// Architecture: Client Transport Layer
// Dependencies: tokio-tungstenite, tokio (watch, Notify), rand

use chrono::Utc;
use futures::{FutureExt, Sink, SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::client::backoff::Backoff;
use crate::client::lifecycle::{Lifecycle, Visibility};
use crate::config::ClientConfig;
use crate::diagnostics::{DiagnosticKind, DiagnosticsLog, Side, CLOSE_NORMAL};
use crate::envelope::{Envelope, EventType, Severity, EVENT_SCHEMA_VERSION};
use crate::observability::Telemetry;
use crate::safety::encode_frame;

const CLOSE_GRACE: Duration = Duration::from_secs(2);
/// A stale peer may never drain our writes.
const STALE_CLOSE_GRACE: Duration = Duration::from_millis(500);

/// What the dashboard shows about the link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay_ms: u64 },
    Suspended,
    /// Sustained outage; retries continue in the background.
    Disconnected { failures: u32 },
    Stopped,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Channel is open and has seen traffic recently
    Keep,
    Connect,
    Wait(Duration),
    Suspend,
    Stop,
}

/// Reconnect policy without any I/O, so the driver stays a thin shell.
pub struct ReconnectController<R = StdRng> {
    backoff: Backoff,
    rng: R,
    visibility: Visibility,
    health_window: Duration,
    disconnected_after: u32,
    failures: u32,
    open: bool,
    last_message: Option<Instant>,
    status: ConnectionStatus,
}

impl<R: Rng> ReconnectController<R> {
    pub fn new(config: &ClientConfig, rng: R) -> Self {
        Self {
            backoff: Backoff::new(config.backoff.clone()),
            rng,
            visibility: Visibility::Visible,
            health_window: config.health_window,
            disconnected_after: config.disconnected_after.max(1),
            failures: 0,
            open: false,
            last_message: None,
            status: ConnectionStatus::Connecting,
        }
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    /// Consecutive failures since the last successful open.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_healthy(&self, now: Instant) -> bool {
        self.open
            && self
                .last_message
                .map_or(false, |at| now.saturating_duration_since(at) <= self.health_window)
    }

    pub fn evaluate(&self, now: Instant) -> Decision {
        match self.visibility {
            Visibility::Unloaded => Decision::Stop,
            Visibility::Hidden => Decision::Suspend,
            Visibility::Visible if self.is_healthy(now) => Decision::Keep,
            Visibility::Visible => Decision::Connect,
        }
    }

    pub fn on_connecting(&mut self) {
        if !matches!(self.status, ConnectionStatus::Disconnected { .. }) {
            self.status = ConnectionStatus::Connecting;
        }
    }

    /// Returns how many retries it took to get here.
    pub fn on_open(&mut self, now: Instant) -> u32 {
        let retries = self.failures;
        self.open = true;
        self.last_message = Some(now);
        self.failures = 0;
        self.backoff.reset();
        self.status = ConnectionStatus::Connected;
        retries
    }

    pub fn on_message(&mut self, now: Instant) {
        self.last_message = Some(now);
    }

    pub fn on_failure(&mut self) -> Decision {
        self.open = false;
        match self.visibility {
            Visibility::Unloaded => return self.on_unload(),
            Visibility::Hidden => return self.on_hidden(),
            Visibility::Visible => {}
        }

        self.failures = self.failures.saturating_add(1);
        let delay = self.backoff.next_delay(&mut self.rng);
        self.status = if self.failures >= self.disconnected_after {
            ConnectionStatus::Disconnected {
                failures: self.failures,
            }
        } else {
            ConnectionStatus::Reconnecting {
                attempt: self.failures,
                delay_ms: delay.as_millis() as u64,
            }
        };
        Decision::Wait(delay)
    }

    pub fn on_hidden(&mut self) -> Decision {
        if self.visibility == Visibility::Unloaded {
            return Decision::Stop;
        }
        self.visibility = Visibility::Hidden;
        self.open = false;
        self.status = ConnectionStatus::Suspended;
        Decision::Suspend
    }

    /// Skips whatever backoff was pending and checks health right away.
    pub fn on_visible(&mut self, now: Instant) -> Decision {
        if self.visibility == Visibility::Unloaded {
            return Decision::Stop;
        }
        self.visibility = Visibility::Visible;
        self.evaluate(now)
    }

    pub fn on_unload(&mut self) -> Decision {
        self.visibility = Visibility::Unloaded;
        self.open = false;
        self.status = ConnectionStatus::Stopped;
        Decision::Stop
    }
}

/// Coalescing "make sure we're connected" trigger. Many calls before the
/// manager wakes count as one, and calls made while an attempt is in flight
/// are satisfied by that attempt. During a backoff wait a call skips the
/// remaining delay.
#[derive(Clone)]
pub struct ReconnectHandle(Arc<Notify>);

impl ReconnectHandle {
    pub fn reconnect_now(&self) {
        self.0.notify_one();
    }
}

enum SessionEnd {
    Failed,
    Hidden,
    Unloaded,
}

pub struct ConnectionManager {
    config: ClientConfig,
    lifecycle: Arc<Lifecycle>,
    telemetry: Arc<Telemetry>,
    diagnostics: Arc<DiagnosticsLog>,
    status: watch::Sender<ConnectionStatus>,
    wake: Arc<Notify>,
    events: mpsc::UnboundedSender<Envelope>,
}

impl ConnectionManager {
    /// Content envelopes arrive on the returned receiver in transport order.
    pub fn new(config: ClientConfig, lifecycle: Arc<Lifecycle>) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let diagnostics = Arc::new(DiagnosticsLog::new(Side::Client, config.diagnostics_capacity));
        let manager = Self {
            config,
            lifecycle,
            telemetry: Arc::new(Telemetry::new()),
            diagnostics,
            status,
            wake: Arc::new(Notify::new()),
            events,
        };
        (manager, rx)
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn reconnect_handle(&self) -> ReconnectHandle {
        ReconnectHandle(self.wake.clone())
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    pub fn diagnostics(&self) -> Arc<DiagnosticsLog> {
        self.diagnostics.clone()
    }

    /// Drive the channel until the host unloads or the event receiver is dropped.
    pub async fn run(self) {
        let mut lifecycle = self.lifecycle.subscribe();
        let mut controller = ReconnectController::new(&self.config, StdRng::from_entropy());

        let mut decision = match *lifecycle.borrow_and_update() {
            Visibility::Visible => controller.evaluate(Instant::now()),
            Visibility::Hidden => controller.on_hidden(),
            Visibility::Unloaded => controller.on_unload(),
        };

        loop {
            self.publish(&controller);
            decision = match decision {
                Decision::Stop => break,
                Decision::Keep | Decision::Connect => self.attempt(&mut controller, &mut lifecycle).await,
                Decision::Wait(delay) => self.wait(delay, &mut controller, &mut lifecycle).await,
                Decision::Suspend => self.suspended(&mut controller, &mut lifecycle).await,
            };
        }

        self.publish(&controller);
        tracing::info!(page_id = %self.config.page_id, "Connection manager stopped");
    }

    fn publish<R: Rng>(&self, controller: &ReconnectController<R>) {
        let next = controller.status().clone();
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::debug!(page_id = %self.config.page_id, "Status {:?} -> {:?}", current, next);
            *current = next;
            true
        });
    }

    fn page(&self) -> Option<&str> {
        Some(self.config.page_id.as_str())
    }

    fn on_lifecycle<R: Rng>(
        &self,
        changed: Result<(), watch::error::RecvError>,
        lifecycle: &mut watch::Receiver<Visibility>,
        controller: &mut ReconnectController<R>,
    ) -> Decision {
        let next = match changed {
            Ok(()) => *lifecycle.borrow_and_update(),
            Err(_) => Visibility::Unloaded,
        };
        match next {
            Visibility::Visible => {
                if controller.visibility() == Visibility::Hidden {
                    self.diagnostics.record(self.page(), DiagnosticKind::Resumed);
                }
                controller.on_visible(Instant::now())
            }
            Visibility::Hidden => controller.on_hidden(),
            Visibility::Unloaded => controller.on_unload(),
        }
    }

    async fn attempt<R: Rng>(
        &self,
        controller: &mut ReconnectController<R>,
        lifecycle: &mut watch::Receiver<Visibility>,
    ) -> Decision {
        controller.on_connecting();
        self.publish(controller);

        let outcome = tokio::select! {
            result = tokio::time::timeout(self.config.connect_timeout, connect_async(self.config.url.as_str())) => result,
            changed = lifecycle.changed() => {
                // Abandon the half-open attempt
                return self.on_lifecycle(changed, lifecycle, controller);
            }
        };

        let decision = match outcome {
            Ok(Ok((socket, _response))) => {
                let retries = controller.on_open(Instant::now());
                self.telemetry.record_connect();
                self.diagnostics.record(self.page(), DiagnosticKind::Connect);
                self.publish(controller);
                tracing::info!(url = %self.config.url, retries, "Connected to relay");

                match self.drive(socket, retries, controller, lifecycle).await {
                    SessionEnd::Failed => controller.on_failure(),
                    SessionEnd::Hidden => controller.on_hidden(),
                    SessionEnd::Unloaded => controller.on_unload(),
                }
            }
            Ok(Err(e)) => {
                self.diagnostics.record(
                    self.page(),
                    DiagnosticKind::Error {
                        message: format!("connect failed: {}", e),
                    },
                );
                controller.on_failure()
            }
            Err(_) => {
                self.diagnostics.record(
                    self.page(),
                    DiagnosticKind::Error {
                        message: format!("connect timed out after {:?}", self.config.connect_timeout),
                    },
                );
                controller.on_failure()
            }
        };

        // Requests made during this attempt were answered by it
        self.drain_wake();
        decision
    }

    fn drain_wake(&self) {
        if self.wake.notified().now_or_never().is_some() {
            tracing::debug!(page_id = %self.config.page_id, "Reconnect request merged into finished attempt");
        }
    }

    async fn wait<R: Rng>(
        &self,
        delay: Duration,
        controller: &mut ReconnectController<R>,
        lifecycle: &mut watch::Receiver<Visibility>,
    ) -> Decision {
        self.telemetry.record_reconnect_attempt();
        self.diagnostics.record(
            self.page(),
            DiagnosticKind::Reconnect {
                attempt: controller.failures(),
                delay_ms: delay.as_millis() as u64,
            },
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => Decision::Connect,
            _ = self.wake.notified() => {
                tracing::debug!("Reconnect requested; skipping remaining backoff");
                Decision::Connect
            }
            changed = lifecycle.changed() => self.on_lifecycle(changed, lifecycle, controller),
        }
    }

    async fn suspended<R: Rng>(
        &self,
        controller: &mut ReconnectController<R>,
        lifecycle: &mut watch::Receiver<Visibility>,
    ) -> Decision {
        self.diagnostics.record(self.page(), DiagnosticKind::Suspended);
        loop {
            let changed = lifecycle.changed().await;
            let decision = self.on_lifecycle(changed, lifecycle, controller);
            if decision != Decision::Suspend {
                return decision;
            }
        }
    }

    async fn drive<S, R>(
        &self,
        socket: S,
        retries: u32,
        controller: &mut ReconnectController<R>,
        lifecycle: &mut watch::Receiver<Visibility>,
    ) -> SessionEnd
    where
        S: Sink<Message, Error = WsError> + futures::Stream<Item = Result<Message, WsError>> + Unpin,
        R: Rng,
    {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let page_id = self.config.page_id.as_str();

        let ready = Envelope::control(EventType::ClientReady, page_id)
            .with_field("page_id", json!(page_id))
            .with_field("reconnect_attempts", json!(retries))
            .with_field("schema_version", json!(EVENT_SCHEMA_VERSION));
        if let Err(e) = send_envelope(&mut ws_tx, &ready).await {
            self.diagnostics.record(self.page(), DiagnosticKind::Error { message: e.to_string() });
            return SessionEnd::Failed;
        }
        self.diagnostics.record(self.page(), DiagnosticKind::Ready);

        let ping_every = self.config.ping_interval;
        let mut ping = interval_at(Instant::now() + ping_every, ping_every);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let check_every = (self.config.health_window / 2).max(Duration::from_millis(50));
        let mut health = interval_at(Instant::now() + check_every, check_every);
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        controller.on_message(Instant::now());
                        if !self.handle_frame(&mut ws_tx, &text).await {
                            self.close_gracefully(&mut ws_tx, "observer gone", CLOSE_GRACE).await;
                            return SessionEnd::Unloaded;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((1005, String::new()));
                        self.diagnostics.record(self.page(), DiagnosticKind::Close { code, reason });
                        return SessionEnd::Failed;
                    }
                    Some(Ok(_)) => controller.on_message(Instant::now()),
                    Some(Err(e)) => {
                        self.diagnostics.record(self.page(), DiagnosticKind::Error { message: e.to_string() });
                        return SessionEnd::Failed;
                    }
                    None => {
                        self.diagnostics.record(
                            self.page(),
                            DiagnosticKind::Close { code: 1006, reason: "stream ended".to_string() },
                        );
                        return SessionEnd::Failed;
                    }
                },
                _ = ping.tick() => {
                    let ping_frame = Envelope::control(EventType::Ping, page_id)
                        .with_field("sent_at", json!(Utc::now().timestamp_millis()));
                    self.diagnostics.record(self.page(), DiagnosticKind::Ping);
                    if let Err(e) = send_envelope(&mut ws_tx, &ping_frame).await {
                        self.diagnostics.record(self.page(), DiagnosticKind::Error { message: e.to_string() });
                        return SessionEnd::Failed;
                    }
                }
                _ = health.tick() => {
                    if controller.evaluate(Instant::now()) == Decision::Connect {
                        self.diagnostics.record(
                            self.page(),
                            DiagnosticKind::Error { message: "no traffic within health window".to_string() },
                        );
                        self.close_gracefully(&mut ws_tx, "stale", STALE_CLOSE_GRACE).await;
                        return SessionEnd::Failed;
                    }
                }
                _ = self.wake.notified() => {
                    if controller.evaluate(Instant::now()) != Decision::Keep {
                        self.close_gracefully(&mut ws_tx, "stale", STALE_CLOSE_GRACE).await;
                        return SessionEnd::Failed;
                    }
                    tracing::debug!(page_id, "Channel healthy; reconnect request ignored");
                }
                changed = lifecycle.changed() => {
                    let next = match changed {
                        Ok(()) => *lifecycle.borrow_and_update(),
                        Err(_) => Visibility::Unloaded,
                    };
                    match next {
                        Visibility::Visible => {}
                        Visibility::Hidden => {
                            self.close_gracefully(&mut ws_tx, "hidden", CLOSE_GRACE).await;
                            return SessionEnd::Hidden;
                        }
                        Visibility::Unloaded => {
                            self.close_gracefully(&mut ws_tx, "unload", CLOSE_GRACE).await;
                            return SessionEnd::Unloaded;
                        }
                    }
                }
            }
        }
    }

    /// Returns false once nobody is listening for envelopes.
    async fn handle_frame<S>(&self, ws_tx: &mut S, text: &str) -> bool
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        match Envelope::decode(text) {
            Ok(envelope) if envelope.event_type.is_control() => {
                self.handle_control(&envelope);
                true
            }
            Ok(envelope) => self.events.send(envelope).is_ok(),
            Err(e) => {
                // Discard the frame, keep the channel
                self.telemetry.record_parse_error();
                self.diagnostics.record(self.page(), DiagnosticKind::ParseError { message: e.to_string() });
                let reply = Envelope::control(EventType::ParseError, self.config.page_id.as_str())
                    .with_severity(Severity::Warning)
                    .with_field("error", json!(e.to_string()));
                if let Err(e) = send_envelope(ws_tx, &reply).await {
                    tracing::debug!(error = %e, "Could not report parse error to relay");
                }
                true
            }
        }
    }

    fn handle_control(&self, envelope: &Envelope) {
        match envelope.event_type {
            EventType::Pong => {
                self.diagnostics.record(self.page(), DiagnosticKind::Pong);
                if let Some(sent_at) = envelope.payload.get("sent_at").and_then(Value::as_i64) {
                    let rtt_ms = Utc::now().timestamp_millis() - sent_at;
                    tracing::debug!(rtt_ms, "Pong");
                }
            }
            EventType::ParseError => {
                let message = envelope
                    .payload
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified");
                self.diagnostics.record(
                    self.page(),
                    DiagnosticKind::ParseError {
                        message: format!("relay could not parse a frame: {}", message),
                    },
                );
            }
            EventType::SerializationIssueDetected => {
                self.diagnostics.record(
                    self.page(),
                    DiagnosticKind::SerializationIssue {
                        detail: Value::Object(envelope.payload.clone()).to_string(),
                    },
                );
            }
            _ => tracing::trace!(event_type = %envelope.event_type, "Control envelope"),
        }
    }

    /// Tell the relay we are leaving on purpose, then send close 1000.
    async fn close_gracefully<S>(&self, ws_tx: &mut S, reason: &str, grace: Duration)
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        let goodbye = Envelope::control(EventType::ClientDisconnect, self.config.page_id.as_str())
            .with_field("reason", json!(reason));
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_string().into(),
        };
        let result = tokio::time::timeout(grace, async move {
            send_envelope(ws_tx, &goodbye).await?;
            ws_tx.send(Message::Close(Some(frame))).await
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Close handshake failed"),
            Err(_) => tracing::debug!("Close handshake timed out"),
        }
        self.diagnostics.record(
            self.page(),
            DiagnosticKind::Close {
                code: CLOSE_NORMAL,
                reason: reason.to_string(),
            },
        );
    }
}

async fn send_envelope<S>(sink: &mut S, envelope: &Envelope) -> Result<(), WsError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let frame = encode_frame(envelope);
    sink.send(Message::Text(frame.text.to_string())).await
}
