// [[MISSION-RELAY]]/apps/relay-server/src/server/session.rs
// Purpose: Transport session state machine and its outbound seam.
// Architecture: Transport Layer
// Dependencies: tokio (mpsc, Instant), tokio-util (CancellationToken), thiserror

use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::safety::StateName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Connecting => "CONNECTING",
            SessionState::Open => "OPEN",
            SessionState::Closing => "CLOSING",
            SessionState::Closed => "CLOSED",
        }
    }

    /// CONNECTING -> OPEN -> CLOSING -> CLOSED, with a forced drop to CLOSED
    /// from anywhere but CLOSED itself.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Open) | (Open, Closing) | (Connecting, Closed) | (Open, Closed) | (Closing, Closed)
        )
    }
}

impl StateName for SessionState {
    fn state_name(&self) -> &'static str {
        self.as_str()
    }
}

impl Serialize for SessionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum SessionError {
    #[error("Invalid session transition {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
    #[error("Session not found: {0}")]
    NotFound(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("Outbound queue full")]
    QueueFull,
    #[error("Session disconnected")]
    Disconnected,
}

/// Where a session's frames go. The socket writer sits behind this.
pub trait FrameSink: Send + Sync {
    /// Must not block: either queue the frame or fail immediately.
    fn deliver(&self, frame: Arc<str>) -> Result<(), DeliveryError>;

    /// Ask the writer to send a close frame and stop.
    fn close(&self, code: u16, reason: &str);
}

/// `FrameSink` backed by a bounded queue drained by the session's writer task.
pub struct ChannelSink {
    tx: mpsc::Sender<Arc<str>>,
    closer: CancellationToken,
    close_frame: Mutex<Option<(u16, String)>>,
}

impl ChannelSink {
    pub fn new(bound: usize) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(bound.max(1));
        let sink = Arc::new(Self {
            tx,
            closer: CancellationToken::new(),
            close_frame: Mutex::new(None),
        });
        (sink, rx)
    }

    /// Resolves once `close` has been called.
    pub fn closed(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.closer.cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Code and reason recorded by the first `close` call.
    pub fn close_frame(&self) -> Option<(u16, String)> {
        self.close_frame.lock().clone()
    }
}

impl FrameSink for ChannelSink {
    fn deliver(&self, frame: Arc<str>) -> Result<(), DeliveryError> {
        if self.closer.is_cancelled() {
            return Err(DeliveryError::Disconnected);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Disconnected,
        })
    }

    fn close(&self, code: u16, reason: &str) {
        let mut frame = self.close_frame.lock();
        if frame.is_none() {
            *frame = Some((code, reason.to_string()));
        }
        self.closer.cancel();
    }
}

/// Server-side handle for one client connection.
pub struct TransportSession {
    id: String,
    state: SessionState,
    created_at: Instant,
    last_activity: Instant,
    reconnect_attempts: u32,
    page_id: Option<String>,
    sink: Arc<dyn FrameSink>,
}

impl TransportSession {
    pub fn new(id: impl Into<String>, sink: Arc<dyn FrameSink>) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            state: SessionState::Connecting,
            created_at: now,
            last_activity: now,
            reconnect_attempts: 0,
            page_id: None,
            sink,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn page_id(&self) -> Option<&str> {
        self.page_id.as_deref()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(session_id = %self.id, "Session {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Handshake acknowledged by `client_ready`.
    pub fn mark_ready(&mut self, page_id: Option<String>, reconnect_attempts: u32) -> Result<(), SessionError> {
        self.transition(SessionState::Open)?;
        self.page_id = page_id;
        self.reconnect_attempts = reconnect_attempts;
        Ok(())
    }

    /// Drop straight to CLOSED and tell the writer to hang up.
    pub fn force_close(&mut self, code: u16, reason: &str) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Closed;
            self.sink.close(code, reason);
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn handshake_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.state == SessionState::Connecting && now.saturating_duration_since(self.created_at) > timeout
    }

    /// Content only flows to OPEN sessions.
    pub fn deliver(&self, frame: Arc<str>) -> Result<bool, DeliveryError> {
        if self.state != SessionState::Open {
            return Ok(false);
        }
        self.sink.deliver(frame).map(|_| true)
    }

    /// Control replies go out in any state but CLOSED.
    pub fn send_control(&self, frame: Arc<str>) -> Result<(), DeliveryError> {
        if self.state == SessionState::Closed {
            return Err(DeliveryError::Disconnected);
        }
        self.sink.deliver(frame)
    }
}
