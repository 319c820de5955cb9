// [[MISSION-RELAY]]/apps/relay-server/src/diagnostics.rs
// Purpose: Bounded record of connection lifecycle events for post-hoc debugging.
// Architecture: Observability Layer
// Dependencies: parking_lot, Chrono, tracing

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::ring::RingBuffer;

/// Close code for a clean shutdown (navigation, cleanup, operator stop).
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Session never sent `client_ready` within the handshake window.
pub const CLOSE_HANDSHAKE_TIMEOUT: u16 = 4408;
/// No traffic within the liveness window.
pub const CLOSE_IDLE: u16 = 4410;
/// Outbound queue overflowed; the client was too slow.
pub const CLOSE_SLOW_CONSUMER: u16 = 4429;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Server,
    Client,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosticKind {
    Connect,
    Ready,
    Ping,
    Pong,
    Close { code: u16, reason: String },
    Error { message: String },
    ParseError { message: String },
    SerializationIssue { detail: String },
    HandshakeTimeout,
    Reconnect { attempt: u32, delay_ms: u64 },
    Suspended,
    Resumed,
}

impl DiagnosticKind {
    pub fn is_abnormal_close(&self) -> bool {
        matches!(self, DiagnosticKind::Close { code, .. } if *code != CLOSE_NORMAL && *code != CLOSE_GOING_AWAY)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticRecord {
    pub timestamp: DateTime<Utc>,
    pub side: Side,
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub kind: DiagnosticKind,
}

pub struct DiagnosticsLog {
    side: Side,
    records: Mutex<RingBuffer<DiagnosticRecord>>,
}

impl DiagnosticsLog {
    pub fn new(side: Side, capacity: usize) -> Self {
        Self {
            side,
            records: Mutex::new(RingBuffer::new(capacity)),
        }
    }

    /// Store the record and mirror it to tracing at a level matching its weight.
    pub fn record(&self, session_id: Option<&str>, kind: DiagnosticKind) {
        let session = session_id.unwrap_or("-");
        match &kind {
            DiagnosticKind::Ping | DiagnosticKind::Pong => {
                tracing::debug!(side = ?self.side, session_id = session, "{:?}", kind)
            }
            DiagnosticKind::Close { code, reason } if kind.is_abnormal_close() => {
                tracing::warn!(side = ?self.side, session_id = session, code, reason = %reason, "Abnormal close")
            }
            DiagnosticKind::Close { code, reason } => {
                tracing::info!(side = ?self.side, session_id = session, code, reason = %reason, "Closed")
            }
            DiagnosticKind::Error { message } | DiagnosticKind::ParseError { message } => {
                tracing::warn!(side = ?self.side, session_id = session, "{}", message)
            }
            DiagnosticKind::SerializationIssue { detail } => {
                tracing::warn!(side = ?self.side, session_id = session, detail = %detail, "Serialization issue")
            }
            other => tracing::info!(side = ?self.side, session_id = session, "{:?}", other),
        }

        self.records.lock().push(DiagnosticRecord {
            timestamp: Utc::now(),
            side: self.side,
            session_id: session_id.map(str::to_string),
            kind,
        });
    }

    /// Newest first, at most `limit` records.
    pub fn recent(&self, limit: usize) -> Vec<DiagnosticRecord> {
        self.records.lock().iter().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}
