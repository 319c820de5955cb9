// [[MISSION-RELAY]]/apps/relay-server/src/server/registry.rs
// Purpose: Connection registry and broadcaster. One bad session never stalls the rest.
// Architecture: Transport Layer
// Dependencies: DashMap, Serde, tokio

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::diagnostics::{
    DiagnosticKind, DiagnosticsLog, CLOSE_HANDSHAKE_TIMEOUT, CLOSE_IDLE, CLOSE_SLOW_CONSUMER,
};
use crate::observability::Telemetry;
use crate::safety::{encode_frame, SafePayload};
use crate::server::session::{DeliveryError, SessionError, SessionState, TransportSession};

/// Close code for a session whose socket is already gone.
const CLOSE_ABNORMAL: u16 = 1011;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: Vec<String>,
    pub degraded: bool,
}

pub struct ConnectionRegistry {
    sessions: DashMap<String, TransportSession>,
    telemetry: Arc<Telemetry>,
    diagnostics: Arc<DiagnosticsLog>,
}

impl ConnectionRegistry {
    pub fn new(telemetry: Arc<Telemetry>, diagnostics: Arc<DiagnosticsLog>) -> Self {
        Self {
            sessions: DashMap::new(),
            telemetry,
            diagnostics,
        }
    }

    /// Returns false if a session with this id is already registered.
    pub fn register(&self, session: TransportSession) -> bool {
        let id = session.id().to_string();
        match self.sessions.entry(id.clone()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(session);
            }
        }
        self.diagnostics.record(Some(&id), DiagnosticKind::Connect);
        true
    }

    /// Remove and close a session. Unknown ids are a no-op.
    pub fn unregister(&self, session_id: &str, code: u16, reason: &str) -> bool {
        // Removed before closing so no DashMap guard is held while the sink runs
        let Some((_, mut session)) = self.sessions.remove(session_id) else {
            return false;
        };
        session.force_close(code, reason);
        self.telemetry.record_disconnect();
        self.diagnostics.record(
            Some(session_id),
            DiagnosticKind::Close {
                code,
                reason: reason.to_string(),
            },
        );
        true
    }

    pub fn mark_ready(&self, session_id: &str, page_id: Option<String>, reconnect_attempts: u32) -> Result<(), SessionError> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.mark_ready(page_id, reconnect_attempts)?;
        session.touch(Instant::now());
        drop(session);

        self.telemetry.record_connect();
        self.diagnostics.record(Some(session_id), DiagnosticKind::Ready);
        Ok(())
    }

    pub fn begin_close(&self, session_id: &str) -> Result<(), SessionError> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.transition(SessionState::Closing)
    }

    pub fn touch(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.touch(Instant::now());
        }
    }

    pub fn state_of(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.get(session_id).map(|s| s.state())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn open_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.state() == SessionState::Open)
            .count()
    }

    /// Control reply to a single session, in any state but CLOSED.
    pub fn send_control<T: Serialize + ?Sized>(&self, session_id: &str, event: &T) -> Result<(), DeliveryError> {
        let frame = encode_frame(event);
        let result = match self.sessions.get(session_id) {
            Some(session) => session.send_control(frame.text),
            None => Err(DeliveryError::Disconnected),
        };
        if let Err(e) = &result {
            tracing::debug!(session_id, error = %e, "Control reply not delivered");
        }
        result
    }

    /// Encode once, then hand the frame to every OPEN session. Sessions that
    /// refuse it are unregistered after the sweep.
    pub fn broadcast<T: Serialize + ?Sized>(&self, event: &T) -> BroadcastReport {
        let frame = encode_frame(event);
        if let Some(issue) = &frame.issue {
            self.telemetry.record_degraded_encode();
            self.diagnostics.record(
                None,
                DiagnosticKind::SerializationIssue {
                    detail: issue.clone(),
                },
            );
        }

        let mut report = BroadcastReport {
            degraded: frame.is_degraded(),
            ..Default::default()
        };
        let mut failed: Vec<(String, DeliveryError)> = Vec::new();

        for session in self.sessions.iter() {
            match session.deliver(frame.text.clone()) {
                Ok(true) => report.delivered += 1,
                Ok(false) => {}
                Err(e) => failed.push((session.id().to_string(), e)),
            }
        }

        for (session_id, error) in failed {
            tracing::warn!(session_id = %session_id, error = %error, "Dropping session after failed delivery");
            let code = match error {
                DeliveryError::QueueFull => CLOSE_SLOW_CONSUMER,
                DeliveryError::Disconnected => CLOSE_ABNORMAL,
            };
            if self.unregister(&session_id, code, &error.to_string()) {
                self.telemetry.record_dropped_session();
            }
            report.dropped.push(session_id);
        }

        self.telemetry.record_broadcast(report.delivered);
        report
    }

    /// Tear down one session still waiting for `client_ready`.
    pub fn expire_handshake(&self, session_id: &str) -> bool {
        if self.state_of(session_id) != Some(SessionState::Connecting) {
            return false;
        }
        self.diagnostics.record(Some(session_id), DiagnosticKind::HandshakeTimeout);
        self.unregister(session_id, CLOSE_HANDSHAKE_TIMEOUT, "client_ready not received")
    }

    /// Unregister sessions that missed the handshake or went silent.
    pub fn reap(&self, now: Instant, liveness_window: Duration, handshake_timeout: Duration) -> Vec<String> {
        let mut expired = Vec::new();
        let mut idle = Vec::new();
        for session in self.sessions.iter() {
            if session.handshake_expired(now, handshake_timeout) {
                expired.push(session.id().to_string());
            } else if session.state() != SessionState::Connecting && session.idle_for(now) > liveness_window {
                idle.push(session.id().to_string());
            }
        }

        for id in &expired {
            self.diagnostics.record(Some(id), DiagnosticKind::HandshakeTimeout);
            self.unregister(id, CLOSE_HANDSHAKE_TIMEOUT, "client_ready not received");
        }
        for id in &idle {
            self.unregister(id, CLOSE_IDLE, "liveness window exceeded");
        }

        expired.into_iter().chain(idle).collect()
    }

    /// Close every session, e.g. on server shutdown.
    pub fn close_all(&self, code: u16, reason: &str) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|s| s.id().to_string()).collect();
        ids.iter()
            .filter(|id| self.unregister(id, code, reason))
            .count()
    }

    /// Per-session view for the diagnostics endpoint, built through the safety adapter.
    pub fn describe(&self) -> Vec<Map<String, Value>> {
        let now = Instant::now();
        self.sessions
            .iter()
            .map(|s| {
                SafePayload::new()
                    .field("session_id", s.id())
                    .state("state", &s.state())
                    .field("idle_ms", &(s.idle_for(now).as_millis() as u64))
                    .field("reconnect_attempts", &s.reconnect_attempts())
                    .field("page_id", &s.page_id())
                    .build()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Side;
    use crate::envelope::{Envelope, EventType};
    use crate::server::session::{ChannelSink, FrameSink};
    use parking_lot::Mutex;

    struct RecordingSink {
        frames: Mutex<Vec<Arc<str>>>,
        fail: bool,
    }

    impl RecordingSink {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    impl FrameSink for RecordingSink {
        fn deliver(&self, frame: Arc<str>) -> Result<(), DeliveryError> {
            if self.fail {
                return Err(DeliveryError::Disconnected);
            }
            self.frames.lock().push(frame);
            Ok(())
        }

        fn close(&self, _code: u16, _reason: &str) {}
    }

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(
            Arc::new(Telemetry::new()),
            Arc::new(DiagnosticsLog::new(Side::Server, 64)),
        )
    }

    fn open_session(registry: &ConnectionRegistry, id: &str, sink: Arc<dyn FrameSink>) {
        assert!(registry.register(TransportSession::new(id, sink)));
        registry.mark_ready(id, None, 0).unwrap();
    }

    #[tokio::test]
    async fn test_failed_session_does_not_block_others() {
        let registry = registry();
        let s1 = RecordingSink::new(false);
        let s2 = RecordingSink::new(true);
        let s3 = RecordingSink::new(false);
        open_session(&registry, "s1", s1.clone());
        open_session(&registry, "s2", s2.clone());
        open_session(&registry, "s3", s3.clone());

        let report = registry.broadcast(&Envelope::control(EventType::Heartbeat, "relay"));

        assert_eq!(report.delivered, 2);
        assert_eq!(report.dropped, vec!["s2".to_string()]);
        assert_eq!(s1.frames.lock().len(), 1);
        assert_eq!(s3.frames.lock().len(), 1);
        assert!(!registry.contains("s2"));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_register_and_unregister_are_idempotent() {
        let registry = registry();
        let sink = RecordingSink::new(false);
        assert!(registry.register(TransportSession::new("s1", sink.clone())));
        assert!(!registry.register(TransportSession::new("s1", sink)));
        assert!(registry.unregister("s1", 1000, "bye"));
        assert!(!registry.unregister("s1", 1000, "bye"));
        assert!(!registry.unregister("never-existed", 1000, "bye"));
    }

    #[tokio::test]
    async fn test_connecting_sessions_get_no_content() {
        let registry = registry();
        let sink = RecordingSink::new(false);
        registry.register(TransportSession::new("s1", sink.clone()));

        let report = registry.broadcast(&Envelope::control(EventType::Heartbeat, "relay"));
        assert_eq!(report.delivered, 0);
        assert!(sink.frames.lock().is_empty());
        assert!(registry.contains("s1"));
    }

    #[tokio::test]
    async fn test_slow_consumer_is_dropped() {
        let registry = registry();
        let (sink, _rx) = ChannelSink::new(1);
        open_session(&registry, "slow", sink.clone());

        let env = Envelope::control(EventType::Heartbeat, "relay");
        assert_eq!(registry.broadcast(&env).delivered, 1);
        let report = registry.broadcast(&env);
        assert_eq!(report.dropped, vec!["slow".to_string()]);
        assert_eq!(sink.close_frame().map(|(code, _)| code), Some(CLOSE_SLOW_CONSUMER));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_tears_down_session() {
        let registry = registry();
        let (sink, _rx) = ChannelSink::new(4);
        registry.register(TransportSession::new("late", sink.clone()));

        tokio::time::advance(Duration::from_secs(11)).await;
        let reaped = registry.reap(Instant::now(), Duration::from_secs(45), Duration::from_secs(10));

        assert_eq!(reaped, vec!["late".to_string()]);
        assert!(!registry.contains("late"));
        assert_eq!(sink.close_frame().map(|(code, _)| code), Some(CLOSE_HANDSHAKE_TIMEOUT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_open_session_is_reaped() {
        let registry = registry();
        let (busy, _rx1) = ChannelSink::new(4);
        let (quiet, _rx2) = ChannelSink::new(4);
        open_session(&registry, "busy", busy);
        open_session(&registry, "quiet", quiet);

        tokio::time::advance(Duration::from_secs(30)).await;
        registry.touch("busy");
        tokio::time::advance(Duration::from_secs(20)).await;

        let reaped = registry.reap(Instant::now(), Duration::from_secs(45), Duration::from_secs(10));
        assert_eq!(reaped, vec!["quiet".to_string()]);
        assert!(registry.contains("busy"));
    }

    #[tokio::test]
    async fn test_expire_handshake_spares_open_sessions() {
        let registry = registry();
        let (pending, _rx1) = ChannelSink::new(4);
        let (ready, _rx2) = ChannelSink::new(4);
        registry.register(TransportSession::new("pending", pending.clone()));
        open_session(&registry, "ready", ready);

        assert!(registry.expire_handshake("pending"));
        assert!(!registry.expire_handshake("ready"));
        assert!(!registry.expire_handshake("missing"));
        assert_eq!(pending.close_frame().map(|(code, _)| code), Some(CLOSE_HANDSHAKE_TIMEOUT));
        assert!(registry.contains("ready"));
    }

    #[tokio::test]
    async fn test_close_all_on_shutdown() {
        let registry = registry();
        let (a, _rx1) = ChannelSink::new(4);
        let (b, _rx2) = ChannelSink::new(4);
        open_session(&registry, "a", a.clone());
        registry.register(TransportSession::new("b", b.clone()));

        assert_eq!(registry.close_all(1001, "server shutdown"), 2);
        assert!(registry.is_empty());
        assert!(a.is_closed() && b.is_closed());
    }

    #[tokio::test]
    async fn test_describe_uses_state_names() {
        let registry = registry();
        registry.register(TransportSession::new("s1", RecordingSink::new(false)));
        let described = registry.describe();
        assert_eq!(described[0]["state"], "CONNECTING");
        assert_eq!(described[0]["page_id"], Value::Null);
    }

    #[tokio::test]
    async fn test_concurrent_register_admits_one_session() {
        let registry = registry();
        let diagnostics = registry.diagnostics.clone();
        let admitted: usize = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        let sink: Arc<dyn FrameSink> = RecordingSink::new(false);
                        registry.register(TransportSession::new("shared", sink))
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|worker| worker.join().unwrap())
                .filter(|ok| *ok)
                .count()
        });
        assert_eq!(admitted, 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(diagnostics.len(), 1);
    }
}
