// [[MISSION-RELAY]]/apps/relay-server/src/envelope.rs
// Purpose: Wire envelope shared by the relay server, the observer and the mission engine.
// Architecture: Domain Event Layer
// Dependencies: Serde, Chrono, thiserror

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// Version of the event type vocabulary below. Bump when a variant is added.
pub const EVENT_SCHEMA_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Envelope is empty")]
    Empty,
}

/// Closed set of event types. Anything else decodes into `Unknown` so that a
/// newer producer never breaks an older observer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    // Mission snapshots and lifecycle
    MissionUpdate,
    MissionStarted,
    MissionProgress,
    MissionCompleted,
    MissionError,
    /// Partial mission patch (only the fields present are applied)
    MissionInsight,
    // Agent feed
    AgentActivity,
    AgentAction,
    Decision,
    ToolCall,
    SystemLog,
    LiveStream,
    // Control plane
    Heartbeat,
    Ping,
    Pong,
    ClientReady,
    ClientDisconnect,
    ParseError,
    SerializationIssueDetected,
    Unknown(String),
}

/// Handler class an event type is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Mission,
    Insight,
    AgentActivity,
    SystemLog,
    LiveStream,
    Control,
    Unknown,
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::MissionUpdate => "mission_update",
            EventType::MissionStarted => "mission_started",
            EventType::MissionProgress => "mission_progress",
            EventType::MissionCompleted => "mission_completed",
            EventType::MissionError => "mission_error",
            EventType::MissionInsight => "mission_insight",
            EventType::AgentActivity => "agent_activity",
            EventType::AgentAction => "agent_action",
            EventType::Decision => "decision",
            EventType::ToolCall => "tool_call",
            EventType::SystemLog => "system_log",
            EventType::LiveStream => "live_stream",
            EventType::Heartbeat => "heartbeat",
            EventType::Ping => "ping",
            EventType::Pong => "pong",
            EventType::ClientReady => "client_ready",
            EventType::ClientDisconnect => "client_disconnect",
            EventType::ParseError => "parse_error",
            EventType::SerializationIssueDetected => "serialization_issue_detected",
            EventType::Unknown(raw) => raw.as_str(),
        }
    }

    pub fn route(&self) -> Route {
        match self {
            EventType::MissionUpdate
            | EventType::MissionStarted
            | EventType::MissionProgress
            | EventType::MissionCompleted
            | EventType::MissionError => Route::Mission,
            EventType::MissionInsight => Route::Insight,
            EventType::AgentActivity
            | EventType::AgentAction
            | EventType::Decision
            | EventType::ToolCall => Route::AgentActivity,
            EventType::SystemLog => Route::SystemLog,
            EventType::LiveStream => Route::LiveStream,
            EventType::Heartbeat
            | EventType::Ping
            | EventType::Pong
            | EventType::ClientReady
            | EventType::ClientDisconnect
            | EventType::ParseError
            | EventType::SerializationIssueDetected => Route::Control,
            EventType::Unknown(_) => Route::Unknown,
        }
    }

    pub fn is_control(&self) -> bool {
        self.route() == Route::Control
    }
}

impl From<String> for EventType {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "mission_update" => EventType::MissionUpdate,
            "mission_started" => EventType::MissionStarted,
            "mission_progress" => EventType::MissionProgress,
            "mission_completed" => EventType::MissionCompleted,
            "mission_error" => EventType::MissionError,
            "mission_insight" => EventType::MissionInsight,
            "agent_activity" => EventType::AgentActivity,
            "agent_action" => EventType::AgentAction,
            "decision" => EventType::Decision,
            "tool_call" => EventType::ToolCall,
            "system_log" => EventType::SystemLog,
            "live_stream" => EventType::LiveStream,
            "heartbeat" => EventType::Heartbeat,
            "ping" => EventType::Ping,
            "pong" => EventType::Pong,
            "client_ready" => EventType::ClientReady,
            "client_disconnect" => EventType::ClientDisconnect,
            "parse_error" => EventType::ParseError,
            "serialization_issue_detected" => EventType::SerializationIssueDetected,
            _ => EventType::Unknown(raw),
        }
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        match event_type {
            EventType::Unknown(raw) => raw,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
    Success,
    Debug,
}

/// The unit exchanged over the duplex channel. Control messages reuse the same
/// shape with a reserved `event_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event_type: EventType,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    pub fn new(event_type: EventType, source: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            event_type,
            source: source.into(),
            severity: Severity::Info,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Control envelope with an empty payload.
    pub fn control(event_type: EventType, source: impl Into<String>) -> Self {
        Self::new(event_type, source, Map::new())
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        if text.trim().is_empty() {
            return Err(EnvelopeError::Empty);
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Mission this envelope refers to: `mission_id`, `id`, or `mission.id`.
    pub fn mission_id(&self) -> Option<&str> {
        self.payload
            .get("mission_id")
            .or_else(|| self.payload.get("id"))
            .or_else(|| self.payload.get("mission").and_then(|m| m.get("id")))
            .and_then(Value::as_str)
    }

    /// Content fingerprint used to recognise redelivered envelopes.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.event_type.as_str().hash(&mut hasher);
        self.source.hash(&mut hasher);
        self.timestamp.hash(&mut hasher);
        // serde_json maps are ordered, so this rendering is stable
        Value::Object(self.payload.clone()).to_string().hash(&mut hasher);
        hasher.finish()
    }
}
