// [[MISSION-RELAY]]/apps/relay-server/src/safety.rs
// Purpose: Serialization safety adapter. Everything handed to the transport passes through here once.
// Architecture: Broadcast Boundary
// Dependencies: Serde, serde_json, tracing

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::any::type_name;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::envelope::{Envelope, EventType, Severity};

/// Substituted when a value can neither be serialized nor formatted.
pub const PLACEHOLDER: &str = "<unencodable>";

/// Enum-like internal states that travel as their canonical name.
pub trait StateName {
    fn state_name(&self) -> &'static str;
}

pub fn encode_state<S: StateName + ?Sized>(state: &S) -> Value {
    Value::String(state.state_name().to_string())
}

/// Convert any value into JSON. Falls back to its `Debug` rendering, then to
/// `PLACEHOLDER`. Never panics.
pub fn encode<T: Serialize + fmt::Debug + ?Sized>(value: &T) -> Value {
    match catch_unwind(AssertUnwindSafe(|| serde_json::to_value(value))) {
        Ok(Ok(encoded)) => encoded,
        Ok(Err(e)) => {
            tracing::warn!(value_type = type_name::<T>(), error = %e, "Value is not encodable, coercing to string");
            coerce(value)
        }
        Err(_) => {
            tracing::warn!(value_type = type_name::<T>(), "Serializer panicked, coercing to string");
            coerce(value)
        }
    }
}

fn coerce<T: fmt::Debug + ?Sized>(value: &T) -> Value {
    match catch_unwind(AssertUnwindSafe(|| format!("{:?}", value))) {
        Ok(text) => Value::String(text),
        Err(_) => Value::String(PLACEHOLDER.to_string()),
    }
}

/// Builds an envelope payload field by field through `encode`.
#[derive(Debug, Default, Clone)]
pub struct SafePayload {
    fields: Map<String, Value>,
}

impl SafePayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field<T: Serialize + fmt::Debug + ?Sized>(mut self, key: &str, value: &T) -> Self {
        self.fields.insert(key.to_string(), encode(value));
        self
    }

    pub fn state<S: StateName + ?Sized>(mut self, key: &str, state: &S) -> Self {
        self.fields.insert(key.to_string(), encode_state(state));
        self
    }

    pub fn build(self) -> Map<String, Value> {
        self.fields
    }
}

/// A frame ready for every session. `issue` is set when the original event
/// had to be replaced.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub text: Arc<str>,
    pub issue: Option<String>,
}

impl EncodedFrame {
    pub fn is_degraded(&self) -> bool {
        self.issue.is_some()
    }
}

/// Serialize an outbound event exactly once. When that fails, the event is
/// replaced by a `serialization_issue_detected` envelope describing the failure.
pub fn encode_frame<T: Serialize + ?Sized>(event: &T) -> EncodedFrame {
    let outcome = catch_unwind(AssertUnwindSafe(|| serde_json::to_string(event)));
    let issue = match outcome {
        Ok(Ok(text)) => {
            return EncodedFrame {
                text: Arc::from(text),
                issue: None,
            }
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => "serializer panicked".to_string(),
    };

    tracing::warn!(event_type = type_name::<T>(), issue = %issue, "Substituting unencodable event");

    let substitute = Envelope::new(EventType::SerializationIssueDetected, "relay", Map::new())
        .with_severity(Severity::Warning)
        .with_field("error", Value::String(issue.clone()))
        .with_field("original_type", json!(type_name::<T>()));

    // Only plain strings left, this cannot fail; keep a literal fallback anyway.
    let text = serde_json::to_string(&substitute).unwrap_or_else(|_| {
        format!(
            r#"{{"event_type":"serialization_issue_detected","source":"relay","severity":"warning","timestamp":"{}","payload":{{}}}}"#,
            substitute.timestamp.to_rfc3339()
        )
    });

    EncodedFrame {
        text: Arc::from(text),
        issue: Some(issue),
    }
}
