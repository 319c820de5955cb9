use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

use crate::envelope::Envelope;

#[derive(Error, Debug, PartialEq)]
pub enum PatchError {
    #[error("Mission payload carries no id")]
    MissingId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MissionStatus {
    Pending,
    Planning,
    Running,
    Healing,
    Completed,
    Failed,
    Cancelled,
}

impl MissionStatus {
    /// Position along the lifecycle. Running and healing share a tier so the
    /// self-repair cycle can repeat.
    fn tier(self) -> u8 {
        match self {
            MissionStatus::Pending => 0,
            MissionStatus::Planning => 1,
            MissionStatus::Running | MissionStatus::Healing => 2,
            MissionStatus::Completed | MissionStatus::Failed | MissionStatus::Cancelled => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.tier() == 3
    }

    pub fn is_active(self) -> bool {
        matches!(self, MissionStatus::Running | MissionStatus::Healing)
    }

    /// Forward moves only, plus `running <-> healing`. Terminal states are final.
    pub fn can_transition_to(self, next: MissionStatus) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if self.tier() == 2 && next.tier() == 2 {
            return true;
        }
        next.tier() > self.tier()
    }

    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_value(Value::String(raw.to_ascii_lowercase())).ok()
    }

    /// Wire name, as serialized.
    pub fn as_str(self) -> &'static str {
        match self {
            MissionStatus::Pending => "pending",
            MissionStatus::Planning => "planning",
            MissionStatus::Running => "running",
            MissionStatus::Healing => "healing",
            MissionStatus::Completed => "completed",
            MissionStatus::Failed => "failed",
            MissionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: String,
    pub status: MissionStatus,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub events: Vec<Envelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<Value>,
    /// Fields the engine sends that this layer does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    /// Fingerprints of `events`; rebuilt lazily after deserialization.
    #[serde(skip)]
    seen: HashSet<u64>,
}

// `seen` is derived from `events`, so it takes no part in equality.
impl PartialEq for Mission {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.status == other.status
            && self.progress == other.progress
            && self.created_at == other.created_at
            && self.completed_at == other.completed_at
            && self.events == other.events
            && self.workspace == other.workspace
            && self.extra == other.extra
    }
}

/// Partial mission. `None` means "not present in this message".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MissionPatch {
    pub id: String,
    pub status: Option<MissionStatus>,
    pub progress: Option<u8>,
    pub created_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub events: Option<Vec<Envelope>>,
    pub workspace: Option<Value>,
    pub extra: Map<String, Value>,
}

/// What a merge did to the stored mission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub changed: bool,
    pub status_rejected: bool,
    pub events_changed: bool,
}

fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn parse_progress(value: &Value) -> Option<u8> {
    value.as_f64().map(|p| p.clamp(0.0, 100.0).round() as u8)
}

impl MissionPatch {
    /// Read a patch from an envelope payload. Accepts both a flat payload and
    /// one wrapping the mission under `"mission"`.
    pub fn from_payload(payload: &Map<String, Value>) -> Result<Self, PatchError> {
        let (fields, outer_id) = match payload.get("mission").and_then(Value::as_object) {
            Some(inner) => (inner, payload.get("mission_id")),
            None => (payload, None),
        };

        let id = fields
            .get("id")
            .or_else(|| fields.get("mission_id"))
            .or(outer_id)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or(PatchError::MissingId)?
            .to_string();

        let mut patch = MissionPatch {
            id,
            ..Default::default()
        };

        for (key, value) in fields {
            match key.as_str() {
                "id" | "mission_id" => {}
                "status" => {
                    patch.status = value.as_str().and_then(MissionStatus::parse);
                    if patch.status.is_none() {
                        tracing::warn!("Ignoring unrecognised mission status {}", value);
                    }
                }
                "progress" => patch.progress = parse_progress(value),
                "created_at" => patch.created_at = parse_time(value),
                "completed_at" => patch.completed_at = parse_time(value),
                "workspace" => {
                    if !value.is_null() {
                        patch.workspace = Some(value.clone());
                    }
                }
                "events" => {
                    if let Some(items) = value.as_array() {
                        patch.events = Some(
                            items
                                .iter()
                                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                                .collect(),
                        );
                    }
                }
                _ => {
                    patch.extra.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(patch)
    }
}

impl From<Mission> for MissionPatch {
    fn from(mission: Mission) -> Self {
        MissionPatch {
            id: mission.id,
            status: Some(mission.status),
            progress: Some(mission.progress),
            created_at: Some(mission.created_at),
            completed_at: mission.completed_at,
            events: Some(mission.events),
            workspace: mission.workspace,
            extra: mission.extra,
        }
    }
}

impl Mission {
    pub fn from_patch(patch: MissionPatch, now: DateTime<Utc>) -> Self {
        let mut mission = Mission {
            id: patch.id.clone(),
            status: MissionStatus::Pending,
            progress: 0,
            created_at: patch.created_at.unwrap_or(now),
            completed_at: None,
            events: Vec::new(),
            workspace: None,
            extra: Map::new(),
            seen: HashSet::new(),
        };
        mission.merge(patch);
        mission
    }

    /// Shallow last-write-wins merge of the fields present in `patch`, subject
    /// to the status graph and to progress never going backwards while active.
    pub fn merge(&mut self, patch: MissionPatch) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        if let Some(status) = patch.status {
            if self.status.can_transition_to(status) {
                if self.status != status {
                    self.status = status;
                    outcome.changed = true;
                }
            } else {
                tracing::debug!(
                    mission_id = %self.id,
                    "Ignoring stale status {:?} -> {:?}",
                    self.status,
                    status
                );
                outcome.status_rejected = true;
            }
        }

        if let Some(progress) = patch.progress {
            // a late progress report must not rewind an active or finished mission
            let next = if self.status.is_active() || self.status.is_terminal() {
                progress.max(self.progress)
            } else {
                progress
            };
            if next != self.progress {
                self.progress = next;
                outcome.changed = true;
            }
        }

        if let Some(created_at) = patch.created_at {
            if created_at != self.created_at {
                self.created_at = created_at;
                outcome.changed = true;
            }
        }

        if let Some(completed_at) = patch.completed_at {
            if self.completed_at != Some(completed_at) {
                self.completed_at = Some(completed_at);
                outcome.changed = true;
            }
        }

        if let Some(workspace) = patch.workspace {
            if self.workspace.as_ref() != Some(&workspace) {
                self.workspace = Some(workspace);
                outcome.changed = true;
            }
        }

        for (key, value) in patch.extra {
            if self.extra.get(&key) != Some(&value) {
                self.extra.insert(key, value);
                outcome.changed = true;
            }
        }

        if let Some(events) = patch.events {
            for event in events {
                if self.push_event(event) {
                    outcome.events_changed = true;
                }
            }
        }

        outcome.changed |= outcome.events_changed;
        outcome
    }

    /// Append unless an identical envelope is already recorded.
    pub fn push_event(&mut self, event: Envelope) -> bool {
        if self.seen.len() != self.events.len() {
            self.seen = self.events.iter().map(Envelope::fingerprint).collect();
        }
        if !self.seen.insert(event.fingerprint()) {
            return false;
        }
        self.events.push(event);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patch(value: Value) -> MissionPatch {
        MissionPatch::from_payload(value.as_object().unwrap()).unwrap()
    }

    #[test]
    fn test_progress_patch_keeps_status() {
        let mut mission = Mission::from_patch(
            patch(json!({"id": "m1", "status": "running", "progress": 40})),
            Utc::now(),
        );
        mission.merge(patch(json!({"id": "m1", "progress": 65})));

        assert_eq!(mission.id, "m1");
        assert_eq!(mission.status, MissionStatus::Running);
        assert_eq!(mission.progress, 65);
    }

    #[test]
    fn test_progress_does_not_regress_while_active() {
        let mut mission = Mission::from_patch(
            patch(json!({"id": "m1", "status": "healing", "progress": 70})),
            Utc::now(),
        );
        let outcome = mission.merge(patch(json!({"id": "m1", "progress": 50})));
        assert!(!outcome.changed);
        assert_eq!(mission.progress, 70);
    }

    #[test]
    fn test_status_graph() {
        use MissionStatus::*;
        assert!(Running.can_transition_to(Healing));
        assert!(Healing.can_transition_to(Running));
        assert!(Pending.can_transition_to(Running));
        assert!(Planning.can_transition_to(Cancelled));
        assert!(!Running.can_transition_to(Planning));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn test_status_names_match_wire_format() {
        use MissionStatus::*;
        for status in [Pending, Planning, Running, Healing, Completed, Failed, Cancelled] {
            assert_eq!(serde_json::to_value(status).unwrap(), json!(status.as_str()));
            assert_eq!(MissionStatus::parse(&status.to_string()), Some(status));
        }
    }

    #[test]
    fn test_terminal_status_is_final() {
        let mut mission = Mission::from_patch(
            patch(json!({"id": "m1", "status": "completed", "progress": 100})),
            Utc::now(),
        );
        let outcome = mission.merge(patch(json!({"id": "m1", "status": "running"})));
        assert!(outcome.status_rejected);
        assert_eq!(mission.status, MissionStatus::Completed);
    }

    #[test]
    fn test_nested_payload_and_extra_fields() {
        let p = patch(json!({
            "mission": {"id": "m2", "status": "PLANNING", "title": "Index repo", "progress": 130.4}
        }));
        assert_eq!(p.id, "m2");
        assert_eq!(p.status, Some(MissionStatus::Planning));
        assert_eq!(p.progress, Some(100));
        assert_eq!(p.extra["title"], "Index repo");
    }

    #[test]
    fn test_missing_id_is_rejected() {
        let payload = json!({"progress": 5});
        assert_eq!(
            MissionPatch::from_payload(payload.as_object().unwrap()),
            Err(PatchError::MissingId)
        );
    }

    #[test]
    fn test_merge_is_idempotent() {
        let p = patch(json!({"id": "m3", "status": "running", "progress": 10, "title": "x"}));
        let mut once = Mission::from_patch(p.clone(), Utc::now());
        let mut twice = once.clone();
        once.merge(p.clone());
        twice.merge(p.clone());
        let outcome = twice.merge(p);
        assert!(!outcome.changed);
        assert_eq!(once, twice);
    }

    fn step(n: usize) -> Envelope {
        Envelope::new(crate::envelope::EventType::AgentAction, "engine", Map::new())
            .with_field("mission_id", json!("m4"))
            .with_field("step", json!(n))
    }

    #[test]
    fn test_long_event_history_still_dedups() {
        let mut mission = Mission::from_patch(patch(json!({"id": "m4", "status": "running"})), Utc::now());
        let history: Vec<Envelope> = (0..5000).map(step).collect();
        for event in &history {
            assert!(mission.push_event(event.clone()));
        }
        assert!(!mission.push_event(history[2500].clone()));
        assert_eq!(mission.events.len(), 5000);
    }

    #[test]
    fn test_deserialized_mission_dedups_known_events() {
        let mut mission = Mission::from_patch(patch(json!({"id": "m4", "status": "running"})), Utc::now());
        mission.push_event(step(1));
        mission.push_event(step(2));

        let mut restored: Mission = serde_json::from_value(serde_json::to_value(&mission).unwrap()).unwrap();
        assert_eq!(restored, mission);
        assert!(!restored.push_event(step(2)));
        assert!(restored.push_event(step(3)));
        assert_eq!(restored.events.len(), 3);
    }
}
