// [[MISSION-RELAY]]/apps/relay-server/src/dispatch.rs
// Purpose: Event dispatcher. Routes decoded envelopes to typed store commands.
// Architecture: Client Model Layer
// Dependencies: Models, Envelope

use serde_json::Value;
use std::sync::Arc;

use crate::envelope::{Envelope, EventType, Route};
use crate::model::{Applied, Command, Mission, MissionPatch, MissionStatus, MissionStore, ModelSnapshot, StoreConfig};

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Applied(Applied),
    /// Control traffic; handled by the connection layer, not the model
    Control(EventType),
    /// Unknown event type, dropped
    Ignored(String),
    /// Known type whose payload could not be used
    Rejected(String),
}

/// Fill in what a lifecycle event implies when the producer left it out.
fn infer_lifecycle(event_type: &EventType, envelope: &Envelope, patch: &mut MissionPatch) {
    match event_type {
        EventType::MissionStarted => {
            patch.status.get_or_insert(MissionStatus::Running);
        }
        EventType::MissionCompleted => {
            patch.status.get_or_insert(MissionStatus::Completed);
            patch.progress.get_or_insert(100);
            patch.completed_at.get_or_insert(envelope.timestamp);
        }
        EventType::MissionError => {
            patch.status.get_or_insert(MissionStatus::Failed);
            patch.completed_at.get_or_insert(envelope.timestamp);
        }
        _ => {}
    }
}

/// Translate an envelope into the command it implies, without applying it.
pub fn route(envelope: &Envelope) -> Result<Option<Command>, String> {
    let command = match envelope.event_type.route() {
        Route::Mission => {
            let mut patch = MissionPatch::from_payload(&envelope.payload).map_err(|e| e.to_string())?;
            infer_lifecycle(&envelope.event_type, envelope, &mut patch);
            Command::UpsertMission {
                patch,
                envelope: envelope.clone(),
            }
        }
        Route::Insight => {
            let patch = MissionPatch::from_payload(&envelope.payload).map_err(|e| e.to_string())?;
            Command::PatchMission {
                patch,
                envelope: envelope.clone(),
            }
        }
        Route::AgentActivity => Command::RecordActivity(envelope.clone()),
        Route::SystemLog => Command::AppendLog(envelope.clone()),
        Route::LiveStream => Command::AppendLive(envelope.clone()),
        Route::Control | Route::Unknown => return Ok(None),
    };
    Ok(Some(command))
}

pub struct Dispatcher {
    store: MissionStore,
    unknown_types: u64,
    rejected: u64,
}

impl Dispatcher {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            store: MissionStore::new(config),
            unknown_types: 0,
            rejected: 0,
        }
    }

    pub fn dispatch(&mut self, envelope: Envelope) -> DispatchOutcome {
        match route(&envelope) {
            Ok(Some(command)) => DispatchOutcome::Applied(self.store.apply(command)),
            Ok(None) if envelope.event_type.is_control() => {
                tracing::debug!(event_type = %envelope.event_type, "Control envelope reached dispatcher");
                DispatchOutcome::Control(envelope.event_type)
            }
            Ok(None) => {
                self.unknown_types += 1;
                tracing::debug!(event_type = %envelope.event_type, source = %envelope.source, "Dropping unknown event type");
                DispatchOutcome::Ignored(envelope.event_type.to_string())
            }
            Err(reason) => {
                self.rejected += 1;
                tracing::warn!(event_type = %envelope.event_type, reason = %reason, "Rejected envelope");
                DispatchOutcome::Rejected(reason)
            }
        }
    }

    /// Seed the model from the persistence layer's snapshot.
    pub fn load(&mut self, missions: Vec<Mission>) -> Applied {
        self.store.apply(Command::BulkLoad(missions))
    }

    pub fn reset(&mut self) {
        self.store.apply(Command::Reset);
    }

    pub fn store(&self) -> &MissionStore {
        &self.store
    }

    pub fn sorted_events(&mut self, mission_id: &str) -> Option<Arc<[Envelope]>> {
        self.store.sorted_events(mission_id)
    }

    pub fn snapshot(&self) -> ModelSnapshot {
        self.store.snapshot()
    }

    pub fn unknown_types(&self) -> u64 {
        self.unknown_types
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

/// One-line summary of a mission for status output.
pub fn describe_mission(mission: &Mission) -> String {
    let title = mission
        .extra
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or("");
    format!(
        "{} [{} {}%] {}",
        mission.id, mission.status, mission.progress, title
    )
    .trim_end()
    .to_string()
}
