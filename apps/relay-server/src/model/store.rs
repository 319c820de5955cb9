// [[MISSION-RELAY]]/apps/relay-server/src/model/store.rs
// Purpose: State reconciler. Sole owner of the mission/feed model; mutated only through `Command`.
// Architecture: Client Model Layer (also mirrored on the server for the bulk-load snapshot)
// Dependencies: Chrono, Serde

use chrono::Utc;
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::envelope::Envelope;
use crate::model::cache::EventViewCache;
use crate::model::mission::{Mission, MissionPatch};
use crate::ring::RingBuffer;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub activity_capacity: usize,
    pub log_capacity: usize,
    pub live_capacity: usize,
    /// How many envelope fingerprints are remembered for redelivery detection
    pub seen_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            activity_capacity: 200,
            log_capacity: 50,
            live_capacity: 200,
            seen_capacity: 4096,
        }
    }
}

/// Typed mutations. The dispatcher is the only producer of these.
#[derive(Debug, Clone)]
pub enum Command {
    /// Full mission snapshot or lifecycle event: merge, or insert if absent
    UpsertMission { patch: MissionPatch, envelope: Envelope },
    /// Partial patch: only present fields are applied
    PatchMission { patch: MissionPatch, envelope: Envelope },
    RecordActivity(Envelope),
    AppendLog(Envelope),
    AppendLive(Envelope),
    /// Initial load from the persistence layer
    BulkLoad(Vec<Mission>),
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Unchanged,
    /// Envelope was already applied earlier
    Duplicate,
}

/// Bounded memory of envelope fingerprints.
struct SeenSet {
    order: VecDeque<u64>,
    members: HashSet<u64>,
    capacity: usize,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// False if the fingerprint was already present.
    fn insert(&mut self, fingerprint: u64) -> bool {
        if !self.members.insert(fingerprint) {
            return false;
        }
        self.order.push_back(fingerprint);
        if self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.members.remove(&old);
            }
        }
        true
    }

    fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

/// Read-only projection handed to presentation code.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSnapshot {
    pub missions: Vec<Mission>,
    pub agent_activity: Vec<Envelope>,
    pub logs: BTreeMap<String, Vec<Envelope>>,
    pub live_stream: Vec<Envelope>,
}

pub struct MissionStore {
    config: StoreConfig,
    missions: HashMap<String, Mission>,
    agent_activity: RingBuffer<Envelope>,
    logs: HashMap<String, RingBuffer<Envelope>>,
    live_stream: RingBuffer<Envelope>,
    seen: SeenSet,
    views: EventViewCache,
}

impl MissionStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            agent_activity: RingBuffer::new(config.activity_capacity),
            live_stream: RingBuffer::new(config.live_capacity),
            seen: SeenSet::new(config.seen_capacity),
            missions: HashMap::new(),
            logs: HashMap::new(),
            views: EventViewCache::new(),
            config,
        }
    }

    pub fn apply(&mut self, command: Command) -> Applied {
        match command {
            Command::UpsertMission { patch, envelope } | Command::PatchMission { patch, envelope } => {
                if !self.seen.insert(envelope.fingerprint()) {
                    return Applied::Duplicate;
                }
                self.upsert(patch, Some(envelope))
            }
            Command::RecordActivity(envelope) => {
                if !self.seen.insert(envelope.fingerprint()) {
                    return Applied::Duplicate;
                }
                if let Some(mission) = envelope
                    .mission_id()
                    .and_then(|id| self.missions.get_mut(id))
                {
                    mission.push_event(envelope.clone());
                }
                self.agent_activity.push(envelope);
                Applied::Changed
            }
            Command::AppendLog(envelope) => {
                if !self.seen.insert(envelope.fingerprint()) {
                    return Applied::Duplicate;
                }
                let capacity = self.config.log_capacity;
                self.logs
                    .entry(envelope.source.clone())
                    .or_insert_with(|| RingBuffer::new(capacity))
                    .push(envelope);
                Applied::Changed
            }
            Command::AppendLive(envelope) => {
                if !self.seen.insert(envelope.fingerprint()) {
                    return Applied::Duplicate;
                }
                self.live_stream.push(envelope);
                Applied::Changed
            }
            Command::BulkLoad(missions) => {
                let mut changed = false;
                for mission in missions {
                    changed |= self.upsert(MissionPatch::from(mission), None) == Applied::Changed;
                }
                if changed {
                    Applied::Changed
                } else {
                    Applied::Unchanged
                }
            }
            Command::Reset => {
                self.missions.clear();
                self.agent_activity.clear();
                self.logs.clear();
                self.live_stream.clear();
                self.seen.clear();
                self.views.clear();
                Applied::Changed
            }
        }
    }

    fn upsert(&mut self, patch: MissionPatch, envelope: Option<Envelope>) -> Applied {
        let mut changed = false;
        let first_seen = envelope.as_ref().map(|e| e.timestamp).unwrap_or_else(Utc::now);
        let mission = match self.missions.entry(patch.id.clone()) {
            Entry::Occupied(entry) => {
                let existing = entry.into_mut();
                changed |= existing.merge(patch).changed;
                existing
            }
            Entry::Vacant(entry) => {
                tracing::debug!(mission_id = %entry.key(), "Tracking new mission");
                changed = true;
                entry.insert(Mission::from_patch(patch, first_seen))
            }
        };

        if let Some(envelope) = envelope {
            changed |= mission.push_event(envelope);
        }

        if changed {
            Applied::Changed
        } else {
            Applied::Unchanged
        }
    }

    pub fn mission(&self, id: &str) -> Option<&Mission> {
        self.missions.get(id)
    }

    /// Newest first by creation time.
    pub fn missions(&self) -> Vec<Mission> {
        let mut missions: Vec<Mission> = self.missions.values().cloned().collect();
        missions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        missions
    }

    pub fn mission_count(&self) -> usize {
        self.missions.len()
    }

    /// Mission events newest-first, memoized on the events' content hash.
    pub fn sorted_events(&mut self, mission_id: &str) -> Option<Arc<[Envelope]>> {
        let mission = self.missions.get(mission_id)?;
        Some(self.views.sorted(mission_id, &mission.events))
    }

    pub fn view_recomputes(&self) -> u64 {
        self.views.recomputes()
    }

    pub fn agent_activity(&self) -> &RingBuffer<Envelope> {
        &self.agent_activity
    }

    pub fn logs(&self, source: &str) -> Option<&RingBuffer<Envelope>> {
        self.logs.get(source)
    }

    pub fn live_stream(&self) -> &RingBuffer<Envelope> {
        &self.live_stream
    }

    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            missions: self.missions(),
            agent_activity: self.agent_activity.to_vec(),
            logs: self
                .logs
                .iter()
                .map(|(source, buffer)| (source.clone(), buffer.to_vec()))
                .collect(),
            live_stream: self.live_stream.to_vec(),
        }
    }
}

impl Default for MissionStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventType;
    use crate::model::mission::MissionStatus;
    use chrono::Duration;
    use serde_json::{json, Value};

    fn mission_envelope(event_type: EventType, payload: Value) -> (MissionPatch, Envelope) {
        let map = payload.as_object().unwrap().clone();
        let patch = MissionPatch::from_payload(&map).unwrap();
        (patch, Envelope::new(event_type, "engine", map))
    }

    fn upsert(store: &mut MissionStore, env: &(MissionPatch, Envelope)) -> Applied {
        store.apply(Command::UpsertMission {
            patch: env.0.clone(),
            envelope: env.1.clone(),
        })
    }

    fn log(source: &str, n: usize) -> Envelope {
        Envelope::new(EventType::SystemLog, source, serde_json::Map::new()).with_field("n", json!(n))
    }

    #[test]
    fn test_insight_patch_merges_into_existing() {
        let mut store = MissionStore::default();
        let a = mission_envelope(EventType::MissionUpdate, json!({"id": "m1", "status": "running", "progress": 40}));
        upsert(&mut store, &a);

        let (patch, envelope) = mission_envelope(EventType::MissionInsight, json!({"id": "m1", "progress": 65}));
        store.apply(Command::PatchMission { patch, envelope });

        let mission = store.mission("m1").unwrap();
        assert_eq!(mission.status, MissionStatus::Running);
        assert_eq!(mission.progress, 65);
        assert_eq!(mission.events.len(), 2);
    }

    #[test]
    fn test_same_envelope_twice_is_idempotent() {
        let mut once = MissionStore::default();
        let mut twice = MissionStore::default();
        let a = mission_envelope(EventType::MissionUpdate, json!({"id": "m1", "status": "planning"}));

        upsert(&mut once, &a);
        upsert(&mut twice, &a);
        assert_eq!(upsert(&mut twice, &a), Applied::Duplicate);

        assert_eq!(once.missions(), twice.missions());
    }

    #[test]
    fn test_redelivered_envelope_does_not_rewind_fields() {
        let a = mission_envelope(EventType::MissionUpdate, json!({"id": "m1", "status": "running", "title": "draft"}));
        let b = mission_envelope(EventType::MissionUpdate, json!({"id": "m1", "title": "final"}));

        let mut abs = MissionStore::default();
        upsert(&mut abs, &a);
        upsert(&mut abs, &b);

        let mut aba = MissionStore::default();
        upsert(&mut aba, &a);
        upsert(&mut aba, &b);
        upsert(&mut aba, &a);

        assert_eq!(abs.missions(), aba.missions());
        assert_eq!(aba.mission("m1").unwrap().extra["title"], "final");
    }

    #[test]
    fn test_log_buffers_are_per_source_and_bounded() {
        let mut store = MissionStore::default();
        for n in 1..=73 {
            store.apply(Command::AppendLog(log("planner", n)));
        }
        store.apply(Command::AppendLog(log("executor", 1)));

        let planner = store.logs("planner").unwrap();
        assert_eq!(planner.len(), 50);
        assert_eq!(planner.newest().unwrap().payload["n"], 73);
        assert_eq!(planner.oldest().unwrap().payload["n"], 24);
        assert_eq!(store.logs("executor").unwrap().len(), 1);
    }

    #[test]
    fn test_activity_is_attached_to_known_mission() {
        let mut store = MissionStore::default();
        upsert(&mut store, &mission_envelope(EventType::MissionStarted, json!({"id": "m1", "status": "running"})));

        let action = Envelope::new(EventType::ToolCall, "agent-7", serde_json::Map::new())
            .with_field("mission_id", json!("m1"))
            .with_field("tool", json!("grep"));
        store.apply(Command::RecordActivity(action));

        assert_eq!(store.agent_activity().len(), 1);
        assert_eq!(store.mission("m1").unwrap().events.len(), 2);
    }

    #[test]
    fn test_sorted_view_not_rebuilt_for_unrelated_change() {
        let mut store = MissionStore::default();
        upsert(&mut store, &mission_envelope(EventType::MissionStarted, json!({"id": "m1", "status": "running"})));
        store.sorted_events("m1").unwrap();
        assert_eq!(store.view_recomputes(), 1);

        // touches the live feed only
        store.apply(Command::AppendLive(Envelope::new(EventType::LiveStream, "engine", serde_json::Map::new())));
        store.sorted_events("m1").unwrap();
        assert_eq!(store.view_recomputes(), 1);

        let mut later = mission_envelope(EventType::MissionProgress, json!({"id": "m1", "progress": 10}));
        later.1.timestamp = later.1.timestamp + Duration::seconds(5);
        upsert(&mut store, &later);
        let view = store.sorted_events("m1").unwrap();
        assert_eq!(store.view_recomputes(), 2);
        assert_eq!(view[0].event_type, EventType::MissionProgress);
    }

    #[test]
    fn test_bulk_load_then_incremental() {
        let mut store = MissionStore::default();
        let seeded = Mission::from_patch(
            MissionPatch {
                id: "m9".into(),
                status: Some(MissionStatus::Running),
                progress: Some(20),
                ..Default::default()
            },
            Utc::now(),
        );
        assert_eq!(store.apply(Command::BulkLoad(vec![seeded.clone()])), Applied::Changed);
        assert_eq!(store.apply(Command::BulkLoad(vec![seeded])), Applied::Unchanged);

        upsert(&mut store, &mission_envelope(EventType::MissionCompleted, json!({"id": "m9", "status": "completed", "progress": 100})));
        assert_eq!(store.mission("m9").unwrap().status, MissionStatus::Completed);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut store = MissionStore::default();
        upsert(&mut store, &mission_envelope(EventType::MissionUpdate, json!({"id": "m1"})));
        store.apply(Command::AppendLog(log("planner", 1)));
        store.apply(Command::Reset);

        let snapshot = store.snapshot();
        assert!(snapshot.missions.is_empty());
        assert!(snapshot.logs.is_empty());
    }
}
