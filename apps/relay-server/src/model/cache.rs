use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::envelope::Envelope;

/// Cheap content hash over the fields that decide sort order and identity.
pub fn events_hash(events: &[Envelope]) -> u64 {
    let mut hasher = DefaultHasher::new();
    events.len().hash(&mut hasher);
    for event in events {
        event.timestamp.hash(&mut hasher);
        event.event_type.as_str().hash(&mut hasher);
        event.source.hash(&mut hasher);
    }
    hasher.finish()
}

struct SortedView {
    hash: u64,
    events: Arc<[Envelope]>,
}

/// Memoized newest-first event views, one per mission.
#[derive(Default)]
pub struct EventViewCache {
    views: HashMap<String, SortedView>,
    recomputes: u64,
}

impl EventViewCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the sorted view, re-sorting only when the content hash moved.
    pub fn sorted(&mut self, mission_id: &str, events: &[Envelope]) -> Arc<[Envelope]> {
        let hash = events_hash(events);
        if let Some(view) = self.views.get(mission_id) {
            if view.hash == hash {
                return view.events.clone();
            }
        }

        let mut sorted = events.to_vec();
        sorted.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let sorted: Arc<[Envelope]> = sorted.into();
        self.recomputes += 1;
        self.views.insert(
            mission_id.to_string(),
            SortedView {
                hash,
                events: sorted.clone(),
            },
        );
        sorted
    }

    pub fn clear(&mut self) {
        self.views.clear();
    }

    /// Number of times a view was (re)built.
    pub fn recomputes(&self) -> u64 {
        self.recomputes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventType;
    use chrono::{Duration, Utc};
    use serde_json::Map;

    fn event_at(offset_secs: i64) -> Envelope {
        let mut env = Envelope::new(EventType::MissionProgress, "engine", Map::new());
        env.timestamp = Utc::now() + Duration::seconds(offset_secs);
        env
    }

    #[test]
    fn test_sorts_newest_first() {
        let mut cache = EventViewCache::new();
        let events = vec![event_at(0), event_at(20), event_at(10)];
        let view = cache.sorted("m1", &events);
        assert_eq!(view[0].timestamp, events[1].timestamp);
        assert_eq!(view[2].timestamp, events[0].timestamp);
    }

    #[test]
    fn test_resorts_only_when_hash_changes() {
        let mut cache = EventViewCache::new();
        let mut events = vec![event_at(0), event_at(5)];

        cache.sorted("m1", &events);
        cache.sorted("m1", &events);
        assert_eq!(cache.recomputes(), 1);

        events.push(event_at(9));
        let view = cache.sorted("m1", &events);
        assert_eq!(cache.recomputes(), 2);
        assert_eq!(view.len(), 3);
    }
}
