use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::persistence::PersistenceStore;

/// Events kept in memory per agent before the ring starts dropping.
const MAX_BUFFER_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
    Debug,
    Action,
}

/// Phase tag linking an event to its place in a supervision cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Capture,
    Analyze,
    Decide,
    Execute,
    Done,
}

/// One structured log event. Events sharing a `cycle_id` form one
/// capture→decide→execute cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentLogEvent {
    pub id: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub message: String,
    /// Known shapes plus an escape hatch for raw attributes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<CyclePhase>,
}

impl AgentLogEvent {
    pub fn new(agent_id: &str, level: EventLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            cycle_id: None,
            timestamp: Utc::now(),
            level,
            message: message.into(),
            details: None,
            phase: None,
        }
    }

    pub fn cycle(mut self, cycle_id: &str, phase: CyclePhase) -> Self {
        self.cycle_id = Some(cycle_id.to_string());
        self.phase = Some(phase);
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.to_string(), value.into());
        self
    }
}

/// Per-agent event sink: bounded in-memory ring for the status endpoint
/// plus an append-only jsonl file for durability.
pub struct AgentEventLog {
    agent_id: String,
    ring: Mutex<VecDeque<AgentLogEvent>>,
    store: Arc<PersistenceStore>,
    path: PathBuf,
}

impl AgentEventLog {
    pub fn new(agent_id: &str, store: Arc<PersistenceStore>) -> Self {
        let path = store.agent_log_path(agent_id);
        Self {
            agent_id: agent_id.to_string(),
            ring: Mutex::new(VecDeque::with_capacity(256)),
            store,
            path,
        }
    }

    pub fn record(&self, event: AgentLogEvent) {
        if let Err(e) = self.store.append_jsonl(&self.path, &event) {
            tracing::warn!(agent = %self.agent_id, error = %e, "agent log append failed");
        }
        if let Ok(mut ring) = self.ring.lock() {
            ring.push_back(event);
            while ring.len() > MAX_BUFFER_SIZE {
                ring.pop_front();
            }
        }
    }

    /// Most recent events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<AgentLogEvent> {
        let ring = match self.ring.lock() {
            Ok(r) => r,
            Err(_) => return Vec::new(),
        };
        let skip = ring.len().saturating_sub(limit);
        ring.iter().skip(skip).cloned().collect()
    }

    /// Drops both the ring and the on-disk file.
    pub fn clear(&self) {
        if let Ok(mut ring) = self.ring.lock() {
            ring.clear();
        }
        if let Err(e) = self.store.truncate_file(&self.path) {
            tracing::warn!(agent = %self.agent_id, error = %e, "agent log truncate failed");
        }
    }

    /// Reloads the tail of the jsonl file into the ring (recovery).
    pub fn hydrate(&self, limit: usize) {
        if let Ok(events) = self.store.read_jsonl::<AgentLogEvent>(&self.path, limit) {
            if let Ok(mut ring) = self.ring.lock() {
                ring.clear();
                ring.extend(events);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_and_recent() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(PersistenceStore::new(dir.path()).unwrap());
        let log = AgentEventLog::new("a1", store);

        for i in 0..5 {
            log.record(
                AgentLogEvent::new("a1", EventLevel::Info, format!("event {}", i))
                    .cycle("c1", CyclePhase::Capture),
            );
        }

        let recent = log.recent(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "event 2");
        assert_eq!(recent[2].message, "event 4");
        assert_eq!(recent[0].cycle_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_clear_and_hydrate() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(PersistenceStore::new(dir.path()).unwrap());
        let log = AgentEventLog::new("a1", store.clone());

        log.record(AgentLogEvent::new("a1", EventLevel::Action, "acted").detail("keys", "y"));

        // A fresh log over the same store hydrates from disk.
        let other = AgentEventLog::new("a1", store);
        other.hydrate(100);
        assert_eq!(other.recent(10).len(), 1);

        other.clear();
        assert!(other.recent(10).is_empty());
        other.hydrate(100);
        assert!(other.recent(10).is_empty());
    }
}
