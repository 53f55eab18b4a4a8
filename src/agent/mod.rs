pub mod events;
pub mod runtime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{HelmError, HelmResult};
use crate::hooks::HookKind;
use crate::persistence::PersistenceStore;
use crate::policy::Decision;

pub use events::{AgentEventLog, AgentLogEvent, CyclePhase, EventLevel};
pub use runtime::{AgentRuntime, RuntimeRegistry, Trigger, TriggerSource};

const CATALOG_FILE: &str = "agents.json";

/// Runtime status of a supervisor agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Active,
    Paused,
    WaitingHuman,
    Error,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Active => "active",
            AgentStatus::Paused => "paused",
            AgentStatus::WaitingHuman => "waiting_human",
            AgentStatus::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Safety caps bounding how much autonomy an agent has.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentCaps {
    /// Non-wait decisions allowed without an intervening human signal.
    pub max_consecutive_responses: u32,
    /// Forced pause after each executed action, milliseconds.
    pub action_cooldown_ms: u64,
    /// Watchdog period; 0 disables polling.
    pub poll_interval_ms: u64,
    /// Minimum attention score before a watchdog poll runs a full cycle.
    pub attention_threshold: f64,
}

impl Default for AgentCaps {
    fn default() -> Self {
        Self {
            max_consecutive_responses: 5,
            action_cooldown_ms: 2_000,
            poll_interval_ms: 0,
            attention_threshold: 0.5,
        }
    }
}

/// Binding of an agent to one branch's pane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentConnection {
    pub project_path: String,
    pub session_id: String,
    pub branch_id: String,
    pub mux_pane_id: String,
}

/// A policy-driven autonomous controller attached to one branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub master_prompt: String,
    pub hook_events: Vec<HookKind>,
    pub auto_approve: bool,
    pub caps: AgentCaps,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<AgentConnection>,
    pub status: AgentStatus,
    pub consecutive_responses: u32,
    #[serde(default)]
    pub decision_history: Vec<Decision>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Agent {
    pub fn new(
        name: String,
        master_prompt: String,
        hook_events: Vec<HookKind>,
        auto_approve: bool,
        caps: AgentCaps,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            master_prompt,
            hook_events,
            auto_approve,
            caps,
            connection: None,
            status: AgentStatus::Idle,
            consecutive_responses: 0,
            decision_history: Vec::new(),
            created_at: now,
            last_activity: now,
            last_error: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn listens_to(&self, kind: HookKind) -> bool {
        self.hook_events.contains(&kind)
    }
}

/// Fields a PUT may change; runtime state stays server-owned.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentUpdate {
    pub name: Option<String>,
    pub master_prompt: Option<String>,
    pub hook_events: Option<Vec<HookKind>>,
    pub auto_approve: Option<bool>,
    pub caps: Option<AgentCaps>,
}

/// Persisted catalog of agents. Runtime status transitions are written
/// through here so agents survive a restart with their state intact.
pub struct AgentStore {
    store: Arc<PersistenceStore>,
    agents: RwLock<HashMap<String, Agent>>,
}

impl AgentStore {
    pub async fn load(store: Arc<PersistenceStore>) -> HelmResult<Self> {
        let catalog: Vec<Agent> = store.read_catalog(CATALOG_FILE).await?.unwrap_or_default();
        let agents = catalog.into_iter().map(|a| (a.id.clone(), a)).collect();
        Ok(Self {
            store,
            agents: RwLock::new(agents),
        })
    }

    pub async fn create(&self, agent: Agent) -> HelmResult<Agent> {
        if agent.name.trim().is_empty() {
            return Err(HelmError::validation("agent name cannot be empty"));
        }
        let mut agents = self.agents.write().await;
        agents.insert(agent.id.clone(), agent.clone());
        self.persist(&agents).await?;
        Ok(agent)
    }

    pub async fn get(&self, id: &str) -> HelmResult<Agent> {
        self.agents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| HelmError::not_found(format!("agent '{}'", id)))
    }

    pub async fn list(&self) -> Vec<Agent> {
        let mut all: Vec<Agent> = self.agents.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub async fn update(&self, id: &str, update: AgentUpdate) -> HelmResult<Agent> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| HelmError::not_found(format!("agent '{}'", id)))?;

        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(HelmError::validation("agent name cannot be empty"));
            }
            agent.name = name;
        }
        if let Some(prompt) = update.master_prompt {
            agent.master_prompt = prompt;
        }
        if let Some(hooks) = update.hook_events {
            agent.hook_events = hooks;
        }
        if let Some(auto) = update.auto_approve {
            agent.auto_approve = auto;
        }
        if let Some(caps) = update.caps {
            agent.caps = caps;
        }
        agent.touch();

        let snapshot = agent.clone();
        self.persist(&agents).await?;
        Ok(snapshot)
    }

    pub async fn delete(&self, id: &str) -> HelmResult<()> {
        let mut agents = self.agents.write().await;
        if agents.remove(id).is_none() {
            return Err(HelmError::not_found(format!("agent '{}'", id)));
        }
        self.persist(&agents).await
    }

    /// Applies a runtime-side mutation (status, counters, history,
    /// connection) and persists the transition.
    pub async fn mutate<F>(&self, id: &str, f: F) -> HelmResult<Agent>
    where
        F: FnOnce(&mut Agent),
    {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| HelmError::not_found(format!("agent '{}'", id)))?;
        f(agent);
        agent.touch();
        let snapshot = agent.clone();
        self.persist(&agents).await?;
        Ok(snapshot)
    }

    async fn persist(&self, agents: &HashMap<String, Agent>) -> HelmResult<()> {
        let mut catalog: Vec<&Agent> = agents.values().collect();
        catalog.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        self.store.write_catalog(CATALOG_FILE, &catalog).await
    }
}
