use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::agent::events::{AgentLogEvent, EventLevel};
use crate::agent::runtime::{RuntimeRegistry, Trigger};
use crate::agent::AgentStore;
use crate::error::{HelmError, HelmResult};

/// Lifecycle moments the wrapped AI CLI announces through its hook
/// mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookKind {
    Stop,
    Notification,
    SubagentStop,
    PreCompact,
    SessionStart,
    SessionEnd,
    PreToolUse,
    PostToolUse,
}

/// Incoming trigger event. The target is addressed either by pane id or
/// by session + branch; `payload` is pass-through.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookEvent {
    pub hook_kind: HookKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mux_pane_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl HookEvent {
    fn has_target(&self) -> bool {
        self.mux_pane_id.is_some() || (self.session_id.is_some() && self.branch_id.is_some())
    }
}

/// Routes hook events to matching agent runtimes.
///
/// Accepting is fire-and-forget: the caller never blocks on agent work,
/// and a full coalesce buffer drops the trigger downstream. Multiple
/// agents may match one event; each receives the trigger independently.
pub struct HookIngestor {
    agents: Arc<AgentStore>,
    runtimes: Arc<RuntimeRegistry>,
}

impl HookIngestor {
    pub fn new(agents: Arc<AgentStore>, runtimes: Arc<RuntimeRegistry>) -> Self {
        Self { agents, runtimes }
    }

    /// Validates and routes one event, returning how many runtimes were
    /// triggered.
    pub async fn ingest(&self, event: HookEvent) -> HelmResult<usize> {
        if !event.has_target() {
            return Err(HelmError::validation(
                "hook needs muxPaneId or sessionId+branchId",
            ));
        }

        let mut delivered = 0;
        for agent in self.agents.list().await {
            let Some(connection) = &agent.connection else {
                continue;
            };

            let matches_target = match &event.mux_pane_id {
                Some(pane) => connection.mux_pane_id == *pane,
                None => {
                    event.session_id.as_deref() == Some(connection.session_id.as_str())
                        && event.branch_id.as_deref() == Some(connection.branch_id.as_str())
                }
            };
            if !matches_target {
                continue;
            }

            let runtime = self.runtimes.get_or_create(&agent.id);
            if !agent.listens_to(event.hook_kind) {
                runtime.event_log().record(
                    AgentLogEvent::new(&agent.id, EventLevel::Debug, "hook_filter")
                        .detail("hookKind", format!("{:?}", event.hook_kind)),
                );
                continue;
            }

            runtime.trigger(Trigger::hook(event.hook_kind));
            delivered += 1;
        }

        tracing::debug!(
            kind = ?event.hook_kind,
            delivered,
            "hook event routed"
        );
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_event_decoding() {
        let event: HookEvent = serde_json::from_str(
            r#"{"hookKind": "Stop", "sessionId": "s1", "branchId": "main"}"#,
        )
        .unwrap();
        assert_eq!(event.hook_kind, HookKind::Stop);
        assert!(event.has_target());

        let event: HookEvent =
            serde_json::from_str(r#"{"hookKind": "PreToolUse", "muxPaneId": "%3"}"#).unwrap();
        assert!(event.has_target());

        let event: HookEvent = serde_json::from_str(r#"{"hookKind": "Stop"}"#).unwrap();
        assert!(!event.has_target());

        let event: HookEvent =
            serde_json::from_str(r#"{"hookKind": "Stop", "sessionId": "s1"}"#).unwrap();
        assert!(!event.has_target());
    }

    #[test]
    fn test_unknown_hook_kind_rejected() {
        assert!(serde_json::from_str::<HookEvent>(r#"{"hookKind": "Reboot"}"#).is_err());
    }
}
