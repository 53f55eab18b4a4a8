use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::agent::runtime::{RuntimeDeps, RuntimeRegistry};
use crate::agent::{AgentConnection, AgentStatus, AgentStore};
use crate::capture::CaptureEngine;
use crate::config::HelmConfig;
use crate::error::{HelmError, HelmResult};
use crate::hooks::HookIngestor;
use crate::mux::{MuxDriver, TmuxDriver};
use crate::notify::{LogSink, NotificationSink, WebhookSink};
use crate::persistence::PersistenceStore;
use crate::policy::{DecisionPolicy, LlmPolicy};
use crate::ports::PortAllocator;
use crate::project::ProjectRegistry;
use crate::session::{BranchStatus, SessionManager};
use crate::viewer::{ViewerEvent, ViewerSupervisor};

/// Period of the background port sweep.
const PORT_SWEEP_PERIOD: Duration = Duration::from_secs(30);

/// The top-level container owning every subsystem.
///
/// There is no global state: tests build several orchestrators side by
/// side with distinct storage roots and port pools, and everything is
/// passed by `Arc` handle.
pub struct Orchestrator {
    pub config: Arc<HelmConfig>,
    pub store: Arc<PersistenceStore>,
    pub projects: Arc<ProjectRegistry>,
    pub sessions: Arc<SessionManager>,
    pub agents: Arc<AgentStore>,
    pub runtimes: Arc<RuntimeRegistry>,
    pub hooks: HookIngestor,
    pub ports: Arc<PortAllocator>,
    pub mux: Arc<dyn MuxDriver>,
    pub viewers: Arc<ViewerSupervisor>,
    pub notifier: Arc<dyn NotificationSink>,
}

impl Orchestrator {
    /// Wires the production collaborators (tmux, LLM policy, webhook or
    /// log notifications) and assembles the container.
    pub async fn bootstrap(config: HelmConfig) -> HelmResult<Arc<Self>> {
        let mux: Arc<dyn MuxDriver> = Arc::new(TmuxDriver::new(config.mux_timeout()));
        let policy: Arc<dyn DecisionPolicy> = Arc::new(LlmPolicy::new(
            config.policy_endpoint.clone(),
            config.policy_api_key.clone(),
            config.policy_model.clone(),
            config.policy_timeout(),
        ));
        let notifier: Arc<dyn NotificationSink> = match &config.notify_webhook {
            Some(url) => Arc::new(WebhookSink::new(url.clone())),
            None => Arc::new(LogSink),
        };
        Self::assemble(config, mux, policy, notifier).await
    }

    /// Assembles the container from explicit collaborators; tests inject
    /// fakes here.
    pub async fn assemble(
        config: HelmConfig,
        mux: Arc<dyn MuxDriver>,
        policy: Arc<dyn DecisionPolicy>,
        notifier: Arc<dyn NotificationSink>,
    ) -> HelmResult<Arc<Self>> {
        let config = Arc::new(config);
        let store = Arc::new(PersistenceStore::new(&config.storage_root)?);
        let ports = Arc::new(PortAllocator::new(config.min_port, config.max_port));
        let (viewers, viewer_events) = ViewerSupervisor::new(
            config.viewer_command.clone(),
            config.viewer_grace(),
            ports.clone(),
        );
        let projects = Arc::new(ProjectRegistry::load(store.clone()).await?);
        let sessions = Arc::new(SessionManager::new(
            config.clone(),
            mux.clone(),
            store.clone(),
            ports.clone(),
            viewers.clone(),
            projects.clone(),
        ));
        let agents = Arc::new(AgentStore::load(store.clone()).await?);
        let capture = Arc::new(CaptureEngine::new(mux.clone(), config.capture_lines));
        let runtimes = Arc::new(RuntimeRegistry::new(RuntimeDeps {
            agents: agents.clone(),
            persistence: store.clone(),
            capture,
            mux: mux.clone(),
            policy,
            notifier: notifier.clone(),
            history_size: config.decision_history_size,
        }));
        let hooks = HookIngestor::new(agents.clone(), runtimes.clone());

        let orchestrator = Arc::new(Self {
            config,
            store,
            projects,
            sessions: sessions.clone(),
            agents,
            runtimes,
            hooks,
            ports: ports.clone(),
            mux,
            viewers,
            notifier,
        });

        orchestrator.spawn_viewer_pump(viewer_events, sessions);
        orchestrator.spawn_port_sweep(ports);
        Ok(orchestrator)
    }

    /// Routes viewer lifecycle reports into session state.
    fn spawn_viewer_pump(
        &self,
        mut events: mpsc::UnboundedReceiver<ViewerEvent>,
        sessions: Arc<SessionManager>,
    ) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let ViewerEvent::Failed { session_id, error } = event {
                    if let Err(e) = sessions.viewer_failed(&session_id, &error).await {
                        tracing::warn!(session = %session_id, error = %e,
                            "recording viewer failure failed");
                    }
                }
            }
        });
    }

    fn spawn_port_sweep(&self, ports: Arc<PortAllocator>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PORT_SWEEP_PERIOD);
            interval.tick().await;
            loop {
                interval.tick().await;
                ports.sweep();
            }
        });
    }

    /// Startup recovery: rebuild sessions from disk and reconcile, then
    /// demote agents whose runtime did not survive the restart.
    pub async fn recover(&self) -> HelmResult<usize> {
        let recovered = self.sessions.recover().await?;
        for agent in self.agents.list().await {
            if matches!(agent.status, AgentStatus::Active | AgentStatus::Paused) {
                let _ = self
                    .agents
                    .mutate(&agent.id, |a| a.status = AgentStatus::Idle)
                    .await;
            }
        }
        Ok(recovered)
    }

    /// Binds an agent to a branch. The target must exist and be
    /// selectable; the pane id is resolved and frozen into the binding.
    pub async fn connect_agent(
        &self,
        agent_id: &str,
        project_path: &str,
        session_id: &str,
        branch_id: &str,
    ) -> HelmResult<crate::agent::Agent> {
        self.projects.require(project_path).await?;
        let branch = self.sessions.resolve_pane(session_id, branch_id).await?;
        if branch.status.is_terminal() {
            return Err(HelmError::conflict(format!(
                "branch '{}' is {} and cannot host an agent",
                branch.name, branch.status
            )));
        }
        if branch.status != BranchStatus::Active {
            return Err(HelmError::conflict(format!(
                "branch '{}' has no live pane",
                branch.name
            )));
        }

        let connection = AgentConnection {
            project_path: project_path.to_string(),
            session_id: session_id.to_string(),
            branch_id: branch.id.clone(),
            mux_pane_id: branch.mux_pane_id.clone(),
        };
        self.agents
            .mutate(agent_id, move |a| a.connection = Some(connection))
            .await
    }

    /// Unbinds an agent, stopping its runtime first.
    pub async fn disconnect_agent(&self, agent_id: &str) -> HelmResult<crate::agent::Agent> {
        if let Some(runtime) = self.runtimes.get(agent_id) {
            let _ = runtime.stop().await;
        }
        self.agents
            .mutate(agent_id, |a| {
                a.connection = None;
                a.status = AgentStatus::Idle;
            })
            .await
    }

    /// Deletes an agent and its runtime.
    pub async fn delete_agent(&self, agent_id: &str) -> HelmResult<()> {
        self.runtimes.remove(agent_id).await;
        self.agents.delete(agent_id).await
    }

    /// Liveness report for the health endpoint.
    pub async fn health(&self) -> serde_json::Value {
        let mux_alive = self.mux.server_alive().await;
        let storage_writable = std::fs::metadata(self.store.root())
            .map(|m| !m.permissions().readonly())
            .unwrap_or(false);
        serde_json::json!({
            "status": if mux_alive && storage_writable { "ok" } else { "degraded" },
            "mux": mux_alive,
            "storage": storage_writable,
            "reservedPorts": self.ports.reserved_count(),
        })
    }

    /// Graceful shutdown: stop agents, detach viewers, persist sessions
    /// as saved. Panes keep running inside the multiplexer.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down");
        self.runtimes.stop_all().await;
        self.sessions.shutdown().await;
        self.viewers.stop_all().await;
    }
}
