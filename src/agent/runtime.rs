use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::events::{AgentEventLog, AgentLogEvent, CyclePhase, EventLevel};
use super::{Agent, AgentStatus, AgentStore};
use crate::capture::{CaptureEngine, ScreenClass};
use crate::error::{HelmError, HelmResult};
use crate::hooks::HookKind;
use crate::mux::{ControlKey, MuxDriver};
use crate::notify::NotificationSink;
use crate::persistence::PersistenceStore;
use crate::policy::{Decision, DecisionAction, DecisionPolicy};

/// Where a trigger came from; watchdog polls are attention-gated,
/// everything else runs a full cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Hook,
    Watchdog,
    Manual,
}

/// One wake-up request for an agent.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub source: TriggerSource,
    pub hook_kind: Option<HookKind>,
}

impl Trigger {
    pub fn hook(kind: HookKind) -> Self {
        Self {
            source: TriggerSource::Hook,
            hook_kind: Some(kind),
        }
    }

    pub fn manual() -> Self {
        Self {
            source: TriggerSource::Manual,
            hook_kind: None,
        }
    }

    fn watchdog() -> Self {
        Self {
            source: TriggerSource::Watchdog,
            hook_kind: None,
        }
    }
}

/// Shared collaborators handed to every runtime.
#[derive(Clone)]
pub struct RuntimeDeps {
    pub agents: Arc<AgentStore>,
    pub persistence: Arc<PersistenceStore>,
    pub capture: Arc<CaptureEngine>,
    pub mux: Arc<dyn MuxDriver>,
    pub policy: Arc<dyn DecisionPolicy>,
    pub notifier: Arc<dyn NotificationSink>,
    pub history_size: usize,
}

/// Per-agent control loop.
///
/// Cycles are strictly serial: one worker task consumes a bounded(1)
/// trigger channel, so triggers arriving mid-cycle coalesce to at most
/// one queued wake-up and overflow is dropped. `stop()` cancels the
/// in-flight cycle at the next suspension point; an in-flight key send
/// completes, but the history append and cooldown after it are skipped.
pub struct AgentRuntime {
    agent_id: String,
    deps: RuntimeDeps,
    log: Arc<AgentEventLog>,
    trigger_tx: async_channel::Sender<Trigger>,
    trigger_rx: async_channel::Receiver<Trigger>,
    /// Token for the currently running worker generation.
    cancel: Mutex<CancellationToken>,
}

impl AgentRuntime {
    pub fn new(agent_id: &str, deps: RuntimeDeps) -> Arc<Self> {
        let (trigger_tx, trigger_rx) = async_channel::bounded(1);
        let log = Arc::new(AgentEventLog::new(agent_id, deps.persistence.clone()));
        log.hydrate(200);
        Arc::new(Self {
            agent_id: agent_id.to_string(),
            deps,
            log,
            trigger_tx,
            trigger_rx,
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn event_log(&self) -> &AgentEventLog {
        &self.log
    }

    /// `idle → active`: requires a connection; spawns the worker and,
    /// when polling is configured, the watchdog. Starting is also the
    /// explicit human acknowledgement that clears `waiting_human`.
    pub async fn start(self: &Arc<Self>) -> HelmResult<Agent> {
        let agent = self.deps.agents.get(&self.agent_id).await?;
        if agent.status == AgentStatus::Active {
            return Ok(agent);
        }
        if agent.connection.is_none() {
            let snapshot = self
                .deps
                .agents
                .mutate(&self.agent_id, |a| {
                    a.status = AgentStatus::Error;
                    a.last_error = Some("cannot start without a connection".to_string());
                })
                .await?;
            self.log.record(AgentLogEvent::new(
                &self.agent_id,
                EventLevel::Error,
                "start refused: no connection",
            ));
            return Err(HelmError::validation(format!(
                "agent '{}' has no connection",
                snapshot.name
            )));
        }

        let snapshot = self
            .deps
            .agents
            .mutate(&self.agent_id, |a| {
                a.status = AgentStatus::Active;
                a.consecutive_responses = 0;
                a.last_error = None;
            })
            .await?;

        // Fresh cancellation scope for this activation.
        let token = CancellationToken::new();
        *self.cancel.lock().await = token.clone();

        // Drain anything queued while stopped.
        while self.trigger_rx.try_recv().is_ok() {}

        let runtime = Arc::clone(self);
        let worker_token = token.clone();
        tokio::spawn(async move { runtime.worker(worker_token).await });

        if snapshot.caps.poll_interval_ms > 0 {
            let runtime = Arc::clone(self);
            let poll = Duration::from_millis(snapshot.caps.poll_interval_ms);
            tokio::spawn(async move { runtime.watchdog(poll, token).await });
        }

        self.log.record(AgentLogEvent::new(
            &self.agent_id,
            EventLevel::Info,
            "agent started",
        ));
        Ok(snapshot)
    }

    /// Any state → idle; cancels the in-flight cycle.
    pub async fn stop(&self) -> HelmResult<Agent> {
        self.cancel.lock().await.cancel();
        while self.trigger_rx.try_recv().is_ok() {}
        let snapshot = self
            .deps
            .agents
            .mutate(&self.agent_id, |a| a.status = AgentStatus::Idle)
            .await?;
        self.log.record(AgentLogEvent::new(
            &self.agent_id,
            EventLevel::Info,
            "agent stopped",
        ));
        Ok(snapshot)
    }

    pub async fn pause(&self) -> HelmResult<Agent> {
        let agent = self.deps.agents.get(&self.agent_id).await?;
        if agent.status != AgentStatus::Active {
            return Err(HelmError::conflict(format!(
                "cannot pause agent in {} state",
                agent.status
            )));
        }
        self.deps
            .agents
            .mutate(&self.agent_id, |a| a.status = AgentStatus::Paused)
            .await
    }

    /// `paused → active`, and the human acknowledgement for
    /// `waiting_human → active` (resets the consecutive counter).
    pub async fn resume(&self) -> HelmResult<Agent> {
        let agent = self.deps.agents.get(&self.agent_id).await?;
        match agent.status {
            AgentStatus::Paused | AgentStatus::WaitingHuman => {
                self.deps
                    .agents
                    .mutate(&self.agent_id, |a| {
                        a.status = AgentStatus::Active;
                        a.consecutive_responses = 0;
                    })
                    .await
            }
            _ => Err(HelmError::conflict(format!(
                "cannot resume agent in {} state",
                agent.status
            ))),
        }
    }

    /// Enqueues a trigger without blocking. A full coalesce buffer drops
    /// the trigger with a `hook_dropped` event.
    pub fn trigger(&self, trigger: Trigger) {
        match self.trigger_tx.try_send(trigger) {
            Ok(()) => {}
            Err(async_channel::TrySendError::Full(t)) => {
                self.log.record(
                    AgentLogEvent::new(&self.agent_id, EventLevel::Debug, "hook_dropped")
                        .detail("source", format!("{:?}", t.source)),
                );
            }
            Err(async_channel::TrySendError::Closed(_)) => {}
        }
    }

    async fn worker(self: Arc<Self>, token: CancellationToken) {
        loop {
            let trigger = tokio::select! {
                _ = token.cancelled() => return,
                t = self.trigger_rx.recv() => match t {
                    Ok(t) => t,
                    Err(_) => return,
                },
            };

            if let Err(e) = self.run_cycle(trigger, &token).await {
                match e {
                    HelmError::Cancelled => return,
                    e => {
                        // Never crash the process: park the agent in
                        // error state until the operator restarts it.
                        tracing::error!(agent = %self.agent_id, error = %e, "cycle failed");
                        self.log.record(
                            AgentLogEvent::new(&self.agent_id, EventLevel::Error, "cycle failed")
                                .detail("error", e.to_string()),
                        );
                        let _ = self
                            .deps
                            .agents
                            .mutate(&self.agent_id, |a| {
                                a.status = AgentStatus::Error;
                                a.last_error = Some(e.to_string());
                            })
                            .await;
                    }
                }
            }
        }
    }

    async fn watchdog(self: Arc<Self>, period: Duration, token: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await; // consume the immediate tick
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => {}
            }
            // Only poll while active; a full buffer is fine (coalesced).
            if let Ok(agent) = self.deps.agents.get(&self.agent_id).await {
                if agent.status == AgentStatus::Active {
                    let _ = self.trigger_tx.try_send(Trigger::watchdog());
                }
            }
        }
    }

    /// One capture → analyze → decide → execute → done cycle.
    async fn run_cycle(&self, trigger: Trigger, token: &CancellationToken) -> HelmResult<()> {
        let agent = self.deps.agents.get(&self.agent_id).await?;
        if agent.status != AgentStatus::Active {
            return Ok(());
        }
        let Some(connection) = agent.connection.clone() else {
            return Ok(());
        };

        let cycle_id = Uuid::new_v4().to_string();

        // capture
        let state = match self.deps.capture.capture(&connection.mux_pane_id).await {
            Ok(state) => state,
            Err(HelmError::NotFound(what)) => {
                self.log.record(
                    AgentLogEvent::new(&self.agent_id, EventLevel::Error, "pane missing")
                        .cycle(&cycle_id, CyclePhase::Capture)
                        .detail("target", what.clone()),
                );
                self.deps
                    .agents
                    .mutate(&self.agent_id, |a| {
                        a.status = AgentStatus::Error;
                        a.last_error = Some(format!("{} not found", what));
                    })
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.log.record(
            AgentLogEvent::new(&self.agent_id, EventLevel::Info, "captured pane")
                .cycle(&cycle_id, CyclePhase::Capture)
                .detail("lines", state.raw_lines.len())
                .detail("trigger", format!("{:?}", trigger.source)),
        );

        // analyze
        let score = state.attention_score();
        self.log.record(
            AgentLogEvent::new(&self.agent_id, EventLevel::Info, "analyzed screen")
                .cycle(&cycle_id, CyclePhase::Analyze)
                .detail("classified", state.classified.to_string())
                .detail("attention", score),
        );
        if trigger.source == TriggerSource::Watchdog && score < agent.caps.attention_threshold {
            self.log.record(
                AgentLogEvent::new(&self.agent_id, EventLevel::Debug, "below attention threshold")
                    .cycle(&cycle_id, CyclePhase::Analyze)
                    .detail("threshold", agent.caps.attention_threshold),
            );
            return Ok(());
        }

        // decide
        let decision = if agent.auto_approve && state.classified == ScreenClass::PermissionPrompt {
            Decision {
                action: DecisionAction::Approve,
                response: None,
                reason: "auto-approve enabled for permission prompts".to_string(),
                confidence: 1.0,
                timestamp: chrono::Utc::now(),
            }
        } else {
            match self
                .deps
                .policy
                .decide(&agent.master_prompt, &state, &agent.decision_history)
                .await
            {
                Ok(decision) => decision,
                Err(HelmError::PolicyProtocol(detail)) => {
                    self.log.record(
                        AgentLogEvent::new(&self.agent_id, EventLevel::Warn, "policy unparseable")
                            .cycle(&cycle_id, CyclePhase::Decide)
                            .detail("error", detail),
                    );
                    Decision::wait("policy unparseable")
                }
                Err(e) => return Err(e),
            }
        };
        self.log.record(
            AgentLogEvent::new(&self.agent_id, EventLevel::Info, "policy decided")
                .cycle(&cycle_id, CyclePhase::Decide)
                .detail("action", decision.action.to_string())
                .detail("reason", decision.reason.clone())
                .detail("confidence", decision.confidence),
        );

        // A stop between decide and execute drops the action.
        if token.is_cancelled() {
            return Err(HelmError::Cancelled);
        }
        let agent = self.deps.agents.get(&self.agent_id).await?;
        if agent.status != AgentStatus::Active {
            self.log.record(
                AgentLogEvent::new(&self.agent_id, EventLevel::Debug, "agent no longer active, action dropped")
                    .cycle(&cycle_id, CyclePhase::Execute),
            );
            return Ok(());
        }

        // Cap gate: equality means the next transition is waiting_human,
        // before any further action.
        if !decision.action.is_passive()
            && agent.consecutive_responses >= agent.caps.max_consecutive_responses
        {
            self.enter_waiting_human(&cycle_id, "consecutive response cap reached")
                .await?;
            return Ok(());
        }

        // execute
        self.execute(&connection.mux_pane_id, &decision, &cycle_id)
            .await?;

        // done: skip bookkeeping when stopped during the key send.
        if token.is_cancelled() {
            return Err(HelmError::Cancelled);
        }

        let history_size = self.deps.history_size;
        let passive = decision.action.is_passive();
        let decision_for_store = decision.clone();
        let updated = self
            .deps
            .agents
            .mutate(&self.agent_id, move |a| {
                a.decision_history.push(decision_for_store);
                if a.decision_history.len() > history_size {
                    let overflow = a.decision_history.len() - history_size;
                    a.decision_history.drain(..overflow);
                }
                if passive {
                    a.consecutive_responses = 0;
                } else {
                    a.consecutive_responses += 1;
                }
            })
            .await?;
        self.log.record(
            AgentLogEvent::new(&self.agent_id, EventLevel::Info, "cycle complete")
                .cycle(&cycle_id, CyclePhase::Done)
                .detail("consecutiveResponses", updated.consecutive_responses),
        );

        match decision.action {
            DecisionAction::RequestHelp => {
                self.enter_waiting_human(&cycle_id, &decision.reason).await?;
                return Ok(());
            }
            action if !action.is_passive() => {
                if updated.consecutive_responses >= updated.caps.max_consecutive_responses {
                    self.enter_waiting_human(&cycle_id, "consecutive response cap reached")
                        .await?;
                    return Ok(());
                }
            }
            _ => {}
        }

        // cooldown before the next cycle
        if agent.caps.action_cooldown_ms > 0 && !decision.action.is_passive() {
            tokio::select! {
                _ = token.cancelled() => return Err(HelmError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(agent.caps.action_cooldown_ms)) => {}
            }
        }
        Ok(())
    }

    /// Maps a decision to at most one mux action.
    async fn execute(
        &self,
        pane_id: &str,
        decision: &Decision,
        cycle_id: &str,
    ) -> HelmResult<()> {
        let performed: Option<String> = match (&decision.action, &decision.response) {
            (DecisionAction::Respond, Some(text)) => {
                self.deps.mux.send_keys(pane_id, text, true).await?;
                Some(format!("sent response ({} chars)", text.len()))
            }
            // Parser rejects respond without text; nothing to send here.
            (DecisionAction::Respond, None) => None,
            (DecisionAction::Approve, _) => {
                self.deps.mux.send_keys(pane_id, "y", true).await?;
                Some("approved prompt".to_string())
            }
            (DecisionAction::Reject, _) => {
                self.deps.mux.send_keys(pane_id, "n", true).await?;
                Some("rejected prompt".to_string())
            }
            (DecisionAction::Compact, _) => {
                self.deps.mux.send_keys(pane_id, "/compact", true).await?;
                Some("requested compaction".to_string())
            }
            (DecisionAction::Interrupt, _) => {
                self.deps.mux.send_control(pane_id, ControlKey::CtrlC).await?;
                Some("interrupted assistant".to_string())
            }
            (DecisionAction::Wait, _) | (DecisionAction::RequestHelp, _) => None,
        };

        if let Some(summary) = performed {
            self.log.record(
                AgentLogEvent::new(&self.agent_id, EventLevel::Action, summary)
                    .cycle(cycle_id, CyclePhase::Execute)
                    .detail("action", decision.action.to_string()),
            );
        } else {
            self.log.record(
                AgentLogEvent::new(&self.agent_id, EventLevel::Info, "no terminal action")
                    .cycle(cycle_id, CyclePhase::Execute)
                    .detail("action", decision.action.to_string()),
            );
        }
        Ok(())
    }

    async fn enter_waiting_human(&self, cycle_id: &str, reason: &str) -> HelmResult<()> {
        let snapshot = self
            .deps
            .agents
            .mutate(&self.agent_id, |a| {
                a.status = AgentStatus::WaitingHuman;
            })
            .await?;
        self.log.record(
            AgentLogEvent::new(&self.agent_id, EventLevel::Warn, "waiting for human")
                .cycle(cycle_id, CyclePhase::Done)
                .detail("reason", reason),
        );
        let body = format!(
            "Agent '{}' needs attention: {}\nTarget: {}",
            snapshot.name,
            reason,
            snapshot
                .connection
                .as_ref()
                .map(|c| format!("{} / {}", c.session_id, c.branch_id))
                .unwrap_or_else(|| "unbound".to_string())
        );
        if let Err(e) = self.deps.notifier.notify("cchelm agent needs help", &body).await {
            tracing::warn!(agent = %self.agent_id, error = %e, "notification failed");
        }
        Ok(())
    }
}

/// All live runtimes, keyed by agent id. Runtimes are created lazily and
/// dropped when their agent is deleted.
pub struct RuntimeRegistry {
    deps: RuntimeDeps,
    runtimes: DashMap<String, Arc<AgentRuntime>>,
}

impl RuntimeRegistry {
    pub fn new(deps: RuntimeDeps) -> Self {
        Self {
            deps,
            runtimes: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, agent_id: &str) -> Arc<AgentRuntime> {
        self.runtimes
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentRuntime::new(agent_id, self.deps.clone()))
            .clone()
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentRuntime>> {
        self.runtimes.get(agent_id).map(|r| r.clone())
    }

    pub fn iter_runtimes(&self) -> Vec<Arc<AgentRuntime>> {
        self.runtimes.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn remove(&self, agent_id: &str) {
        if let Some((_, runtime)) = self.runtimes.remove(agent_id) {
            let _ = runtime.stop().await;
        }
    }

    pub async fn stop_all(&self) {
        for runtime in self.iter_runtimes() {
            let _ = runtime.stop().await;
        }
    }
}
