use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use crate::capture::TerminalState;
use crate::config::HelmConfig;
use crate::error::{HelmError, HelmResult};
use crate::mux::{ControlKey, MuxDriver, PaneInfo};
use crate::notify::NotificationSink;
use crate::orchestrator::Orchestrator;
use crate::policy::{Decision, DecisionAction, DecisionPolicy};

/// One recorded `send_keys` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentKeys {
    pub pane_id: String,
    pub text: String,
    pub press_enter: bool,
}

#[derive(Debug, Clone)]
struct FakePane {
    id: String,
    title: String,
    active: bool,
}

#[derive(Default)]
struct FakeMuxState {
    next_pane: u32,
    sessions: HashMap<String, Vec<FakePane>>,
    sent: Vec<SentKeys>,
    controls: Vec<(String, ControlKey)>,
    screens: HashMap<String, String>,
}

/// In-memory multiplexer double: panes are rows in a map, screens are
/// settable strings, and every key send is recorded.
#[derive(Default)]
pub struct FakeMux {
    state: Mutex<FakeMuxState>,
}

impl FakeMux {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn session_of(state: &FakeMuxState, pane_id: &str) -> Option<String> {
        state
            .sessions
            .iter()
            .find(|(_, panes)| panes.iter().any(|p| p.id == pane_id))
            .map(|(name, _)| name.clone())
    }

    pub fn sent_keys(&self) -> Vec<SentKeys> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn controls(&self) -> Vec<(String, ControlKey)> {
        self.state.lock().unwrap().controls.clone()
    }

    pub fn set_screen(&self, pane_id: &str, content: &str) {
        self.state
            .lock()
            .unwrap()
            .screens
            .insert(pane_id.to_string(), content.to_string());
    }

    /// Simulates a pane dying outside our control.
    pub fn kill_pane_external(&self, pane_id: &str) {
        let mut state = self.state.lock().unwrap();
        for panes in state.sessions.values_mut() {
            panes.retain(|p| p.id != pane_id);
        }
        state.sessions.retain(|_, panes| !panes.is_empty());
    }

    /// Simulates the whole mux session dying (server restart).
    pub fn kill_session_external(&self, name: &str) {
        self.state.lock().unwrap().sessions.remove(name);
    }

    pub fn pane_count(&self, session_name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .sessions
            .get(session_name)
            .map(|p| p.len())
            .unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    fn add_pane(state: &mut FakeMuxState, session: &str, active: bool) -> String {
        state.next_pane += 1;
        let id = format!("%{}", state.next_pane);
        state.sessions.entry(session.to_string()).or_default().push(FakePane {
            id: id.clone(),
            title: String::new(),
            active,
        });
        id
    }
}

#[async_trait]
impl MuxDriver for FakeMux {
    async fn new_session(
        &self,
        name: &str,
        _cwd: &Path,
        _initial_cmd: &[String],
    ) -> HelmResult<String> {
        let mut state = self.state.lock().unwrap();
        if state.sessions.contains_key(name) {
            return Err(HelmError::AlreadyExists(format!("mux session '{}'", name)));
        }
        Ok(Self::add_pane(&mut state, name, true))
    }

    async fn split_pane(
        &self,
        parent_pane_id: &str,
        _vertical: bool,
        _cwd: &Path,
        _initial_cmd: &[String],
    ) -> HelmResult<String> {
        let mut state = self.state.lock().unwrap();
        let session = Self::session_of(&state, parent_pane_id)
            .ok_or_else(|| HelmError::not_found(format!("pane '{}'", parent_pane_id)))?;
        Ok(Self::add_pane(&mut state, &session, false))
    }

    async fn send_keys(&self, pane_id: &str, text: &str, press_enter: bool) -> HelmResult<()> {
        let mut state = self.state.lock().unwrap();
        if Self::session_of(&state, pane_id).is_none() {
            return Err(HelmError::not_found(format!("pane '{}'", pane_id)));
        }
        state.sent.push(SentKeys {
            pane_id: pane_id.to_string(),
            text: text.to_string(),
            press_enter,
        });
        Ok(())
    }

    async fn send_control(&self, pane_id: &str, key: ControlKey) -> HelmResult<()> {
        let mut state = self.state.lock().unwrap();
        if Self::session_of(&state, pane_id).is_none() {
            return Err(HelmError::not_found(format!("pane '{}'", pane_id)));
        }
        state.controls.push((pane_id.to_string(), key));
        Ok(())
    }

    async fn capture_pane(&self, pane_id: &str, _last_n: usize) -> HelmResult<String> {
        let state = self.state.lock().unwrap();
        if Self::session_of(&state, pane_id).is_none() {
            return Err(HelmError::not_found(format!("pane '{}'", pane_id)));
        }
        Ok(state
            .screens
            .get(pane_id)
            .cloned()
            .unwrap_or_else(|| "❯ ".to_string()))
    }

    async fn capture_history(&self, pane_id: &str) -> HelmResult<String> {
        self.capture_pane(pane_id, usize::MAX).await
    }

    async fn list_panes(&self, session_name: &str) -> HelmResult<Vec<PaneInfo>> {
        let state = self.state.lock().unwrap();
        let panes = state
            .sessions
            .get(session_name)
            .ok_or_else(|| HelmError::not_found(format!("mux session '{}'", session_name)))?;
        Ok(panes
            .iter()
            .map(|p| PaneInfo {
                pane_id: p.id.clone(),
                title: p.title.clone(),
                pid: Some(4242),
                active: p.active,
            })
            .collect())
    }

    async fn select_pane(&self, pane_id: &str) -> HelmResult<()> {
        let mut state = self.state.lock().unwrap();
        let session = Self::session_of(&state, pane_id)
            .ok_or_else(|| HelmError::not_found(format!("pane '{}'", pane_id)))?;
        if let Some(panes) = state.sessions.get_mut(&session) {
            for pane in panes.iter_mut() {
                pane.active = pane.id == pane_id;
            }
        }
        Ok(())
    }

    async fn set_pane_title(&self, pane_id: &str, title: &str) -> HelmResult<()> {
        let mut state = self.state.lock().unwrap();
        for panes in state.sessions.values_mut() {
            if let Some(pane) = panes.iter_mut().find(|p| p.id == pane_id) {
                pane.title = title.to_string();
                return Ok(());
            }
        }
        Err(HelmError::not_found(format!("pane '{}'", pane_id)))
    }

    async fn kill_pane(&self, pane_id: &str) -> HelmResult<()> {
        let mut state = self.state.lock().unwrap();
        if Self::session_of(&state, pane_id).is_none() {
            return Err(HelmError::not_found(format!("pane '{}'", pane_id)));
        }
        for panes in state.sessions.values_mut() {
            panes.retain(|p| p.id != pane_id);
        }
        state.sessions.retain(|_, panes| !panes.is_empty());
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> HelmResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .sessions
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| HelmError::not_found(format!("mux session '{}'", name)))
    }

    async fn session_exists(&self, name: &str) -> HelmResult<bool> {
        Ok(self.state.lock().unwrap().sessions.contains_key(name))
    }

    async fn active_pane_of(&self, session_name: &str) -> HelmResult<String> {
        let panes = self.list_panes(session_name).await?;
        panes
            .into_iter()
            .find(|p| p.active)
            .map(|p| p.pane_id)
            .ok_or_else(|| HelmError::not_found(format!("active pane of '{}'", session_name)))
    }

    async fn server_alive(&self) -> bool {
        true
    }
}

/// Scripted decision policy: pops queued outcomes, then falls back to
/// the default decision.
pub struct FakePolicy {
    script: Mutex<VecDeque<HelmResult<Decision>>>,
    default: Mutex<Decision>,
    calls: AtomicUsize,
}

impl FakePolicy {
    pub fn respond(text: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(Decision {
                action: DecisionAction::Respond,
                response: Some(text.to_string()),
                reason: "scripted".to_string(),
                confidence: 0.9,
                timestamp: chrono::Utc::now(),
            }),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn waiting() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(Decision::wait("nothing to do")),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn push(&self, outcome: HelmResult<Decision>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DecisionPolicy for FakePolicy {
    async fn decide(
        &self,
        _master_prompt: &str,
        _state: &TerminalState,
        _history: &[Decision],
    ) -> HelmResult<Decision> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = self.script.lock().unwrap().pop_front() {
            return outcome;
        }
        Ok(self.default.lock().unwrap().clone())
    }
}

/// Records alerts instead of pushing them anywhere.
#[derive(Default)]
pub struct FakeNotifier {
    messages: Mutex<Vec<(String, String)>>,
}

impl FakeNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for FakeNotifier {
    async fn notify(&self, subject: &str, body: &str) -> HelmResult<()> {
        self.messages
            .lock()
            .unwrap()
            .push((subject.to_string(), body.to_string()));
        Ok(())
    }
}

/// A fully wired orchestrator over fakes and a throwaway storage root.
pub struct TestHarness {
    pub orchestrator: Arc<Orchestrator>,
    pub mux: Arc<FakeMux>,
    pub policy: Arc<FakePolicy>,
    pub notifier: Arc<FakeNotifier>,
    pub tmp: TempDir,
}

pub async fn harness_with(policy: Arc<FakePolicy>, viewer_command: Option<String>) -> TestHarness {
    let tmp = TempDir::new().unwrap();
    let mut config = HelmConfig::default();
    config.storage_root = tmp.path().to_path_buf();
    config.exports_dir = tmp.path().join("exports");
    config.viewer_command = viewer_command;
    config.min_port = 48100;
    config.max_port = 48180;

    let mux = FakeMux::new();
    let notifier = FakeNotifier::new();
    let orchestrator = Orchestrator::assemble(
        config,
        mux.clone(),
        policy.clone(),
        notifier.clone(),
    )
    .await
    .unwrap();

    TestHarness {
        orchestrator,
        mux,
        policy,
        notifier,
        tmp,
    }
}

pub async fn harness() -> TestHarness {
    harness_with(FakePolicy::waiting(), None).await
}

/// Polls until `check` passes or the deadline expires.
pub async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
