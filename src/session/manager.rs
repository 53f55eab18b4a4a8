use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::tree::BranchTree;
use super::{
    mux_session_name, pane_title, parse_pane_title, Branch, BranchStatus, Session, SessionStatus,
};
use crate::config::HelmConfig;
use crate::error::{HelmError, HelmResult};
use crate::mux::MuxDriver;
use crate::persistence::{PersistenceStore, StateDocument, STATE_VERSION};
use crate::ports::PortAllocator;
use crate::project::{Project, ProjectRegistry};
use crate::viewer::{ViewerSpec, ViewerSupervisor};

/// Backoff before the single retry on a transient mux failure.
const MUX_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Durable session-level event (drift, adoption, lifecycle).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
}

/// Owns sessions and their branch trees; coordinates the mux driver,
/// viewer supervisor, and persistence store.
///
/// Each session is guarded by its own async mutex, so operations within
/// one session are linearizable and reconcile is mutually exclusive with
/// any mutation. Ordering on mutations is persist intent → perform
/// external effect → persist outcome; a crash in between is healed by
/// `reconcile`.
pub struct SessionManager {
    config: Arc<HelmConfig>,
    mux: Arc<dyn MuxDriver>,
    store: Arc<PersistenceStore>,
    ports: Arc<PortAllocator>,
    viewers: Arc<ViewerSupervisor>,
    projects: Arc<ProjectRegistry>,
    entries: DashMap<String, Arc<Mutex<Session>>>,
}

impl SessionManager {
    pub fn new(
        config: Arc<HelmConfig>,
        mux: Arc<dyn MuxDriver>,
        store: Arc<PersistenceStore>,
        ports: Arc<PortAllocator>,
        viewers: Arc<ViewerSupervisor>,
        projects: Arc<ProjectRegistry>,
    ) -> Self {
        Self {
            config,
            mux,
            store,
            ports,
            viewers,
            projects,
            entries: DashMap::new(),
        }
    }

    fn entry(&self, session_id: &str) -> HelmResult<Arc<Mutex<Session>>> {
        self.entries
            .get(session_id)
            .map(|e| e.clone())
            .ok_or_else(|| HelmError::not_found(format!("session '{}'", session_id)))
    }

    /// One retry with a short backoff for transient mux failures.
    async fn retry_mux<T, F, Fut>(op: F) -> HelmResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = HelmResult<T>>,
    {
        match op().await {
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "transient mux failure, retrying once");
                tokio::time::sleep(MUX_RETRY_DELAY).await;
                op().await
            }
            result => result,
        }
    }

    fn record_event(&self, project_path: &str, event: SessionEvent) {
        let path = self.store.events_path(project_path);
        if let Err(e) = self.store.append_jsonl(&path, &event) {
            tracing::warn!(error = %e, "session event append failed");
        }
    }

    fn event(session_id: &str, kind: &str, message: String, branch_id: Option<String>) -> SessionEvent {
        SessionEvent {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            kind: kind.to_string(),
            message,
            branch_id,
        }
    }

    /// Writes the current state of every session of a project.
    async fn persist_project(&self, project_path: &str) -> HelmResult<()> {
        let project = self
            .projects
            .get(project_path)
            .await
            .unwrap_or_else(|| Project::new(project_path, None));

        let mut sessions = Vec::new();
        for entry in self.entries.iter() {
            let session = entry.value().lock().await;
            if session.project_path == project_path {
                sessions.push(session.clone());
            }
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        self.store
            .save_state(&StateDocument {
                version: STATE_VERSION,
                project,
                sessions,
            })
            .await
    }

    fn fresh_cmd(&self) -> Vec<String> {
        vec![self.config.agent_command.clone()]
    }

    fn resume_cmd(&self, transcript: &str) -> Vec<String> {
        vec![
            self.config.agent_command.clone(),
            self.config.agent_resume_flag.clone(),
            transcript.to_string(),
        ]
    }

    fn fork_cmd(&self, parent_transcript: &str) -> Vec<String> {
        let mut cmd = self.resume_cmd(parent_transcript);
        cmd.push(self.config.agent_fork_flag.clone());
        cmd
    }

    /// Allocates a port and starts the viewer for a session's pane.
    /// Returns `None` in headless mode.
    async fn start_viewer(
        &self,
        session_id: &str,
        mux_name: &str,
        pane_id: &str,
    ) -> HelmResult<Option<u16>> {
        if !self.viewers.enabled() {
            return Ok(None);
        }
        let port = self.ports.acquire()?;
        let spec = ViewerSpec {
            session_id: session_id.to_string(),
            mux_session_name: mux_name.to_string(),
            pane_id: pane_id.to_string(),
            port,
        };
        if let Err(e) = self.viewers.start(spec).await {
            self.ports.release(port);
            return Err(e);
        }
        Ok(Some(port))
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Creates a session: registers a mux session running the AI CLI in
    /// the project directory, binds a viewer, persists.
    pub async fn create_session(
        &self,
        project_path: &str,
        name: Option<String>,
    ) -> HelmResult<Session> {
        self.projects.require(project_path).await?;

        let session_id = Uuid::new_v4().to_string();
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("session-{}", &session_id[..8]));
        let mux_name = mux_session_name(&name, &session_id);

        if self.mux.session_exists(&mux_name).await? {
            return Err(HelmError::AlreadyExists(format!(
                "mux session '{}'",
                mux_name
            )));
        }

        // Journal the intent before any external effect.
        self.record_event(
            project_path,
            Self::event(&session_id, "create_intent", format!("creating '{}'", name), None),
        );
        let transcript = self
            .store
            .transcript_path(project_path, &session_id, "main")
            .to_string_lossy()
            .to_string();

        let cwd = PathBuf::from(project_path);
        let cmd = self.fresh_cmd();
        let pane_id =
            Self::retry_mux(|| self.mux.new_session(&mux_name, &cwd, &cmd)).await?;
        self.mux
            .set_pane_title(&pane_id, &pane_title(&session_id, "main"))
            .await?;

        let main = Branch::new_main(&session_id, &pane_id, &transcript);

        let viewer_port = self.start_viewer(&session_id, &mux_name, &pane_id).await?;

        let now = Utc::now();
        let session = Session {
            id: session_id.clone(),
            project_path: project_path.to_string(),
            name,
            status: SessionStatus::Active,
            created_at: now,
            last_activity: now,
            mux_session_name: mux_name,
            viewer_port,
            main,
            forks: Vec::new(),
            last_error: None,
        };

        self.entries
            .insert(session_id.clone(), Arc::new(Mutex::new(session.clone())));
        self.persist_project(project_path).await?;
        self.record_event(
            project_path,
            Self::event(&session_id, "created", format!("session '{}' active", session.name), None),
        );
        tracing::info!(session = %session_id, mux = %session.mux_session_name, "session created");
        Ok(session)
    }

    /// Resumes a saved session: reattach when the mux session survived,
    /// otherwise recreate it with the AI CLI in resume mode, then
    /// reconcile the branch tree.
    pub async fn resume_session(&self, project_path: &str, session_id: &str) -> HelmResult<Session> {
        let entry = self.entry(session_id)?;
        let mut session = entry.lock().await;

        if session.project_path != project_path {
            return Err(HelmError::not_found(format!("session '{}'", session_id)));
        }
        if session.status == SessionStatus::Closed {
            return Err(HelmError::conflict("cannot resume a closed session"));
        }

        let mux_name = session.mux_session_name.clone();
        let alive = Self::retry_mux(|| self.mux.session_exists(&mux_name)).await?;

        if alive {
            self.reconcile_locked(&mut session).await?;
        } else {
            // Recreate the mux session and replay the AI CLI against the
            // persisted main transcript; forks need their own resume.
            let transcript = session.main.transcript_path.clone();
            let cwd = PathBuf::from(&session.project_path);
            let cmd = self.resume_cmd(&transcript);
            let pane_id =
                Self::retry_mux(|| self.mux.new_session(&mux_name, &cwd, &cmd)).await?;
            self.mux
                .set_pane_title(&pane_id, &pane_title(session_id, "main"))
                .await?;

            let mut tree = BranchTree::from_session(&session);
            tree.main_mut().mux_pane_id = pane_id;
            tree.main_mut().status = BranchStatus::Active;
            for fork in session.forks.iter() {
                if !fork.status.is_terminal() {
                    tree.set_status(&fork.id, BranchStatus::Saved)?;
                }
            }
            let (main, forks) = tree.to_parts();
            session.main = main;
            session.forks = forks;
            self.record_event(
                &session.project_path,
                Self::event(session_id, "recreated", "mux session recreated in resume mode".into(), None),
            );
        }

        let pane_for_viewer = session.main.mux_pane_id.clone();
        session.viewer_port = self
            .start_viewer(session_id, &mux_name, &pane_for_viewer)
            .await?;
        session.status = SessionStatus::Active;
        session.last_error = None;
        session.touch();

        let snapshot = session.clone();
        drop(session);
        self.persist_project(&snapshot.project_path).await?;
        tracing::info!(session = %session_id, "session resumed");
        Ok(snapshot)
    }

    /// Shuts down the viewer and saves the session; the mux session keeps
    /// running detached.
    pub async fn detach_session(&self, session_id: &str) -> HelmResult<Session> {
        let entry = self.entry(session_id)?;
        let mut session = entry.lock().await;

        if session.status != SessionStatus::Active {
            return Err(HelmError::conflict(format!(
                "cannot detach session in {} state",
                session.status
            )));
        }

        self.viewers.stop(session_id).await;
        session.viewer_port = None;
        session.status = SessionStatus::Saved;
        session.touch();

        let snapshot = session.clone();
        drop(session);
        self.persist_project(&snapshot.project_path).await?;
        tracing::info!(session = %session_id, "session detached");
        Ok(snapshot)
    }

    /// Kills viewer and mux session; terminal.
    pub async fn close_session(&self, session_id: &str) -> HelmResult<Session> {
        let entry = self.entry(session_id)?;
        let mut session = entry.lock().await;

        if session.status == SessionStatus::Closed {
            return Ok(session.clone());
        }

        self.viewers.stop(session_id).await;
        session.viewer_port = None;

        let mux_name = session.mux_session_name.clone();
        match Self::retry_mux(|| self.mux.kill_session(&mux_name)).await {
            Ok(()) | Err(HelmError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let mut tree = BranchTree::from_session(&session);
        let ids: Vec<String> = tree.iter().map(|b| b.id.clone()).collect();
        for id in ids {
            let status = tree.get(&id).map(|b| b.status);
            if let Some(status) = status {
                if !status.is_terminal() {
                    tree.set_status(&id, BranchStatus::Closed)?;
                }
            }
        }
        let (main, forks) = tree.to_parts();
        session.main = main;
        session.forks = forks;
        session.status = SessionStatus::Closed;
        session.touch();

        let snapshot = session.clone();
        drop(session);
        self.persist_project(&snapshot.project_path).await?;
        self.record_event(
            &snapshot.project_path,
            Self::event(session_id, "closed", "session closed".into(), None),
        );
        tracing::info!(session = %session_id, "session closed");
        Ok(snapshot)
    }

    // ------------------------------------------------------------------
    // Fork lifecycle
    // ------------------------------------------------------------------

    /// Splits a pane off the parent branch and launches the AI CLI fork
    /// command in it. At most one active child per parent.
    pub async fn create_fork(
        &self,
        session_id: &str,
        parent_branch_id: &str,
        name: &str,
        vertical: bool,
    ) -> HelmResult<Branch> {
        if name.trim().is_empty() {
            return Err(HelmError::validation("fork name cannot be empty"));
        }
        let entry = self.entry(session_id)?;
        let mut session = entry.lock().await;

        if session.status != SessionStatus::Active {
            return Err(HelmError::conflict(format!(
                "cannot fork a {} session",
                session.status
            )));
        }

        let tree = BranchTree::from_session(&session);
        let parent = tree
            .resolve(parent_branch_id)
            .ok_or_else(|| HelmError::not_found(format!("branch '{}'", parent_branch_id)))?
            .clone();
        if parent.status != BranchStatus::Active {
            return Err(HelmError::conflict(format!(
                "parent branch '{}' is {}",
                parent.name, parent.status
            )));
        }
        if let Some(sibling) = tree.active_child_of(&parent.id) {
            return Err(HelmError::conflict(format!(
                "parent branch '{}' already has an active fork '{}'",
                parent.name, sibling.name
            )));
        }

        self.record_event(
            &session.project_path,
            Self::event(session_id, "fork_intent", format!("forking '{}' from '{}'", name, parent.name), Some(parent.id.clone())),
        );

        let cwd = PathBuf::from(&session.project_path);
        let cmd = self.fork_cmd(&parent.transcript_path);
        let pane_id = Self::retry_mux(|| {
            self.mux.split_pane(&parent.mux_pane_id, vertical, &cwd, &cmd)
        })
        .await?;
        self.mux
            .set_pane_title(&pane_id, &pane_title(session_id, name))
            .await?;

        let transcript = self
            .store
            .transcript_path(&session.project_path, session_id, name)
            .to_string_lossy()
            .to_string();
        let branch = Branch::new_fork(session_id, &parent.id, name, &pane_id, &transcript);

        let mut tree = BranchTree::from_session(&session);
        tree.add_child(&parent.id, branch.clone())?;
        let (main, forks) = tree.to_parts();
        session.main = main;
        session.forks = forks;
        session.touch();

        let snapshot = session.clone();
        drop(session);
        self.persist_project(&snapshot.project_path).await?;
        self.record_event(
            &snapshot.project_path,
            Self::event(session_id, "forked", format!("fork '{}' active", branch.name), Some(branch.id.clone())),
        );
        tracing::info!(session = %session_id, fork = %branch.name, "fork created");
        Ok(branch)
    }

    /// Captures the fork's transcript, injects a framed summary into the
    /// parent pane, marks the fork merged, and kills its pane.
    pub async fn merge_fork(&self, session_id: &str, branch_id: &str) -> HelmResult<Branch> {
        let entry = self.entry(session_id)?;
        let mut session = entry.lock().await;

        let tree = BranchTree::from_session(&session);
        let branch = tree
            .resolve(branch_id)
            .ok_or_else(|| HelmError::not_found(format!("branch '{}'", branch_id)))?
            .clone();
        if branch.is_main() {
            return Err(HelmError::conflict("main branch cannot be merged"));
        }
        if branch.status != BranchStatus::Active {
            return Err(HelmError::conflict(format!(
                "cannot merge a {} branch",
                branch.status
            )));
        }
        let parent_id = branch.parent_id.clone().unwrap_or_default();
        let parent = tree
            .get(&parent_id)
            .ok_or_else(|| HelmError::not_found(format!("branch '{}'", parent_id)))?
            .clone();

        // Capture the final transcript before the pane dies.
        let history =
            Self::retry_mux(|| self.mux.capture_history(&branch.mux_pane_id)).await?;
        let transcript_path = Path::new(&branch.transcript_path);
        self.store.append_transcript(transcript_path, &history)?;

        let framed = frame_merge_message(
            &branch.name,
            &history,
            self.config.merge_summary_lines,
        );
        Self::retry_mux(|| self.mux.send_keys(&parent.mux_pane_id, &framed, true)).await?;

        match self.mux.kill_pane(&branch.mux_pane_id).await {
            Ok(()) | Err(HelmError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let mut tree = BranchTree::from_session(&session);
        tree.set_status(&branch.id, BranchStatus::Merged)?;
        let (main, forks) = tree.to_parts();
        session.main = main;
        session.forks = forks;
        session.touch();

        let merged = session
            .forks
            .iter()
            .find(|b| b.id == branch.id)
            .cloned()
            .unwrap_or(branch);
        let snapshot = session.clone();
        drop(session);
        self.persist_project(&snapshot.project_path).await?;
        self.record_event(
            &snapshot.project_path,
            Self::event(session_id, "merged", format!("fork '{}' merged into '{}'", merged.name, parent.name), Some(merged.id.clone())),
        );
        tracing::info!(session = %session_id, fork = %merged.name, "fork merged");
        Ok(merged)
    }

    /// Writes a self-contained transcript artifact; tree state untouched.
    pub async fn export_fork(
        &self,
        session_id: &str,
        branch_id: &str,
        name: Option<String>,
    ) -> HelmResult<PathBuf> {
        let entry = self.entry(session_id)?;
        let session = entry.lock().await;

        let tree = BranchTree::from_session(&session);
        let branch = tree
            .resolve(branch_id)
            .ok_or_else(|| HelmError::not_found(format!("branch '{}'", branch_id)))?
            .clone();

        // Refresh the transcript from the live pane when there is one.
        if !branch.status.is_terminal() {
            if let Ok(history) =
                Self::retry_mux(|| self.mux.capture_history(&branch.mux_pane_id)).await
            {
                self.store
                    .append_transcript(Path::new(&branch.transcript_path), &history)?;
            }
        }
        let body = self
            .store
            .read_transcript(Path::new(&branch.transcript_path))?;

        let artifact_name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| {
                format!(
                    "{}-{}-{}",
                    session.name,
                    branch.name,
                    Utc::now().format("%Y%m%dT%H%M%SZ")
                )
            });
        let artifact_path = self.config.exports_dir.join(format!("{}.log", artifact_name));

        let header = format!(
            "# cchelm transcript export\n# project: {}\n# session: {} ({})\n# branch: {} ({})\n# exported: {}\n\n",
            session.project_path,
            session.name,
            session.id,
            branch.name,
            branch.id,
            Utc::now().to_rfc3339(),
        );
        std::fs::create_dir_all(&self.config.exports_dir)?;
        std::fs::write(&artifact_path, format!("{}{}", header, body))?;

        tracing::info!(session = %session_id, branch = %branch.name, path = %artifact_path.display(), "fork exported");
        Ok(artifact_path)
    }

    /// Marks a fork closed and kills its pane; its parent becomes
    /// eligible for a new active fork.
    pub async fn close_fork(&self, session_id: &str, branch_id: &str) -> HelmResult<Branch> {
        let entry = self.entry(session_id)?;
        let mut session = entry.lock().await;

        let tree = BranchTree::from_session(&session);
        let branch = tree
            .resolve(branch_id)
            .ok_or_else(|| HelmError::not_found(format!("branch '{}'", branch_id)))?
            .clone();
        if branch.is_main() {
            return Err(HelmError::conflict(
                "main branch cannot be closed while its session is active",
            ));
        }
        if branch.status.is_terminal() {
            return Ok(branch);
        }

        match self.mux.kill_pane(&branch.mux_pane_id).await {
            Ok(()) | Err(HelmError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let mut tree = BranchTree::from_session(&session);
        tree.set_status(&branch.id, BranchStatus::Closed)?;
        let (main, forks) = tree.to_parts();
        session.main = main;
        session.forks = forks;
        session.touch();

        let closed = session
            .forks
            .iter()
            .find(|b| b.id == branch.id)
            .cloned()
            .unwrap_or(branch);
        let snapshot = session.clone();
        drop(session);
        self.persist_project(&snapshot.project_path).await?;
        tracing::info!(session = %session_id, fork = %closed.name, "fork closed");
        Ok(closed)
    }

    /// Focuses a branch's pane (drives UI focus).
    pub async fn select_branch(&self, session_id: &str, branch_id: &str) -> HelmResult<()> {
        let entry = self.entry(session_id)?;
        let mut session = entry.lock().await;

        let tree = BranchTree::from_session(&session);
        let branch = tree
            .resolve(branch_id)
            .ok_or_else(|| HelmError::not_found(format!("branch '{}'", branch_id)))?
            .clone();
        if branch.status.is_terminal() {
            return Err(HelmError::conflict(format!(
                "branch '{}' is {} and not selectable",
                branch.name, branch.status
            )));
        }

        Self::retry_mux(|| self.mux.select_pane(&branch.mux_pane_id)).await?;
        session.touch();
        Ok(())
    }

    /// The currently relevant branch: the deepest active branch in the
    /// fork chain, falling back to main.
    pub async fn active_branch(&self, session_id: &str) -> HelmResult<Branch> {
        let entry = self.entry(session_id)?;
        let session = entry.lock().await;
        let tree = BranchTree::from_session(&session);
        let active = tree
            .walk()
            .into_iter()
            .filter(|b| b.status == BranchStatus::Active)
            .next_back()
            .cloned();
        active.ok_or_else(|| HelmError::not_found(format!("active branch of '{}'", session_id)))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn get_session(&self, session_id: &str) -> HelmResult<Session> {
        let entry = self.entry(session_id)?;
        let session = entry.lock().await;
        Ok(session.clone())
    }

    pub async fn list_sessions(&self, project_path: &str) -> Vec<Session> {
        let mut out = Vec::new();
        for entry in self.entries.iter() {
            let session = entry.value().lock().await;
            if session.project_path == project_path {
                out.push(session.clone());
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Resolves the pane bound to a session+branch pair (hook routing,
    /// agent connect).
    pub async fn resolve_pane(&self, session_id: &str, branch_id: &str) -> HelmResult<Branch> {
        let entry = self.entry(session_id)?;
        let session = entry.lock().await;
        let tree = BranchTree::from_session(&session);
        tree.resolve(branch_id)
            .cloned()
            .ok_or_else(|| HelmError::not_found(format!("branch '{}'", branch_id)))
    }

    // ------------------------------------------------------------------
    // Reconciliation & recovery
    // ------------------------------------------------------------------

    /// Diffs the branch tree against the multiplexer's actual panes.
    pub async fn reconcile(&self, session_id: &str) -> HelmResult<Session> {
        let entry = self.entry(session_id)?;
        let mut session = entry.lock().await;
        self.reconcile_locked(&mut session).await?;
        let snapshot = session.clone();
        drop(session);
        self.persist_project(&snapshot.project_path).await?;
        Ok(snapshot)
    }

    async fn reconcile_locked(&self, session: &mut Session) -> HelmResult<()> {
        if session.status == SessionStatus::Closed {
            return Ok(());
        }
        let mux_name = session.mux_session_name.clone();
        let session_id = session.id.clone();
        let project_path = session.project_path.clone();

        let panes = match Self::retry_mux(|| self.mux.list_panes(&mux_name)).await {
            Ok(panes) => panes,
            Err(HelmError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let live_ids: std::collections::HashSet<&str> =
            panes.iter().map(|p| p.pane_id.as_str()).collect();

        let mut tree = BranchTree::from_session(session);

        // Demote branches whose pane disappeared.
        let known: Vec<(String, String, BranchStatus, String)> = tree
            .iter()
            .map(|b| (b.id.clone(), b.name.clone(), b.status, b.mux_pane_id.clone()))
            .collect();
        let mut known_panes: std::collections::HashSet<String> = std::collections::HashSet::new();
        for (id, name, status, pane) in &known {
            known_panes.insert(pane.clone());
            if *status == BranchStatus::Active && !live_ids.contains(pane.as_str()) {
                tree.set_status(id, BranchStatus::Saved)?;
                self.record_event(
                    &project_path,
                    Self::event(
                        &session_id,
                        "drift",
                        format!("pane {} for branch '{}' vanished, demoted to saved", pane, name),
                        Some(id.clone()),
                    ),
                );
            }
        }

        // Adopt unknown panes that follow our title convention; warn and
        // leave the rest alone.
        let main_id = tree.main().id.clone();
        for pane in &panes {
            if known_panes.contains(&pane.pane_id) {
                continue;
            }
            match parse_pane_title(&pane.title) {
                Some((sid, bname)) if sid == session_id => {
                    let transcript = self
                        .store
                        .transcript_path(&project_path, &session_id, &bname)
                        .to_string_lossy()
                        .to_string();
                    let mut adopted =
                        Branch::new_fork(&session_id, &main_id, &bname, &pane.pane_id, &transcript);
                    adopted.status = BranchStatus::Saved;
                    tree.add_child(&main_id, adopted.clone())?;
                    self.record_event(
                        &project_path,
                        Self::event(
                            &session_id,
                            "adopted",
                            format!("adopted orphan pane {} as branch '{}'", pane.pane_id, bname),
                            Some(adopted.id),
                        ),
                    );
                }
                _ => {
                    self.record_event(
                        &project_path,
                        Self::event(
                            &session_id,
                            "warning",
                            format!("unrecognized pane {} ('{}') left alone", pane.pane_id, pane.title),
                            None,
                        ),
                    );
                }
            }
        }

        let (main, forks) = tree.to_parts();
        session.main = main;
        session.forks = forks;

        // A session whose mux vanished entirely can only be saved.
        if panes.is_empty() && session.status == SessionStatus::Active {
            self.viewers.stop(&session_id).await;
            session.viewer_port = None;
            session.status = SessionStatus::Saved;
            self.record_event(
                &project_path,
                Self::event(&session_id, "drift", "mux session vanished, saved".into(), None),
            );
        }
        Ok(())
    }

    /// Called when a viewer exhausts its restart budget.
    pub async fn viewer_failed(&self, session_id: &str, error: &str) -> HelmResult<()> {
        let entry = self.entry(session_id)?;
        let mut session = entry.lock().await;
        if let Some(port) = session.viewer_port.take() {
            self.ports.release(port);
        }
        session.last_error = Some(error.to_string());
        session.touch();
        let snapshot = session.clone();
        drop(session);
        self.persist_project(&snapshot.project_path).await?;
        tracing::warn!(session = %session_id, error, "viewer gave up");
        Ok(())
    }

    /// Rebuilds in-memory state from disk and heals drift: one pass at
    /// startup.
    pub async fn recover(&self) -> HelmResult<usize> {
        let docs = self.store.scan_states();
        let mut recovered = 0;

        for doc in docs {
            self.projects.adopt(doc.project.clone()).await?;
            for mut session in doc.sessions {
                let session_id = session.id.clone();
                // Ports and viewers do not survive a restart.
                session.viewer_port = None;
                let was_active = session.status == SessionStatus::Active;
                if was_active {
                    session.status = SessionStatus::Saved;
                }
                self.entries
                    .insert(session_id.clone(), Arc::new(Mutex::new(session.clone())));

                if session.status != SessionStatus::Closed {
                    if let Err(e) = self.reconcile(&session_id).await {
                        tracing::warn!(session = %session_id, error = %e, "recovery reconcile failed");
                        continue;
                    }
                    if was_active {
                        // Bring the viewer back when the panes survived.
                        match self.resume_session(&session.project_path, &session_id).await {
                            Ok(_) => recovered += 1,
                            Err(e) => {
                                tracing::warn!(session = %session_id, error = %e, "recovery resume failed");
                            }
                        }
                    }
                }
            }
        }
        tracing::info!(recovered, "session recovery complete");
        Ok(recovered)
    }

    /// Graceful shutdown: detach viewers and persist everything as saved;
    /// panes live on inside the multiplexer.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Ok(entry) = self.entry(&id) {
                let mut session = entry.lock().await;
                if session.status == SessionStatus::Active {
                    self.viewers.stop(&id).await;
                    session.viewer_port = None;
                    session.status = SessionStatus::Saved;
                    session.touch();
                    let project = session.project_path.clone();
                    drop(session);
                    if let Err(e) = self.persist_project(&project).await {
                        tracing::warn!(session = %id, error = %e, "shutdown persist failed");
                    }
                }
            }
        }
    }
}

/// Framed message injected into the parent pane on merge. Format:
///
/// ```text
/// [fork "<name>" merged <RFC3339>]
/// <trailing transcript lines>
/// [end fork "<name>"]
/// ```
fn frame_merge_message(fork_name: &str, transcript: &str, summary_lines: usize) -> String {
    let mut tail: Vec<&str> = transcript
        .lines()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .take(summary_lines)
        .collect();
    tail.reverse();

    format!(
        "[fork \"{}\" merged {}]\n{}\n[end fork \"{}\"]",
        fork_name,
        Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        tail.join("\n"),
        fork_name
    )
}
