pub mod manager;
pub mod tree;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use manager::SessionManager;
pub use tree::BranchTree;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Pane tree live, viewer bound.
    Active,
    /// Persisted and detached; the mux session may or may not survive.
    Saved,
    /// Terminal: mux session and viewer gone.
    Closed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Saved => write!(f, "saved"),
            SessionStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Lifecycle of a branch within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchStatus {
    Active,
    Saved,
    Closed,
    Merged,
}

impl BranchStatus {
    /// Closed and merged branches never come back.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BranchStatus::Closed | BranchStatus::Merged)
    }
}

impl std::fmt::Display for BranchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BranchStatus::Active => write!(f, "active"),
            BranchStatus::Saved => write!(f, "saved"),
            BranchStatus::Closed => write!(f, "closed"),
            BranchStatus::Merged => write!(f, "merged"),
        }
    }
}

/// One conversation thread of a session, bound to a mux pane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub id: String,
    pub session_id: String,
    pub name: String,
    /// `None` marks the main branch.
    pub parent_id: Option<String>,
    pub status: BranchStatus,
    pub mux_pane_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub transcript_path: String,
}

impl Branch {
    pub fn new_main(session_id: &str, mux_pane_id: &str, transcript_path: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            name: "main".to_string(),
            parent_id: None,
            status: BranchStatus::Active,
            mux_pane_id: mux_pane_id.to_string(),
            created_at: now,
            last_activity: now,
            transcript_path: transcript_path.to_string(),
        }
    }

    pub fn new_fork(
        session_id: &str,
        parent_id: &str,
        name: &str,
        mux_pane_id: &str,
        transcript_path: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            name: name.to_string(),
            parent_id: Some(parent_id.to_string()),
            status: BranchStatus::Active,
            mux_pane_id: mux_pane_id.to_string(),
            created_at: now,
            last_activity: now,
            transcript_path: transcript_path.to_string(),
        }
    }

    pub fn is_main(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// One top-level AI CLI conversation bound to a project directory,
/// hosted in one mux session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub project_path: String,
    pub name: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Unique per host; doubles as the tmux target.
    pub mux_session_name: String,
    /// Assigned iff the session is active and a viewer is configured.
    pub viewer_port: Option<u16>,
    pub main: Branch,
    pub forks: Vec<Branch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Session {
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// All branches, main first.
    pub fn branches(&self) -> impl Iterator<Item = &Branch> {
        std::iter::once(&self.main).chain(self.forks.iter())
    }
}

/// Derives the unique mux session name for a new session: a recognizable
/// prefix, the user-facing name, and an id fragment for uniqueness.
pub fn mux_session_name(name: &str, session_id: &str) -> String {
    let slug: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let fragment = &session_id[..session_id.len().min(8)];
    format!("cchelm-{}-{}", slug, fragment)
}

/// Pane title under which a branch is discoverable during reconcile.
pub fn pane_title(session_id: &str, branch_name: &str) -> String {
    format!("cchelm:{}:{}", session_id, branch_name)
}

/// Inverse of [`pane_title`]; returns `(session_id, branch_name)` when the
/// title follows the convention.
pub fn parse_pane_title(title: &str) -> Option<(String, String)> {
    let rest = title.strip_prefix("cchelm:")?;
    let (session_id, branch_name) = rest.split_once(':')?;
    if session_id.is_empty() || branch_name.is_empty() {
        return None;
    }
    Some((session_id.to_string(), branch_name.to_string()))
}
