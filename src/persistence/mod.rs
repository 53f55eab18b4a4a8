use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use walkdir::WalkDir;

use crate::error::{HelmError, HelmResult};
use crate::project::Project;
use crate::session::Session;

/// Current on-disk schema version. Loads of older documents are
/// default-filled; newer documents are refused as corrupt.
pub const STATE_VERSION: u32 = 2;

/// Per-project persisted document: `<root>/<slug>/state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDocument {
    pub version: u32,
    pub project: Project,
    #[serde(default)]
    pub sessions: Vec<Session>,
}

/// On-disk JSON document store.
///
/// Layout:
///
/// ```text
/// <root>/<projectSlug>/state.json
/// <root>/<projectSlug>/events.jsonl
/// <root>/<projectSlug>/transcripts/<sessionId>/<branchId>.log
/// <root>/projects.json
/// <root>/agents.json
/// <root>/agents/<agentId>/logs.jsonl
/// ```
///
/// All writes go through write-to-temp + fsync + atomic rename, serialized
/// per project inside the process. Last writer wins; concurrent external
/// editors are out of scope.
pub struct PersistenceStore {
    root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PersistenceStore {
    pub fn new(root: impl Into<PathBuf>) -> HelmResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            locks: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem-safe directory name for a project path. The real path
    /// is stored inside the document; the slug only has to be stable and
    /// collision-resistant enough for one workstation.
    pub fn project_slug(project_path: &str) -> String {
        let trimmed = project_path.trim_matches('/');
        let slug: String = trimmed
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        if slug.is_empty() {
            "root".to_string()
        } else {
            slug
        }
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn project_dir(&self, project_path: &str) -> PathBuf {
        self.root.join(Self::project_slug(project_path))
    }

    fn state_path(&self, project_path: &str) -> PathBuf {
        self.project_dir(project_path).join("state.json")
    }

    pub fn transcript_path(
        &self,
        project_path: &str,
        session_id: &str,
        branch_id: &str,
    ) -> PathBuf {
        self.project_dir(project_path)
            .join("transcripts")
            .join(session_id)
            .join(format!("{}.log", branch_id))
    }

    /// Persists one project's state document.
    pub async fn save_state(&self, doc: &StateDocument) -> HelmResult<()> {
        let slug = Self::project_slug(&doc.project.path);
        let lock = self.lock_for(&slug);
        let _guard = lock.lock().await;

        let path = self.state_path(&doc.project.path);
        let bytes = serde_json::to_vec_pretty(doc)
            .map_err(|e| HelmError::internal(format!("encode state: {}", e)))?;
        atomic_write(&path, &bytes)
    }

    /// Loads one project's state document, enforcing the version gate.
    pub async fn load_state(&self, project_path: &str) -> HelmResult<Option<StateDocument>> {
        let path = self.state_path(project_path);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        Ok(Some(decode_state(&raw, &path)?))
    }

    /// Removes a project's directory (state, events, transcripts).
    pub async fn remove_project(&self, project_path: &str) -> HelmResult<()> {
        let slug = Self::project_slug(project_path);
        let lock = self.lock_for(&slug);
        let _guard = lock.lock().await;

        let dir = self.project_dir(project_path);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Enumerates every persisted project state for crash recovery.
    pub fn scan_states(&self) -> Vec<StateDocument> {
        let mut docs = Vec::new();
        for entry in WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_name() != "state.json" {
                continue;
            }
            match fs::read_to_string(entry.path()) {
                Ok(raw) => match decode_state(&raw, entry.path()) {
                    Ok(doc) => docs.push(doc),
                    Err(e) => {
                        tracing::warn!(path = %entry.path().display(), error = %e,
                            "skipping unreadable project state");
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e,
                        "skipping unreadable project state");
                }
            }
        }
        docs
    }

    /// Appends raw text to a branch transcript, creating parents.
    pub fn append_transcript(&self, path: &Path, text: &str) -> HelmResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(text.as_bytes())?;
        if !text.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        Ok(())
    }

    pub fn read_transcript(&self, path: &Path) -> HelmResult<String> {
        if !path.exists() {
            return Ok(String::new());
        }
        Ok(fs::read_to_string(path)?)
    }

    /// Appends one JSON line to an append-only event sink.
    pub fn append_jsonl<T: Serialize>(&self, path: &Path, value: &T) -> HelmResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(value)
            .map_err(|e| HelmError::internal(format!("encode event: {}", e)))?;
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Reads up to `limit` trailing entries from a jsonl sink.
    pub fn read_jsonl<T: DeserializeOwned>(&self, path: &Path, limit: usize) -> HelmResult<Vec<T>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(path)?;
        let mut out: Vec<T> = raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        if out.len() > limit {
            out.drain(..out.len() - limit);
        }
        Ok(out)
    }

    pub fn truncate_file(&self, path: &Path) -> HelmResult<()> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Generic atomic JSON write for catalogs (projects, agents).
    pub async fn write_catalog<T: Serialize>(&self, name: &str, value: &T) -> HelmResult<()> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| HelmError::internal(format!("encode {}: {}", name, e)))?;
        atomic_write(&self.root.join(name), &bytes)
    }

    pub async fn read_catalog<T: DeserializeOwned>(&self, name: &str) -> HelmResult<Option<T>> {
        let path = self.root.join(name);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        serde_json::from_str(&raw).map(Some).map_err(|e| {
            HelmError::CorruptState(format!("{}: {}", name, e))
        })
    }

    pub fn events_path(&self, project_path: &str) -> PathBuf {
        self.project_dir(project_path).join("events.jsonl")
    }

    pub fn agent_log_path(&self, agent_id: &str) -> PathBuf {
        self.root.join("agents").join(agent_id).join("logs.jsonl")
    }
}

/// Write-to-temp + fsync + rename into place.
fn atomic_write(path: &Path, bytes: &[u8]) -> HelmResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| HelmError::internal("state path has no parent"))?;
    fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| HelmError::Io(e.error))?;
    Ok(())
}

/// Decodes a state document, handling the version gate: missing version
/// is treated as 1 (additive fields default-filled); versions beyond the
/// current schema refuse to load.
fn decode_state(raw: &str, path: &Path) -> HelmResult<StateDocument> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| HelmError::CorruptState(format!("{}: {}", path.display(), e)))?;

    let version = value.get("version").and_then(|v| v.as_u64()).unwrap_or(1) as u32;
    if version > STATE_VERSION {
        return Err(HelmError::CorruptState(format!(
            "{}: schema version {} is newer than supported {}",
            path.display(),
            version,
            STATE_VERSION
        )));
    }

    let mut doc: StateDocument = serde_json::from_value(value)
        .map_err(|e| HelmError::CorruptState(format!("{}: {}", path.display(), e)))?;
    doc.version = STATE_VERSION;
    Ok(doc)
}
