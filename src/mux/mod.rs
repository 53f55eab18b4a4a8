use async_trait::async_trait;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::{HelmError, HelmResult};

/// Control keys sent through enumerated opcodes, never as raw escape
/// sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKey {
    Enter,
    CtrlC,
    Escape,
}

impl ControlKey {
    /// The tmux key name for this opcode.
    pub fn key_name(&self) -> &'static str {
        match self {
            ControlKey::Enter => "Enter",
            ControlKey::CtrlC => "C-c",
            ControlKey::Escape => "Escape",
        }
    }
}

/// One pane as reported by the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneInfo {
    pub pane_id: String,
    pub title: String,
    pub pid: Option<u32>,
    pub active: bool,
}

/// Typed wrapper over the terminal multiplexer CLI.
///
/// Every method takes explicit arguments and returns a typed error; all
/// shelling-out lives behind this trait. The production implementation is
/// [`TmuxDriver`]; tests substitute an in-memory fake.
#[async_trait]
pub trait MuxDriver: Send + Sync {
    /// Creates a detached session running `initial_cmd` in `cwd` and
    /// returns the id of its first pane.
    async fn new_session(
        &self,
        name: &str,
        cwd: &Path,
        initial_cmd: &[String],
    ) -> HelmResult<String>;

    /// Splits a new pane off `parent_pane_id`, running `initial_cmd` in
    /// `cwd`, and returns the new pane id.
    async fn split_pane(
        &self,
        parent_pane_id: &str,
        vertical: bool,
        cwd: &Path,
        initial_cmd: &[String],
    ) -> HelmResult<String>;

    /// Sends literal text to a pane, optionally followed by Enter.
    async fn send_keys(&self, pane_id: &str, text: &str, press_enter: bool) -> HelmResult<()>;

    /// Sends a single control key to a pane.
    async fn send_control(&self, pane_id: &str, key: ControlKey) -> HelmResult<()>;

    /// Captures the last `last_n` lines of a pane's buffer.
    async fn capture_pane(&self, pane_id: &str, last_n: usize) -> HelmResult<String>;

    /// Captures a pane's entire scrollback history.
    async fn capture_history(&self, pane_id: &str) -> HelmResult<String>;

    /// Lists every pane of a session.
    async fn list_panes(&self, session_name: &str) -> HelmResult<Vec<PaneInfo>>;

    /// Focuses a pane.
    async fn select_pane(&self, pane_id: &str) -> HelmResult<()>;

    /// Stamps a pane title (used by the reconcile adoption convention).
    async fn set_pane_title(&self, pane_id: &str, title: &str) -> HelmResult<()>;

    async fn kill_pane(&self, pane_id: &str) -> HelmResult<()>;

    async fn kill_session(&self, name: &str) -> HelmResult<()>;

    async fn session_exists(&self, name: &str) -> HelmResult<bool>;

    /// The currently active pane of a session.
    async fn active_pane_of(&self, session_name: &str) -> HelmResult<String>;

    /// Whether the multiplexer server answers at all.
    async fn server_alive(&self) -> bool;
}

/// tmux-backed [`MuxDriver`].
///
/// Invocations are serialized per target (session name for session-scoped
/// operations, pane id otherwise) so concurrent callers never interleave
/// commands against the same terminal. Each invocation carries a deadline.
pub struct TmuxDriver {
    command_timeout: Duration,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TmuxDriver {
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            command_timeout,
            locks: DashMap::new(),
        }
    }

    /// Session names tmux will accept as a `-t` target without surprises.
    pub fn validate_session_name(name: &str) -> HelmResult<()> {
        if name.is_empty() {
            return Err(HelmError::validation("session name cannot be empty"));
        }
        if name.contains(':') || name.contains('.') {
            return Err(HelmError::validation(
                "session name cannot contain ':' or '.' characters",
            ));
        }
        Ok(())
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Runs one tmux invocation under the target's lock and maps the
    /// outcome to a typed error.
    async fn run(&self, lock_key: &str, args: &[&str]) -> HelmResult<String> {
        let lock = self.lock_for(lock_key);
        let _guard = lock.lock().await;

        let invocation = args.first().copied().unwrap_or("tmux");
        let output = tokio::time::timeout(
            self.command_timeout,
            Command::new("tmux").args(args).output(),
        )
        .await
        .map_err(|_| HelmError::Timeout(format!("tmux {}", invocation)))?
        .map_err(|e| HelmError::BackendUnavailable(format!("tmux not runnable: {}", e)))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_tmux_failure(&stderr))
    }
}

/// Maps a tmux stderr line to an error kind.
fn classify_tmux_failure(stderr: &str) -> HelmError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("no server running") || lowered.contains("error connecting") {
        HelmError::BackendUnavailable(format!("tmux server: {}", stderr))
    } else if lowered.contains("duplicate session") {
        HelmError::AlreadyExists(format!("mux session ({})", stderr))
    } else if lowered.contains("can't find session")
        || lowered.contains("can't find pane")
        || lowered.contains("can't find window")
        || lowered.contains("no such session")
        || lowered.contains("session not found")
    {
        HelmError::NotFound(format!("mux target ({})", stderr))
    } else {
        HelmError::Internal(format!("tmux protocol: {}", stderr))
    }
}

/// Joins a command vector into one shell line, single-quoting every
/// argument so paths and prompts survive tmux's `sh -c`.
fn shell_join(cmd: &[String]) -> String {
    cmd.iter()
        .map(|arg| {
            if arg.is_empty() {
                "''".to_string()
            } else if arg
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+".contains(c))
            {
                arg.clone()
            } else {
                format!("'{}'", arg.replace('\'', "'\\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

const PANE_FORMAT: &str = "#{pane_id}|#{pane_title}|#{pane_pid}|#{pane_active}";

fn parse_pane_line(line: &str) -> Option<PaneInfo> {
    let parts: Vec<&str> = line.splitn(4, '|').collect();
    if parts.len() < 4 {
        return None;
    }
    Some(PaneInfo {
        pane_id: parts[0].to_string(),
        title: parts[1].to_string(),
        pid: parts[2].parse().ok(),
        active: parts[3] == "1",
    })
}

#[async_trait]
impl MuxDriver for TmuxDriver {
    async fn new_session(
        &self,
        name: &str,
        cwd: &Path,
        initial_cmd: &[String],
    ) -> HelmResult<String> {
        Self::validate_session_name(name)?;
        let cwd = cwd.to_string_lossy().to_string();
        let command = shell_join(initial_cmd);
        let mut args = vec![
            "new-session",
            "-d",
            "-s",
            name,
            "-c",
            cwd.as_str(),
            "-P",
            "-F",
            "#{pane_id}",
        ];
        if !command.is_empty() {
            args.push(command.as_str());
        }
        let stdout = self.run(name, &args).await?;
        Ok(stdout.trim().to_string())
    }

    async fn split_pane(
        &self,
        parent_pane_id: &str,
        vertical: bool,
        cwd: &Path,
        initial_cmd: &[String],
    ) -> HelmResult<String> {
        let cwd = cwd.to_string_lossy().to_string();
        let command = shell_join(initial_cmd);
        let direction = if vertical { "-v" } else { "-h" };
        let mut args = vec![
            "split-window",
            "-d",
            direction,
            "-t",
            parent_pane_id,
            "-c",
            cwd.as_str(),
            "-P",
            "-F",
            "#{pane_id}",
        ];
        if !command.is_empty() {
            args.push(command.as_str());
        }
        let stdout = self.run(parent_pane_id, &args).await?;
        Ok(stdout.trim().to_string())
    }

    async fn send_keys(&self, pane_id: &str, text: &str, press_enter: bool) -> HelmResult<()> {
        // Literal mode: tmux performs no key-name interpretation on the
        // payload, so prompts containing "Enter" or "C-c" stay text.
        self.run(pane_id, &["send-keys", "-t", pane_id, "-l", "--", text])
            .await?;
        if press_enter {
            self.send_control(pane_id, ControlKey::Enter).await?;
        }
        Ok(())
    }

    async fn send_control(&self, pane_id: &str, key: ControlKey) -> HelmResult<()> {
        self.run(pane_id, &["send-keys", "-t", pane_id, key.key_name()])
            .await?;
        Ok(())
    }

    async fn capture_pane(&self, pane_id: &str, last_n: usize) -> HelmResult<String> {
        let start = format!("-{}", last_n);
        let stdout = self
            .run(
                pane_id,
                &["capture-pane", "-p", "-t", pane_id, "-S", start.as_str()],
            )
            .await?;
        Ok(stdout)
    }

    async fn capture_history(&self, pane_id: &str) -> HelmResult<String> {
        let stdout = self
            .run(pane_id, &["capture-pane", "-p", "-t", pane_id, "-S", "-"])
            .await?;
        Ok(stdout)
    }

    async fn list_panes(&self, session_name: &str) -> HelmResult<Vec<PaneInfo>> {
        let stdout = self
            .run(
                session_name,
                &["list-panes", "-s", "-t", session_name, "-F", PANE_FORMAT],
            )
            .await?;
        Ok(stdout.lines().filter_map(parse_pane_line).collect())
    }

    async fn select_pane(&self, pane_id: &str) -> HelmResult<()> {
        self.run(pane_id, &["select-pane", "-t", pane_id]).await?;
        Ok(())
    }

    async fn set_pane_title(&self, pane_id: &str, title: &str) -> HelmResult<()> {
        self.run(pane_id, &["select-pane", "-t", pane_id, "-T", title])
            .await?;
        Ok(())
    }

    async fn kill_pane(&self, pane_id: &str) -> HelmResult<()> {
        self.run(pane_id, &["kill-pane", "-t", pane_id]).await?;
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> HelmResult<()> {
        self.run(name, &["kill-session", "-t", name]).await?;
        Ok(())
    }

    async fn session_exists(&self, name: &str) -> HelmResult<bool> {
        match self.run(name, &["has-session", "-t", name]).await {
            Ok(_) => Ok(true),
            Err(HelmError::NotFound(_)) => Ok(false),
            // has-session reports a missing session as a plain error on
            // older tmux; treat any protocol failure as "not there".
            Err(HelmError::Internal(_)) => Ok(false),
            Err(e) => Err(e),
        }
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
        Command::new("tmux")
            .args(["list-sessions"])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}
