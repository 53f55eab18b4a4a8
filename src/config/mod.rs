use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, collected once at startup.
///
/// Every field is driven by an environment variable with a documented
/// default so a bare `cchelm serve` works on a workstation with tmux and
/// the AI CLI on PATH. The struct is serde-derived so `serve --dump-config`
/// can echo the effective configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelmConfig {
    /// Root directory for persisted state (`CCHELM_STORAGE_ROOT`,
    /// default `$HOME/.cchelm`).
    pub storage_root: PathBuf,

    /// API listen address (`CCHELM_BIND`, default `127.0.0.1:7433`).
    pub bind_addr: SocketAddr,

    /// Inclusive viewer port pool bounds
    /// (`CCHELM_PORT_MIN`/`CCHELM_PORT_MAX`, default 7500..=7599).
    pub min_port: u16,
    pub max_port: u16,

    /// HTTP terminal viewer binary (`CCHELM_VIEWER_CMD`). Unset means
    /// headless mode: sessions run without a viewer and carry no port.
    pub viewer_command: Option<String>,

    /// AI CLI binary launched in each pane (`CCHELM_AGENT_CMD`,
    /// default `claude`).
    pub agent_command: String,

    /// Pass-through flag inserted before the transcript path when
    /// resuming (`CCHELM_AGENT_RESUME_FLAG`, default `--resume`).
    pub agent_resume_flag: String,

    /// Pass-through flag appended when launching a fork pane
    /// (`CCHELM_AGENT_FORK_FLAG`, default `--fork-session`).
    pub agent_fork_flag: String,

    /// Chat-completion endpoint for the decision policy
    /// (`CCHELM_POLICY_URL`).
    pub policy_endpoint: String,

    /// Bearer key for the policy endpoint (`CCHELM_POLICY_KEY`).
    pub policy_api_key: Option<String>,

    /// Model name sent to the policy endpoint (`CCHELM_POLICY_MODEL`,
    /// default `gpt-4o-mini`).
    pub policy_model: String,

    /// Outbound webhook for human alerts (`CCHELM_NOTIFY_WEBHOOK`).
    /// Unset routes notifications to the log.
    pub notify_webhook: Option<String>,

    /// Directory for exported fork transcripts (`CCHELM_EXPORTS_DIR`,
    /// default `<storage_root>/exports`).
    pub exports_dir: PathBuf,

    /// Pane lines captured per cycle (`CCHELM_CAPTURE_LINES`, default 200).
    pub capture_lines: usize,

    /// Trailing transcript lines injected into the parent on merge
    /// (`CCHELM_MERGE_SUMMARY_LINES`, default 40).
    pub merge_summary_lines: usize,

    /// Bounded decision history kept per agent
    /// (`CCHELM_DECISION_HISTORY`, default 20).
    pub decision_history_size: usize,

    /// Deadline for a single tmux invocation, milliseconds
    /// (`CCHELM_MUX_TIMEOUT_MS`, default 10_000).
    pub mux_timeout_ms: u64,

    /// Deadline for one policy call, milliseconds
    /// (`CCHELM_POLICY_TIMEOUT_MS`, default 60_000).
    pub policy_timeout_ms: u64,

    /// Grace period between SIGTERM and SIGKILL when stopping a viewer,
    /// milliseconds (`CCHELM_VIEWER_GRACE_MS`, default 5_000).
    pub viewer_grace_ms: u64,
}

impl Default for HelmConfig {
    fn default() -> Self {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let storage_root = home.join(".cchelm");
        let exports_dir = storage_root.join("exports");

        Self {
            storage_root,
            bind_addr: "127.0.0.1:7433".parse().unwrap_or_else(|_| {
                SocketAddr::from(([127, 0, 0, 1], 7433))
            }),
            min_port: 7500,
            max_port: 7599,
            viewer_command: None,
            agent_command: "claude".to_string(),
            agent_resume_flag: "--resume".to_string(),
            agent_fork_flag: "--fork-session".to_string(),
            policy_endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            policy_api_key: None,
            policy_model: "gpt-4o-mini".to_string(),
            notify_webhook: None,
            exports_dir,
            capture_lines: 200,
            merge_summary_lines: 40,
            decision_history_size: 20,
            mux_timeout_ms: 10_000,
            policy_timeout_ms: 60_000,
            viewer_grace_ms: 5_000,
        }
    }
}

impl HelmConfig {
    /// Builds the configuration from the environment, falling back to
    /// the documented defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(root) = env_var("CCHELM_STORAGE_ROOT") {
            config.storage_root = PathBuf::from(root);
            config.exports_dir = config.storage_root.join("exports");
        }
        if let Some(dir) = env_var("CCHELM_EXPORTS_DIR") {
            config.exports_dir = PathBuf::from(dir);
        }
        if let Some(addr) = env_var("CCHELM_BIND").and_then(|v| v.parse().ok()) {
            config.bind_addr = addr;
        }
        if let Some(port) = env_var("CCHELM_PORT_MIN").and_then(|v| v.parse().ok()) {
            config.min_port = port;
        }
        if let Some(port) = env_var("CCHELM_PORT_MAX").and_then(|v| v.parse().ok()) {
            config.max_port = port;
        }
        config.viewer_command = env_var("CCHELM_VIEWER_CMD");
        if let Some(cmd) = env_var("CCHELM_AGENT_CMD") {
            config.agent_command = cmd;
        }
        if let Some(flag) = env_var("CCHELM_AGENT_RESUME_FLAG") {
            config.agent_resume_flag = flag;
        }
        if let Some(flag) = env_var("CCHELM_AGENT_FORK_FLAG") {
            config.agent_fork_flag = flag;
        }
        if let Some(url) = env_var("CCHELM_POLICY_URL") {
            config.policy_endpoint = url;
        }
        config.policy_api_key = env_var("CCHELM_POLICY_KEY");
        if let Some(model) = env_var("CCHELM_POLICY_MODEL") {
            config.policy_model = model;
        }
        config.notify_webhook = env_var("CCHELM_NOTIFY_WEBHOOK");
        if let Some(n) = env_var("CCHELM_CAPTURE_LINES").and_then(|v| v.parse().ok()) {
            config.capture_lines = n;
        }
        if let Some(n) = env_var("CCHELM_MERGE_SUMMARY_LINES").and_then(|v| v.parse().ok()) {
            config.merge_summary_lines = n;
        }
        if let Some(n) = env_var("CCHELM_DECISION_HISTORY").and_then(|v| v.parse().ok()) {
            config.decision_history_size = n;
        }
        if let Some(ms) = env_var("CCHELM_MUX_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            config.mux_timeout_ms = ms;
        }
        if let Some(ms) = env_var("CCHELM_POLICY_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            config.policy_timeout_ms = ms;
        }
        if let Some(ms) = env_var("CCHELM_VIEWER_GRACE_MS").and_then(|v| v.parse().ok()) {
            config.viewer_grace_ms = ms;
        }

        config
    }

    pub fn mux_timeout(&self) -> Duration {
        Duration::from_millis(self.mux_timeout_ms)
    }

    pub fn policy_timeout(&self) -> Duration {
        Duration::from_millis(self.policy_timeout_ms)
    }

    pub fn viewer_grace(&self) -> Duration {
        Duration::from_millis(self.viewer_grace_ms)
    }
}

fn env_var(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}
