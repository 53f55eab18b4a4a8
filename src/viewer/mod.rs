use dashmap::DashMap;
use rand::Rng;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{HelmError, HelmResult};
use crate::ports::PortAllocator;

/// Restart budget before a viewer is declared dead.
const MAX_RESTARTS: u32 = 5;
const BACKOFF_BASE_MS: u64 = 500;

/// What a viewer child needs to know: which pane to stream and where to
/// listen. Arguments are pass-through; the binary's protocol is its own.
#[derive(Debug, Clone)]
pub struct ViewerSpec {
    pub session_id: String,
    pub mux_session_name: String,
    pub pane_id: String,
    pub port: u16,
}

/// Lifecycle reports consumed by the session manager.
#[derive(Debug, Clone)]
pub enum ViewerEvent {
    Started {
        session_id: String,
        port: u16,
        pid: u32,
    },
    /// Retry budget exhausted; the session should drop its port and
    /// record the error.
    Failed {
        session_id: String,
        error: String,
    },
}

struct ViewerHandle {
    port: u16,
    cancel: CancellationToken,
}

/// Spawns and monitors one HTTP terminal-viewer process per active
/// session.
///
/// Children are restarted on non-zero exit with jittered exponential
/// backoff up to a bounded budget; a clean exit is treated as deliberate.
/// With no viewer command configured the supervisor is inert and sessions
/// run headless.
pub struct ViewerSupervisor {
    command: Option<String>,
    grace: Duration,
    ports: Arc<PortAllocator>,
    children: DashMap<String, ViewerHandle>,
    events: mpsc::UnboundedSender<ViewerEvent>,
}

impl ViewerSupervisor {
    pub fn new(
        command: Option<String>,
        grace: Duration,
        ports: Arc<PortAllocator>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ViewerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                command,
                grace,
                ports,
                children: DashMap::new(),
                events,
            }),
            rx,
        )
    }

    pub fn enabled(&self) -> bool {
        self.command.is_some()
    }

    /// Starts (or restarts) the viewer for a session. Returns immediately
    /// after the first successful spawn; later restarts happen inside the
    /// monitor task.
    pub async fn start(self: &Arc<Self>, spec: ViewerSpec) -> HelmResult<()> {
        let Some(command) = self.command.clone() else {
            return Ok(());
        };

        // Replace any previous viewer for this session.
        self.stop(&spec.session_id).await;

        let mut child = spawn_viewer(&command, &spec)?;
        let pid = child.id().unwrap_or_default();
        self.ports.bind_pid(spec.port, pid);
        let _ = self.events.send(ViewerEvent::Started {
            session_id: spec.session_id.clone(),
            port: spec.port,
            pid,
        });
        tracing::info!(session = %spec.session_id, port = spec.port, pid, "viewer started");

        let cancel = CancellationToken::new();
        self.children.insert(
            spec.session_id.clone(),
            ViewerHandle {
                port: spec.port,
                cancel: cancel.clone(),
            },
        );

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.monitor(command, spec, child, cancel).await;
        });
        Ok(())
    }

    /// Monitor loop: restart on failure, stop on cancellation or clean
    /// exit.
    async fn monitor(
        self: Arc<Self>,
        command: String,
        spec: ViewerSpec,
        mut child: Child,
        cancel: CancellationToken,
    ) {
        let mut restarts: u32 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.terminate(&mut child).await;
                    return;
                }
                status = child.wait() => {
                    match status {
                        Ok(s) if s.success() => {
                            tracing::info!(session = %spec.session_id, "viewer exited cleanly");
                            self.children.remove(&spec.session_id);
                            return;
                        }
                        Ok(s) => {
                            tracing::warn!(session = %spec.session_id, status = ?s.code(),
                                restarts, "viewer exited");
                        }
                        Err(e) => {
                            tracing::warn!(session = %spec.session_id, error = %e,
                                "viewer wait failed");
                        }
                    }
                }
            }

            restarts += 1;
            if restarts > MAX_RESTARTS {
                self.children.remove(&spec.session_id);
                let _ = self.events.send(ViewerEvent::Failed {
                    session_id: spec.session_id.clone(),
                    error: format!("viewer died {} times, giving up", restarts - 1),
                });
                return;
            }

            let backoff = backoff_with_jitter(restarts);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }

            match spawn_viewer(&command, &spec) {
                Ok(next) => {
                    child = next;
                    let pid = child.id().unwrap_or_default();
                    self.ports.bind_pid(spec.port, pid);
                    tracing::info!(session = %spec.session_id, pid, restarts, "viewer restarted");
                }
                Err(e) => {
                    self.children.remove(&spec.session_id);
                    let _ = self.events.send(ViewerEvent::Failed {
                        session_id: spec.session_id.clone(),
                        error: format!("viewer respawn failed: {}", e),
                    });
                    return;
                }
            }
        }
    }

    /// Stops a session's viewer and returns its port to the pool.
    pub async fn stop(&self, session_id: &str) {
        if let Some((_, handle)) = self.children.remove(session_id) {
            handle.cancel.cancel();
            self.ports.release(handle.port);
            // Give the monitor a beat to deliver the signal.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stops every viewer (process shutdown).
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.children.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    /// SIGTERM, bounded wait, then SIGKILL.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if tokio::time::timeout(self.grace, child.wait()).await.is_ok() {
                return;
            }
            tracing::warn!(pid, "viewer ignored SIGTERM, killing");
        }
        let _ = child.kill().await;
    }
}

fn spawn_viewer(command: &str, spec: &ViewerSpec) -> HelmResult<Child> {
    let mut parts = command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| HelmError::validation("empty viewer command"))?;

    Command::new(program)
        .args(parts)
        .arg("--session")
        .arg(&spec.mux_session_name)
        .arg("--pane")
        .arg(&spec.pane_id)
        .arg("--port")
        .arg(spec.port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| HelmError::BackendUnavailable(format!("spawn viewer '{}': {}", command, e)))
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(6));
    let jitter = rand::rng().random_range(0..base / 2 + 1);
    Duration::from_millis(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(port: u16) -> ViewerSpec {
        ViewerSpec {
            session_id: "s1".to_string(),
            mux_session_name: "cchelm-s1".to_string(),
            pane_id: "%0".to_string(),
            port,
        }
    }

    #[tokio::test]
    async fn test_disabled_supervisor_is_inert() {
        let ports = Arc::new(PortAllocator::new(47600, 47601));
        let (supervisor, mut rx) = ViewerSupervisor::new(None, Duration::from_secs(1), ports);
        assert!(!supervisor.enabled());
        supervisor.start(spec(47600)).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_and_stop_releases_port() {
        let ports = Arc::new(PortAllocator::new(47610, 47611));
        let port = ports.acquire().unwrap();
        let (supervisor, mut rx) = ViewerSupervisor::new(
            Some("sleep 30".to_string()),
            Duration::from_millis(200),
            ports.clone(),
        );

        supervisor.start(spec(port)).await.unwrap();
        match rx.recv().await {
            Some(ViewerEvent::Started { port: p, .. }) => assert_eq!(p, port),
            other => panic!("expected Started, got {:?}", other),
        }

        supervisor.stop("s1").await;
        assert!(!ports.is_reserved(port));
    }

    #[tokio::test]
    async fn test_missing_binary_reports_backend_unavailable() {
        let ports = Arc::new(PortAllocator::new(47620, 47621));
        let port = ports.acquire().unwrap();
        let (supervisor, _rx) = ViewerSupervisor::new(
            Some("cchelm-no-such-viewer-binary".to_string()),
            Duration::from_millis(200),
            ports,
        );
        let err = supervisor.start(spec(port)).await.unwrap_err();
        assert!(matches!(err, HelmError::BackendUnavailable(_)));
    }

    #[test]
    fn test_backoff_grows() {
        let early = backoff_with_jitter(1);
        assert!(early >= Duration::from_millis(1000));
        let late = backoff_with_jitter(6);
        assert!(late >= Duration::from_millis(32000));
    }
}
