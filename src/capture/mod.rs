use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::HelmResult;
use crate::mux::MuxDriver;

/// Classification of a captured pane tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenClass {
    IdleAwaitingInput,
    Running,
    PermissionPrompt,
    Crashed,
    Unknown,
}

impl std::fmt::Display for ScreenClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScreenClass::IdleAwaitingInput => write!(f, "idle_awaiting_input"),
            ScreenClass::Running => write!(f, "running"),
            ScreenClass::PermissionPrompt => write!(f, "permission_prompt"),
            ScreenClass::Crashed => write!(f, "crashed"),
            ScreenClass::Unknown => write!(f, "unknown"),
        }
    }
}

/// Structured view of a pane's recent output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalState {
    pub raw_lines: Vec<String>,
    pub classified: ScreenClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_text: Option<String>,
}

impl TerminalState {
    /// How urgently a supervisor should look at this screen, in [0, 1].
    /// Crashes and pending prompts outrank an idle caret; a busy
    /// assistant is left alone.
    pub fn attention_score(&self) -> f64 {
        match self.classified {
            ScreenClass::Crashed => 1.0,
            ScreenClass::PermissionPrompt => 0.9,
            ScreenClass::IdleAwaitingInput => 0.6,
            ScreenClass::Unknown => 0.3,
            ScreenClass::Running => 0.1,
        }
    }

    /// The trailing non-blank lines, newest last.
    pub fn tail(&self, n: usize) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .raw_lines
            .iter()
            .rev()
            .filter(|l| !l.trim().is_empty())
            .take(n)
            .map(|l| l.as_str())
            .collect();
        out.reverse();
        out
    }
}

/// Tunable pattern set for the classifier. Defaults match the wrapped AI
/// CLI's rendering; deployments wrapping a different CLI override them.
#[derive(Debug, Clone)]
pub struct CapturePatterns {
    /// The last non-blank line matching any of these marks a pending
    /// permission prompt.
    pub prompt: Vec<Regex>,
    /// Seen in the trailing window while the assistant is working.
    pub running: Vec<Regex>,
    /// Input caret of an idle assistant.
    pub idle: Vec<Regex>,
    /// Fatal markers.
    pub crash: Vec<Regex>,
    /// Lines scanned for running/crash markers.
    pub marker_window: usize,
}

impl Default for CapturePatterns {
    fn default() -> Self {
        fn build(patterns: &[&str]) -> Vec<Regex> {
            patterns
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect()
        }
        Self {
            prompt: build(&[
                r"(?i)do you want to",
                r"(?i)\(y/n\)",
                r"(?i)\[y/n\]",
                r"(?i)yes, and don't ask again",
                r"(?i)press enter to (confirm|continue)",
                r"(?i)❯\s*1\.\s*yes",
            ]),
            running: build(&[
                r"[⠁⠂⠄⠈⠐⠠⡀⢀⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏]",
                r"(?i)esc to interrupt",
                r"(?i)working…",
                r"(?i)thinking…",
            ]),
            idle: build(&[r"^\s*❯", r"^\s*>\s*$"]),
            crash: build(&[
                r"(?i)command not found",
                r"(?i)connection lost",
                r"(?i)process exited",
                r"(?i)segmentation fault",
                r"\[exited\]",
            ]),
            marker_window: 15,
        }
    }
}

/// Pure classifier over captured lines. The only I/O in this module is
/// the capture call itself.
pub fn classify_lines(lines: &[String], patterns: &CapturePatterns) -> (ScreenClass, Option<String>) {
    let non_blank: Vec<&String> = lines.iter().filter(|l| !l.trim().is_empty()).collect();
    let window_start = non_blank.len().saturating_sub(patterns.marker_window);
    let window = &non_blank[window_start..];

    // Crash markers take priority over everything else.
    if window
        .iter()
        .any(|line| patterns.crash.iter().any(|re| re.is_match(line)))
    {
        return (ScreenClass::Crashed, None);
    }

    // Pending prompts beat the spinner, but only a prompt sitting on the
    // last non-blank line is live: the capture includes scrollback, and
    // a dialog answered a few lines up must not be reported again.
    if let Some(last) = non_blank.last() {
        if patterns.prompt.iter().any(|re| re.is_match(last)) {
            return (
                ScreenClass::PermissionPrompt,
                Some(last.trim().to_string()),
            );
        }
    }

    if window
        .iter()
        .any(|line| patterns.running.iter().any(|re| re.is_match(line)))
    {
        return (ScreenClass::Running, None);
    }

    if window
        .iter()
        .any(|line| patterns.idle.iter().any(|re| re.is_match(line)))
    {
        return (ScreenClass::IdleAwaitingInput, None);
    }

    (ScreenClass::Unknown, None)
}

/// Captures and classifies the tail of a pane.
pub struct CaptureEngine {
    mux: Arc<dyn MuxDriver>,
    patterns: CapturePatterns,
    last_n: usize,
}

impl CaptureEngine {
    pub fn new(mux: Arc<dyn MuxDriver>, last_n: usize) -> Self {
        Self {
            mux,
            patterns: CapturePatterns::default(),
            last_n,
        }
    }

    pub fn with_patterns(mut self, patterns: CapturePatterns) -> Self {
        self.patterns = patterns;
        self
    }

    pub async fn capture(&self, pane_id: &str) -> HelmResult<TerminalState> {
        self.capture_last(pane_id, self.last_n).await
    }

    pub async fn capture_last(&self, pane_id: &str, last_n: usize) -> HelmResult<TerminalState> {
        let raw = self.mux.capture_pane(pane_id, last_n).await?;
        let raw_lines: Vec<String> = raw.lines().map(|l| l.to_string()).collect();
        let (classified, prompt_text) = classify_lines(&raw_lines, &self.patterns);
        Ok(TerminalState {
            raw_lines,
            classified,
            prompt_text,
        })
    }
}
