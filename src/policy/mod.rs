use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::capture::TerminalState;
use crate::error::{HelmError, HelmResult};

/// The fixed action set a supervisor may take on a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Respond,
    Approve,
    Reject,
    Wait,
    RequestHelp,
    Compact,
    Interrupt,
}

impl DecisionAction {
    pub const ALL: [DecisionAction; 7] = [
        DecisionAction::Respond,
        DecisionAction::Approve,
        DecisionAction::Reject,
        DecisionAction::Wait,
        DecisionAction::RequestHelp,
        DecisionAction::Compact,
        DecisionAction::Interrupt,
    ];

    /// Actions that do not count against the consecutive-response cap.
    pub fn is_passive(&self) -> bool {
        matches!(self, DecisionAction::Wait | DecisionAction::RequestHelp)
    }
}

impl std::fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DecisionAction::Respond => "respond",
            DecisionAction::Approve => "approve",
            DecisionAction::Reject => "reject",
            DecisionAction::Wait => "wait",
            DecisionAction::RequestHelp => "request_help",
            DecisionAction::Compact => "compact",
            DecisionAction::Interrupt => "interrupt",
        };
        write!(f, "{}", name)
    }
}

/// One policy verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub action: DecisionAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub reason: String,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl Decision {
    /// The fallback verdict substituted when the policy reply cannot be
    /// parsed, and the default for passive cycles.
    pub fn wait(reason: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::Wait,
            response: None,
            reason: reason.into(),
            confidence: 1.0,
            timestamp: Utc::now(),
        }
    }
}

/// Decides how to respond to a captured terminal state.
///
/// The production implementation calls a remote chat-completion endpoint;
/// tests substitute a scripted fake.
#[async_trait]
pub trait DecisionPolicy: Send + Sync {
    async fn decide(
        &self,
        master_prompt: &str,
        state: &TerminalState,
        history: &[Decision],
    ) -> HelmResult<Decision>;
}

/// Wire shape accepted from the model before validation.
#[derive(Debug, Deserialize)]
struct RawDecision {
    action: String,
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Parses a model reply into a validated [`Decision`].
///
/// Tolerates fenced or prose-wrapped replies by extracting the first
/// balanced JSON object; rejects unknown actions, missing required
/// fields, and out-of-range confidence with `PolicyProtocol`.
pub fn parse_decision(content: &str) -> HelmResult<Decision> {
    let json = extract_json_object(content)
        .ok_or_else(|| HelmError::PolicyProtocol("reply contains no JSON object".into()))?;

    let raw: RawDecision = serde_json::from_str(json)
        .map_err(|e| HelmError::PolicyProtocol(format!("undecodable reply: {}", e)))?;

    let action: DecisionAction =
        serde_json::from_value(serde_json::Value::String(raw.action.clone()))
            .map_err(|_| HelmError::PolicyProtocol(format!("unknown action '{}'", raw.action)))?;

    let reason = raw
        .reason
        .filter(|r| !r.trim().is_empty())
        .ok_or_else(|| HelmError::PolicyProtocol("missing reason".into()))?;

    let confidence = raw
        .confidence
        .ok_or_else(|| HelmError::PolicyProtocol("missing confidence".into()))?;
    if !(0.0..=1.0).contains(&confidence) || confidence.is_nan() {
        return Err(HelmError::PolicyProtocol(format!(
            "confidence {} outside [0, 1]",
            confidence
        )));
    }

    let response = raw.response.filter(|r| !r.is_empty());
    if action == DecisionAction::Respond && response.is_none() {
        return Err(HelmError::PolicyProtocol(
            "respond action without response text".into(),
        ));
    }

    Ok(Decision {
        action,
        response,
        reason,
        confidence,
        timestamp: Utc::now(),
    })
}

/// First balanced `{ ... }` in the text, string-aware.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// LLM-backed policy calling an OpenAI-compatible chat-completion
/// endpoint.
pub struct LlmPolicy {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl LlmPolicy {
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        model: String,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            model,
            timeout,
        }
    }

    /// Builds the structured prompt: master prompt, terminal tail, recent
    /// decisions, allowed actions, and the demand for a single JSON
    /// object.
    fn build_request(
        &self,
        master_prompt: &str,
        state: &TerminalState,
        history: &[Decision],
    ) -> serde_json::Value {
        let actions: Vec<String> = DecisionAction::ALL.iter().map(|a| a.to_string()).collect();
        let history_lines: Vec<String> = history
            .iter()
            .map(|d| {
                format!(
                    "- {} ({}): {}",
                    d.action,
                    d.timestamp.format("%H:%M:%S"),
                    d.reason
                )
            })
            .collect();

        let system = format!(
            "You supervise an interactive AI coding assistant running in a terminal.\n\
             Operator instructions:\n{}\n\n\
             Reply with exactly one JSON object:\n\
             {{\"action\": one of {:?}, \"response\": string (required for respond), \
             \"reason\": string, \"confidence\": number in [0,1]}}\n\
             No prose outside the JSON object.",
            master_prompt, actions
        );

        let user = format!(
            "Terminal classification: {}\n{}\nLast {} lines of the terminal:\n{}\n\n\
             Recent decisions:\n{}",
            state.classified,
            state
                .prompt_text
                .as_deref()
                .map(|p| format!("Pending prompt: {}\n", p))
                .unwrap_or_default(),
            state.raw_lines.len(),
            state.raw_lines.join("\n"),
            if history_lines.is_empty() {
                "(none)".to_string()
            } else {
                history_lines.join("\n")
            }
        );

        serde_json::json!({
            "model": self.model,
            "temperature": 0.0,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        })
    }
}

#[async_trait]
impl DecisionPolicy for LlmPolicy {
    async fn decide(
        &self,
        master_prompt: &str,
        state: &TerminalState,
        history: &[Decision],
    ) -> HelmResult<Decision> {
        let body = self.build_request(master_prompt, state, history);

        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                HelmError::Timeout("policy endpoint".into())
            } else {
                HelmError::BackendUnavailable(format!("policy endpoint: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HelmError::BackendUnavailable(format!(
                "policy endpoint returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| HelmError::PolicyProtocol(format!("non-JSON policy reply: {}", e)))?;

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                HelmError::PolicyProtocol("reply missing choices[0].message.content".into())
            })?;

        parse_decision(content)
    }
}
