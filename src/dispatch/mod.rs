use crate::prompt::{Message, SystemItem};
use axum::http::StatusCode;
use serde_json::Value;
use std::time::Duration;

pub mod grok;
pub mod orchids;
pub mod warp;

pub use grok::GrokDispatcher;
pub use orchids::OrchidsDispatcher;
pub use warp::WarpDispatcher;

/// Uniform event stream every provider is projected into. Dispatchers own
/// their wire formats; nothing provider-specific crosses this boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    ReasoningStart,
    ReasoningDelta { delta: String },
    ReasoningEnd,
    TextStart,
    TextDelta { delta: String },
    TextEnd,
    ToolInputStart { id: String, name: String },
    ToolInputDelta { id: String, delta: String },
    ToolInputEnd { id: String },
    ToolCall { id: String, name: String, input: String },
    TokensUsed { input: Option<u64>, output: Option<u64> },
    Finish {
        reason: FinishReason,
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Other,
}

impl FinishReason {
    fn from_wire(raw: &str) -> Self {
        match raw {
            "tool-calls" | "tool_calls" | "tool_use" => Self::ToolCalls,
            "stop" | "end_turn" => Self::Stop,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DispatchError {
    Network(String),
    Http {
        status: StatusCode,
        retry_after: Option<Duration>,
        message: String,
    },
}

impl DispatchError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Network(_) => None,
            Self::Http { status, .. } => Some(*status),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Network(_) => None,
            Self::Http { retry_after, .. } => *retry_after,
        }
    }

    /// 4xx other than 429 is credential-shaped, not account health.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.status(),
            Some(status) if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS
        )
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
        }
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(message) => write!(f, "upstream network error: {message}"),
            Self::Http {
                status,
                retry_after,
                message,
            } => {
                if let Some(delay) = retry_after {
                    write!(
                        f,
                        "upstream HTTP {status} (retry after {}s): {message}",
                        delay.as_secs()
                    )
                } else {
                    write!(f, "upstream HTTP {status}: {message}")
                }
            }
        }
    }
}

/// Parses Retry-After as delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(seconds) = value.parse::<i64>() {
        return (seconds > 0).then(|| Duration::from_secs(seconds as u64));
    }
    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
    let seconds = delta.num_seconds();
    (seconds > 0).then(|| Duration::from_secs(seconds as u64))
}

pub fn retry_after_from_response(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after)
}

/// Everything a dispatcher needs to shape one upstream round.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub prompt: String,
    pub chat_history: Vec<Value>,
    pub model: String,
    pub messages: Vec<Message>,
    pub system: Vec<SystemItem>,
    pub tools: Vec<Value>,
    pub stream: bool,
}

#[derive(Clone)]
pub enum Dispatcher {
    Orchids(OrchidsDispatcher),
    Warp(WarpDispatcher),
    Grok(GrokDispatcher),
}

impl Dispatcher {
    pub fn channel(&self) -> &'static str {
        match self {
            Self::Orchids(_) => "orchids",
            Self::Warp(_) => "warp",
            Self::Grok(_) => "grok",
        }
    }

    /// Opens the upstream stream and pumps projected events into `events`
    /// until the provider finishes or fails. Resolution of the returned
    /// future is the end of the round.
    pub async fn send_request(
        &self,
        request: &UpstreamRequest,
        events: &tokio::sync::mpsc::Sender<UpstreamEvent>,
    ) -> Result<(), DispatchError> {
        match self {
            Self::Orchids(dispatcher) => dispatcher.send_request(request, events).await,
            Self::Warp(dispatcher) => dispatcher.send_request(request, events).await,
            Self::Grok(dispatcher) => dispatcher.send_request(request, events).await,
        }
    }
}

fn usage_u64(usage: &Value, keys: &[&str]) -> Option<u64> {
    for key in keys {
        if let Some(v) = usage.get(*key).and_then(|v| v.as_u64()) {
            return Some(v);
        }
    }
    None
}

/// Projects one `{"type":"model","event":{...}}` payload into the internal
/// event. Unknown shapes return None and are skipped by the caller.
pub fn project_model_event(event: &Value) -> Option<UpstreamEvent> {
    let event_type = event.get("type").and_then(|v| v.as_str())?;
    match event_type {
        "reasoning-start" => Some(UpstreamEvent::ReasoningStart),
        "reasoning-delta" => Some(UpstreamEvent::ReasoningDelta {
            delta: event
                .get("delta")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        }),
        "reasoning-end" => Some(UpstreamEvent::ReasoningEnd),
        "text-start" => Some(UpstreamEvent::TextStart),
        "text-delta" => Some(UpstreamEvent::TextDelta {
            delta: event
                .get("delta")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        }),
        "text-end" => Some(UpstreamEvent::TextEnd),
        "tool-input-start" => {
            let id = event.get("id").and_then(|v| v.as_str())?.to_string();
            let name = event
                .get("toolName")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Some(UpstreamEvent::ToolInputStart { id, name })
        }
        "tool-input-delta" => {
            let id = event.get("id").and_then(|v| v.as_str())?.to_string();
            let delta = event
                .get("delta")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Some(UpstreamEvent::ToolInputDelta { id, delta })
        }
        "tool-input-end" => {
            let id = event.get("id").and_then(|v| v.as_str())?.to_string();
            Some(UpstreamEvent::ToolInputEnd { id })
        }
        "tool-call" => {
            let id = event.get("toolCallId").and_then(|v| v.as_str())?.to_string();
            let name = event
                .get("toolName")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let input = event
                .get("input")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Some(UpstreamEvent::ToolCall { id, name, input })
        }
        "tokens-used" => Some(UpstreamEvent::TokensUsed {
            input: usage_u64(event, &["inputTokens", "input_tokens"]),
            output: usage_u64(event, &["outputTokens", "output_tokens"]),
        }),
        "finish" => {
            let reason = event
                .get("finishReason")
                .and_then(|v| v.as_str())
                .map(FinishReason::from_wire)
                .unwrap_or(FinishReason::Stop);
            let (input_tokens, output_tokens) = match event.get("usage") {
                Some(usage) => (
                    usage_u64(usage, &["inputTokens", "input_tokens"]),
                    usage_u64(usage, &["outputTokens", "output_tokens"]),
                ),
                None => (None, None),
            };
            Some(UpstreamEvent::Finish {
                reason,
                input_tokens,
                output_tokens,
            })
        }
        _ => None,
    }
}
