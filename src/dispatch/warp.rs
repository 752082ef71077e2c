use crate::dispatch::orchids::pump_model_events;
use crate::dispatch::{
    parse_retry_after, project_model_event, retry_after_from_response, DispatchError,
    UpstreamEvent, UpstreamRequest,
};
use crate::prompt::enforce_warp_budget;
use crate::store::Account;
use axum::http::StatusCode;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const DEFAULT_WARP_URL: &str = "https://warp-upstream.internal/ai/agent";

#[derive(Clone)]
pub struct WarpDispatcher {
    account: Account,
    http: Arc<reqwest::Client>,
    use_websocket: bool,
    max_tokens: u64,
}

fn warp_url() -> String {
    std::env::var("WARP_UPSTREAM_URL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_WARP_URL.to_string())
}

fn warp_ws_url() -> String {
    let url = warp_url();
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url
    }
}

impl WarpDispatcher {
    pub fn new(
        account: Account,
        http: Arc<reqwest::Client>,
        use_websocket: bool,
        max_tokens: u64,
    ) -> Self {
        Self {
            account,
            http,
            use_websocket,
            max_tokens,
        }
    }

    /// Builds the structured envelope after the token budget pass.
    fn envelope(&self, request: &UpstreamRequest) -> Value {
        let outcome = enforce_warp_budget(&request.prompt, &request.messages, self.max_tokens);
        if outcome.compressed_blocks > 0 || outcome.dropped_messages > 0 {
            tracing::info!(
                before_tokens = outcome.before_tokens,
                after_tokens = outcome.after_tokens,
                compressed_blocks = outcome.compressed_blocks,
                dropped_messages = outcome.dropped_messages,
                "warp budget enforced"
            );
        }
        json!({
            "prompt": request.prompt,
            "messages": outcome.messages,
            "system": request.system,
            "tools": request.tools,
            "model": request.model,
            "agentMode": self.account.agent_mode,
            "userId": self.account.user_id,
            "email": self.account.email,
            "stream": request.stream,
        })
    }

    pub async fn send_request(
        &self,
        request: &UpstreamRequest,
        events: &mpsc::Sender<UpstreamEvent>,
    ) -> Result<(), DispatchError> {
        if self.use_websocket {
            self.send_over_websocket(request, events).await
        } else {
            self.send_over_sse(request, events).await
        }
    }

    async fn send_over_sse(
        &self,
        request: &UpstreamRequest,
        events: &mpsc::Sender<UpstreamEvent>,
    ) -> Result<(), DispatchError> {
        let response = self
            .http
            .post(warp_url())
            .header("accept", "text/event-stream")
            .bearer_auth(&self.account.client_cookie)
            .json(&self.envelope(request))
            .send()
            .await
            .map_err(|e| DispatchError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_from_response(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Http {
                status,
                retry_after,
                message: format!("warp request failed: {body}"),
            });
        }

        pump_model_events(response, events).await
    }

    /// WebSocket transport: the envelope goes out as one JSON text frame and
    /// each response frame carries the same event object the SSE lines carry.
    async fn send_over_websocket(
        &self,
        request: &UpstreamRequest,
        events: &mpsc::Sender<UpstreamEvent>,
    ) -> Result<(), DispatchError> {
        let url = format!(
            "{}?token={}",
            warp_ws_url(),
            urlencoding::encode(&self.account.client_cookie)
        );
        let (socket, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(map_ws_error)?;
        let (mut sink, mut source) = socket.split();

        sink.send(WsMessage::Text(self.envelope(request).to_string()))
            .await
            .map_err(|e| DispatchError::Network(e.to_string()))?;

        while let Some(frame) = source.next().await {
            let frame = frame.map_err(|e| DispatchError::Network(e.to_string()))?;
            match frame {
                WsMessage::Text(text) => {
                    let payload: Value = match serde_json::from_str(&text) {
                        Ok(value) => value,
                        Err(err) => {
                            tracing::debug!(%err, "skipping unparseable warp frame");
                            continue;
                        }
                    };
                    if payload.get("type").and_then(|v| v.as_str()) != Some("model") {
                        continue;
                    }
                    let Some(event) = payload.get("event") else {
                        continue;
                    };
                    if let Some(projected) = project_model_event(event) {
                        if events.send(projected).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
        Ok(())
    }
}

fn map_ws_error(err: tokio_tungstenite::tungstenite::Error) -> DispatchError {
    use tokio_tungstenite::tungstenite::Error;
    match err {
        Error::Http(response) => {
            let status = StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            DispatchError::Http {
                status,
                retry_after,
                message: "warp websocket handshake rejected".to_string(),
            }
        }
        other => DispatchError::Network(other.to_string()),
    }
}
