use crate::dispatch::{
    project_model_event, retry_after_from_response, DispatchError, UpstreamEvent, UpstreamRequest,
};
use crate::store::Account;
use crate::token_cache::TokenCache;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

const DEFAULT_AGENT_URL: &str = "https://orchids-upstream.internal/agent/coding-agent";
const SESSION_TOKEN_URL: &str = "https://clerk.orchids.app/v1/client/sessions";

#[derive(Clone)]
pub struct OrchidsDispatcher {
    account: Account,
    http: Arc<reqwest::Client>,
    token_cache: Arc<TokenCache>,
}

fn agent_url() -> String {
    std::env::var("UPSTREAM_URL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_AGENT_URL.to_string())
}

/// Bounded random derived from UUID bytes, so no extra RNG dependency.
fn random_in(bound: u64) -> u64 {
    if bound <= 1 {
        return 0;
    }
    let seed = uuid::Uuid::new_v4().as_u128() as u64;
    seed % bound
}

pub fn random_chat_session_id() -> u64 {
    10_000_000 + random_in(90_000_000)
}

impl OrchidsDispatcher {
    pub fn new(account: Account, http: Arc<reqwest::Client>, token_cache: Arc<TokenCache>) -> Self {
        Self {
            account,
            http,
            token_cache,
        }
    }

    async fn token(&self) -> Result<String, DispatchError> {
        if let Ok(token) = std::env::var("UPSTREAM_TOKEN") {
            if !token.trim().is_empty() {
                return Ok(token);
            }
        }
        if let Some(token) = self.token_cache.get(&self.account.session_id).await {
            return Ok(token);
        }

        let url = format!("{SESSION_TOKEN_URL}/{}/tokens", self.account.session_id);
        let cookies = format!(
            "__client={}; __client_uat={}",
            self.account.client_cookie, self.account.client_uat
        );
        let response = self
            .http
            .post(&url)
            .header("content-type", "application/x-www-form-urlencoded")
            .header("cookie", cookies)
            .body("organization_id=")
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
                message: format!("token request failed: {body}"),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| DispatchError::Network(e.to_string()))?;
        let jwt = body
            .get("jwt")
            .and_then(|v| v.as_str())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| DispatchError::Network("token response missing jwt".to_string()))?
            .to_string();
        self.token_cache.put(&self.account.session_id, &jwt).await;
        Ok(jwt)
    }

    fn envelope(&self, request: &UpstreamRequest) -> Value {
        json!({
            "prompt": request.prompt,
            "chatHistory": request.chat_history,
            "projectId": self.account.project_id,
            "currentPage": {},
            "agentMode": self.account.agent_mode,
            "mode": "agent",
            "gitRepoUrl": "",
            "email": self.account.email,
            "chatSessionId": random_chat_session_id(),
            "userId": self.account.user_id,
            "apiVersion": 2,
            "model": request.model,
        })
    }

    pub async fn send_request(
        &self,
        request: &UpstreamRequest,
        events: &mpsc::Sender<UpstreamEvent>,
    ) -> Result<(), DispatchError> {
        let token = self.token().await?;
        let response = self
            .http
            .post(agent_url())
            .header("accept", "text/event-stream")
            .header("x-orchids-api-version", "2")
            .bearer_auth(token)
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
                message: format!("agent request failed: {body}"),
            });
        }

        pump_model_events(response, events).await
    }
}

/// Consumes an SSE body of `data: {"type":"model","event":{...}}` lines and
/// forwards projected events. Unparseable lines are logged and skipped; a
/// closed receiver ends the round quietly (the client went away).
pub(crate) async fn pump_model_events(
    response: reqwest::Response,
    events: &mpsc::Sender<UpstreamEvent>,
) -> Result<(), DispatchError> {
    let mut stream = response.bytes_stream().eventsource();
    while let Some(item) = stream.next().await {
        let sse = match item {
            Ok(sse) => sse,
            Err(err) => return Err(DispatchError::Network(err.to_string())),
        };
        let data = sse.data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        let payload: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(%err, "skipping unparseable upstream SSE line");
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
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_session_id_is_eight_digits() {
        for _ in 0..64 {
            let id = random_chat_session_id();
            assert!((10_000_000..100_000_000).contains(&id), "got {id}");
        }
    }

    #[test]
    fn agent_url_defaults_without_env() {
        // UPSTREAM_URL is unset in unit tests.
        assert!(agent_url().starts_with("https://"));
    }
}
