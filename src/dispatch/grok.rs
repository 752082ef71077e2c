use crate::dispatch::orchids::{pump_model_events, random_chat_session_id};
use crate::dispatch::{
    retry_after_from_response, DispatchError, FinishReason, UpstreamEvent, UpstreamRequest,
};
use crate::prompt::{ContentBlock, Message, MessageContent};
use crate::store::Account;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

const DEFAULT_GROK_URL: &str = "https://grok-upstream.internal/agent/chat";

const IMAGE_KEYWORDS: [&str; 8] = [
    "image", "picture", "photo", "draw", "render", "画", "图片", "生成图",
];

#[derive(Clone)]
pub struct GrokDispatcher {
    account: Account,
    http: Arc<reqwest::Client>,
}

fn grok_url() -> String {
    std::env::var("GROK_UPSTREAM_URL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_GROK_URL.to_string())
}

impl GrokDispatcher {
    pub fn new(account: Account, http: Arc<reqwest::Client>) -> Self {
        Self { account, http }
    }

    pub async fn send_request(
        &self,
        request: &UpstreamRequest,
        events: &mpsc::Sender<UpstreamEvent>,
    ) -> Result<(), DispatchError> {
        // Images-only fast path: the reply is just the collected URLs, so
        // skip the upstream round-trip entirely.
        let user_text = last_user_text(&request.messages);
        let urls = collect_image_urls(&request.messages);
        if wants_images(&user_text) && !urls.is_empty() {
            let content = markdown_image_content(&urls);
            let _ = events.send(UpstreamEvent::TextStart).await;
            let _ = events
                .send(UpstreamEvent::TextDelta { delta: content })
                .await;
            let _ = events.send(UpstreamEvent::TextEnd).await;
            let _ = events
                .send(UpstreamEvent::Finish {
                    reason: FinishReason::Stop,
                    input_tokens: None,
                    output_tokens: None,
                })
                .await;
            return Ok(());
        }

        let envelope = json!({
            "prompt": request.prompt,
            "chatHistory": request.chat_history,
            "agentMode": self.account.agent_mode,
            "mode": "agent",
            "email": self.account.email,
            "chatSessionId": random_chat_session_id(),
            "userId": self.account.user_id,
            "apiVersion": 2,
            "model": request.model,
        });
        let response = self
            .http
            .post(grok_url())
            .header("accept", "text/event-stream")
            .bearer_auth(&self.account.client_cookie)
            .json(&envelope)
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
                message: format!("grok request failed: {body}"),
            });
        }

        pump_model_events(response, events).await
    }
}

pub fn wants_images(user_text: &str) -> bool {
    let lower = user_text.to_lowercase();
    IMAGE_KEYWORDS.iter().any(|k| lower.contains(k))
}

fn last_user_text(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role.eq_ignore_ascii_case("user"))
        .map(|m| m.plain_text())
        .unwrap_or_default()
}

/// Image URLs present in the request itself: url-sourced image blocks plus
/// bare image links in user text.
pub fn collect_image_urls(messages: &[Message]) -> Vec<String> {
    let mut urls = Vec::new();
    for message in messages {
        if !message.role.eq_ignore_ascii_case("user") {
            continue;
        }
        if let MessageContent::Blocks(blocks) = &message.content {
            for block in blocks {
                if let ContentBlock::Image { extra } = block {
                    if let Some(url) = extra
                        .get("source")
                        .and_then(|s| s.get("url"))
                        .and_then(|v| v.as_str())
                    {
                        urls.push(url.to_string());
                    }
                }
            }
        }
        for word in message.plain_text().split_whitespace() {
            if word.starts_with("http://") || word.starts_with("https://") {
                let lower = word.to_ascii_lowercase();
                if [".png", ".jpg", ".jpeg", ".gif", ".webp"]
                    .iter()
                    .any(|ext| lower.ends_with(ext))
                {
                    urls.push(word.to_string());
                }
            }
        }
    }
    urls.dedup();
    urls
}

pub fn markdown_image_content(urls: &[String]) -> String {
    let mut out = String::from("\n\n");
    for url in urls {
        let url = url.trim();
        if url.is_empty() {
            continue;
        }
        out.push_str("![](");
        out.push_str(url);
        out.push_str(")\n");
    }
    out
}

fn completion_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("chatcmpl_{}", &hex[..8])
}

/// Minimal OpenAI-compatible non-stream completion holding only the
/// Markdown image links.
pub fn images_only_chat_completion(model: &str, urls: &[String]) -> Value {
    json!({
        "id": completion_id(),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": markdown_image_content(urls),
            },
            "logprobs": null,
            "finish_reason": "stop",
        }],
    })
}

/// Streamed variant: role chunk, one content chunk, then the caller appends
/// `[DONE]`.
pub fn images_only_chat_chunks(model: &str, urls: &[String]) -> Vec<Value> {
    let id = completion_id();
    let created = chrono::Utc::now().timestamp();
    vec![
        json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{
                "index": 0,
                "delta": {"role": "assistant"},
                "logprobs": null,
                "finish_reason": null,
            }],
        }),
        json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{
                "index": 0,
                "delta": {"content": markdown_image_content(urls)},
                "logprobs": null,
                "finish_reason": null,
            }],
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wants_images_detects_keywords() {
        assert!(wants_images("please draw a cat"));
        assert!(wants_images("帮我生成图"));
        assert!(!wants_images("explain this stack trace"));
    }

    #[test]
    fn collect_image_urls_finds_blocks_and_links() {
        let messages = vec![Message::blocks(
            "user",
            vec![
                ContentBlock::Image {
                    extra: serde_json::from_value(
                        json!({"source": {"type": "url", "url": "https://cdn.example/a.png"}}),
                    )
                    .unwrap(),
                },
                ContentBlock::Text {
                    text: "also https://cdn.example/b.jpg please".to_string(),
                },
            ],
        )];
        let urls = collect_image_urls(&messages);
        assert_eq!(
            urls,
            vec![
                "https://cdn.example/a.png".to_string(),
                "https://cdn.example/b.jpg".to_string()
            ]
        );
    }

    #[test]
    fn markdown_content_lists_each_url() {
        let urls = vec!["https://x/1.png".to_string(), "https://x/2.png".to_string()];
        let content = markdown_image_content(&urls);
        assert!(content.contains("![](https://x/1.png)"));
        assert!(content.contains("![](https://x/2.png)"));
    }

    #[test]
    fn chat_completion_shapes_are_openai_compatible() {
        let urls = vec!["https://x/1.png".to_string()];
        let full = images_only_chat_completion("grok-agent", &urls);
        assert_eq!(full["object"], "chat.completion");
        assert_eq!(full["choices"][0]["finish_reason"], "stop");

        let chunks = images_only_chat_chunks("grok-agent", &urls);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0]["object"], "chat.completion.chunk");
        assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
        assert!(chunks[1]["choices"][0]["delta"]["content"]
            .as_str()
            .unwrap()
            .contains("![]("));
    }

    #[tokio::test]
    async fn fast_path_emits_synthesized_events() {
        let account = Account {
            id: 1,
            name: "grok-1".to_string(),
            session_id: "sess".to_string(),
            client_cookie: "cookie".to_string(),
            client_uat: String::new(),
            project_id: String::new(),
            user_id: "u".to_string(),
            email: "g@example.com".to_string(),
            agent_mode: "grok".to_string(),
            weight: 1,
            enabled: true,
            usage_current: 0,
            usage_total: 0,
            usage_reset_at: None,
            request_count: 0,
            last_used_at: None,
        };
        let dispatcher = GrokDispatcher::new(account, Arc::new(reqwest::Client::new()));
        let request = UpstreamRequest {
            prompt: String::new(),
            chat_history: Vec::new(),
            model: "grok-agent".to_string(),
            messages: vec![Message::text(
                "user",
                "draw me something like https://cdn.example/ref.png",
            )],
            system: Vec::new(),
            tools: Vec::new(),
            stream: true,
        };
        let (tx, mut rx) = mpsc::channel(16);
        dispatcher.send_request(&request, &tx).await.unwrap();
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(UpstreamEvent::TextStart)));
        assert!(matches!(
            events.last(),
            Some(UpstreamEvent::Finish {
                reason: FinishReason::Stop,
                ..
            })
        ));
    }
}
