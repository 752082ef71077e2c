use crate::app::AppState;
use crate::dedup::request_fingerprint;
use crate::dispatch::grok::{
    collect_image_urls, images_only_chat_chunks, images_only_chat_completion, wants_images,
};
use crate::error::{AppError, AppResult};
use crate::prompt::{self, Message, MessagesRequest};
use crate::stream::{relay_messages, RelayOptions, RelayResponse};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

pub async fn health() -> impl IntoResponse {
    axum::Json(json!({"status": "ok"}))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn create_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_messages(state, headers, body, "").await
}

pub async fn create_messages_orchids(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_messages(state, headers, body, "orchids").await
}

pub async fn create_messages_warp(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_messages(state, headers, body, "warp").await
}

pub async fn create_messages_grok(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_messages(state, headers, body, "grok").await
}

/// Ties the dedup in-flight slot to the lifetime of whatever response path
/// holds it; streams carry it until the client stream is dropped.
struct DedupTicket {
    deduper: Arc<crate::dedup::RequestDeduplicator>,
    fingerprint: String,
}

impl Drop for DedupTicket {
    fn drop(&mut self) {
        let deduper = self.deduper.clone();
        let fingerprint = std::mem::take(&mut self.fingerprint);
        tokio::spawn(async move {
            deduper.finish(&fingerprint).await;
        });
    }
}

async fn handle_messages(
    state: AppState,
    headers: HeaderMap,
    body: Bytes,
    forced_channel: &str,
) -> Response {
    let Some(permit) = state.limiter.acquire().await else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "Request timeout or server busy",
        )
            .into_response();
    };

    let authorization = header_value(&headers, &["authorization"]).unwrap_or_default();
    let path = if forced_channel.is_empty() {
        "/v1/messages".to_string()
    } else {
        format!("/{forced_channel}/v1/messages")
    };
    let fingerprint = request_fingerprint("POST", &path, &authorization, &body);
    let (duplicate, in_flight) = state.deduper.register(&fingerprint).await;
    if duplicate && in_flight {
        return AppError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_error",
            "identical request already in flight",
        )
        .into_response();
    }
    if duplicate {
        tracing::debug!(%fingerprint, "duplicate request replayed after completion");
    }
    let ticket = DedupTicket {
        deduper: state.deduper.clone(),
        fingerprint,
    };

    match process_messages(state, headers, body, forced_channel).await {
        Ok(RelayResponse::Stream(rx)) => {
            let stream = tokio_stream::wrappers::ReceiverStream::new(rx).map(
                move |event: Result<Event, Infallible>| {
                    let _held = (&ticket, &permit);
                    event
                },
            );
            Sse::new(stream).into_response()
        }
        Ok(RelayResponse::Complete(value)) => {
            drop(ticket);
            drop(permit);
            axum::Json(value).into_response()
        }
        Err(err) => {
            drop(ticket);
            drop(permit);
            err.into_response()
        }
    }
}

async fn process_messages(
    state: AppState,
    headers: HeaderMap,
    body: Bytes,
    forced_channel: &str,
) -> AppResult<RelayResponse> {
    let value: Value = serde_json::from_slice(&body).map_err(|err| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            format!("invalid request body: {err}"),
        )
    })?;
    let mut request: MessagesRequest = serde_json::from_value(value).map_err(|err| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            format!("invalid request: {err}"),
        )
    })?;
    if request.model.trim().is_empty() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "missing model",
        ));
    }

    // Model catalog decides the channel (unless the path forced one) and may
    // redirect to the upstream model id.
    let mut channel = forced_channel.to_string();
    match state.store.get_model_by_model_id(&request.model).await {
        Ok(Some(record)) => {
            if channel.is_empty() {
                channel = record.channel.clone();
            }
            if !record.upstream_model.trim().is_empty() {
                tracing::info!(
                    requested = %request.model,
                    upstream = %record.upstream_model,
                    "model mapped"
                );
                request.model = record.upstream_model.clone();
            }
        }
        Ok(None) => {}
        Err(err) => {
            tracing::warn!(%err, "model lookup failed, proceeding without mapping");
        }
    }

    let conversation_id = conversation_key(&headers, &request);
    let workdir = extract_workdir(&headers, &request);

    let options = RelayOptions {
        channel,
        workdir,
        conversation_id,
    };
    relay_messages(state, request, options).await
}

fn header_value(headers: &HeaderMap, names: &[&str]) -> Option<String> {
    for name in names {
        if let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

fn metadata_string(metadata: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(value) = metadata.get(*key).and_then(|v| v.as_str()) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Conversation key precedence: request field, metadata, header. Empty is
/// allowed; there is deliberately no IP or user-agent fallback.
fn conversation_key(headers: &HeaderMap, request: &MessagesRequest) -> String {
    if let Some(id) = request
        .conversation_id
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return id.to_string();
    }
    if let Some(id) = metadata_string(
        &request.metadata,
        &[
            "conversation_id",
            "conversationId",
            "session_id",
            "sessionId",
            "thread_id",
            "threadId",
            "chat_id",
            "chatId",
        ],
    ) {
        return id;
    }
    header_value(
        headers,
        &[
            "x-conversation-id",
            "x-session-id",
            "x-thread-id",
            "x-chat-id",
        ],
    )
    .unwrap_or_default()
}

/// Workdir precedence: metadata, header, system text.
fn extract_workdir(headers: &HeaderMap, request: &MessagesRequest) -> PathBuf {
    if let Some(dir) = metadata_string(
        &request.metadata,
        &[
            "workdir",
            "working_directory",
            "workingDirectory",
            "cwd",
            "workspace",
            "workspace_path",
            "workspacePath",
            "project_root",
            "projectRoot",
        ],
    ) {
        return PathBuf::from(dir);
    }
    if let Some(dir) = header_value(
        headers,
        &[
            "x-workdir",
            "x-working-directory",
            "x-cwd",
            "x-workspace",
            "x-project-root",
        ],
    ) {
        return PathBuf::from(dir);
    }
    let from_system = prompt::extract_workdir_from_system(&request.system.0);
    if !from_system.is_empty() {
        return PathBuf::from(from_system);
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

pub async fn list_models(State(state): State<AppState>) -> AppResult<Response> {
    list_models_for_channel(state, "").await
}

pub async fn list_models_orchids(State(state): State<AppState>) -> AppResult<Response> {
    list_models_for_channel(state, "orchids").await
}

pub async fn list_models_warp(State(state): State<AppState>) -> AppResult<Response> {
    list_models_for_channel(state, "warp").await
}

pub async fn list_models_grok(State(state): State<AppState>) -> AppResult<Response> {
    list_models_for_channel(state, "grok").await
}

async fn list_models_for_channel(state: AppState, channel: &str) -> AppResult<Response> {
    let models = state
        .store
        .list_models()
        .await
        .map_err(|e| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "api_error", e))?;

    let data: Vec<Value> = models
        .into_iter()
        .filter(|m| m.enabled)
        .filter(|m| channel.is_empty() || m.channel.eq_ignore_ascii_case(channel))
        .map(|m| {
            json!({
                "id": m.model_id,
                "object": "model",
                "created": 1677610602,
                "owned_by": m.channel,
            })
        })
        .collect();

    Ok(axum::Json(json!({"object": "list", "data": data})).into_response())
}

pub async fn get_model(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> AppResult<Response> {
    get_model_for_channel(state, "", &model_id).await
}

pub async fn get_model_orchids(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> AppResult<Response> {
    get_model_for_channel(state, "orchids", &model_id).await
}

pub async fn get_model_warp(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> AppResult<Response> {
    get_model_for_channel(state, "warp", &model_id).await
}

pub async fn get_model_grok(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> AppResult<Response> {
    get_model_for_channel(state, "grok", &model_id).await
}

async fn get_model_for_channel(
    state: AppState,
    channel: &str,
    model_id: &str,
) -> AppResult<Response> {
    let record = state
        .store
        .get_model_by_model_id(model_id)
        .await
        .map_err(|e| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "api_error", e))?
        .filter(|m| channel.is_empty() || m.channel.eq_ignore_ascii_case(channel))
        .ok_or_else(|| {
            AppError::new(
                StatusCode::NOT_FOUND,
                "not_found_error",
                format!("model '{model_id}' not found"),
            )
        })?;

    Ok(axum::Json(json!({
        "id": record.model_id,
        "object": "model",
        "created": 1677610602,
        "owned_by": record.channel,
    }))
    .into_response())
}

/// OpenAI-compatible surface for the grok channel's images-only fast path:
/// when the request just wants the collected image links, reply without an
/// upstream round-trip.
pub async fn grok_chat_completions(
    State(_state): State<AppState>,
    axum::Json(body): axum::Json<Value>,
) -> AppResult<Response> {
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("grok-agent")
        .to_string();
    let stream = body
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let messages = chat_messages_to_canonical(body.get("messages"));

    let user_text = prompt::extract_user_text(&messages);
    let urls = collect_image_urls(&messages);
    if !wants_images(&user_text) || urls.is_empty() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "this endpoint only serves image requests with collected image links; use /grok/v1/messages for chat",
        ));
    }

    if stream {
        let chunks = images_only_chat_chunks(&model, &urls);
        let mut events: Vec<Result<Event, Infallible>> = chunks
            .into_iter()
            .map(|chunk| Ok(Event::default().data(chunk.to_string())))
            .collect();
        events.push(Ok(Event::default().data("[DONE]")));
        let stream = futures_util::stream::iter(events);
        return Ok(Sse::new(stream).into_response());
    }
    Ok(axum::Json(images_only_chat_completion(&model, &urls)).into_response())
}

fn chat_messages_to_canonical(messages: Option<&Value>) -> Vec<Message> {
    let Some(items) = messages.and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for item in items {
        let role = item
            .get("role")
            .and_then(|v| v.as_str())
            .unwrap_or("user")
            .to_string();
        match item.get("content") {
            Some(Value::String(text)) => out.push(Message::text(&role, text.clone())),
            Some(Value::Array(parts)) => {
                let mut text_parts = Vec::new();
                for part in parts {
                    if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                        text_parts.push(text.to_string());
                    }
                    if let Some(url) = part
                        .get("image_url")
                        .and_then(|v| v.get("url"))
                        .and_then(|v| v.as_str())
                    {
                        text_parts.push(url.to_string());
                    }
                }
                out.push(Message::text(&role, text_parts.join("\n")));
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_key_prefers_request_field() {
        let mut headers = HeaderMap::new();
        headers.insert("x-conversation-id", "from-header".parse().unwrap());
        let mut metadata = Map::new();
        metadata.insert(
            "conversation_id".to_string(),
            Value::String("from-metadata".to_string()),
        );
        let request = MessagesRequest {
            model: "m".to_string(),
            messages: Vec::new(),
            system: Default::default(),
            tools: Vec::new(),
            stream: false,
            conversation_id: Some("from-field".to_string()),
            metadata,
        };
        assert_eq!(conversation_key(&headers, &request), "from-field");
    }

    #[test]
    fn conversation_key_falls_back_metadata_then_header_then_empty() {
        let mut headers = HeaderMap::new();
        headers.insert("x-session-id", "from-header".parse().unwrap());
        let mut request = MessagesRequest {
            model: "m".to_string(),
            messages: Vec::new(),
            system: Default::default(),
            tools: Vec::new(),
            stream: false,
            conversation_id: None,
            metadata: Map::new(),
        };
        assert_eq!(conversation_key(&headers, &request), "from-header");

        request.metadata.insert(
            "sessionId".to_string(),
            Value::String("from-metadata".to_string()),
        );
        assert_eq!(conversation_key(&headers, &request), "from-metadata");

        let empty_request = MessagesRequest {
            metadata: Map::new(),
            ..request
        };
        assert_eq!(conversation_key(&HeaderMap::new(), &empty_request), "");
    }

    #[test]
    fn workdir_prefers_metadata_over_header_and_system() {
        let mut headers = HeaderMap::new();
        headers.insert("x-workdir", "/from/header".parse().unwrap());
        let mut metadata = Map::new();
        metadata.insert("cwd".to_string(), Value::String("/from/metadata".to_string()));
        let request = MessagesRequest {
            model: "m".to_string(),
            messages: Vec::new(),
            system: serde_json::from_value(serde_json::json!(
                "working directory: /from/system"
            ))
            .unwrap(),
            tools: Vec::new(),
            stream: false,
            conversation_id: None,
            metadata,
        };
        assert_eq!(extract_workdir(&headers, &request), PathBuf::from("/from/metadata"));

        let request = MessagesRequest {
            metadata: Map::new(),
            ..request
        };
        assert_eq!(extract_workdir(&headers, &request), PathBuf::from("/from/header"));

        assert_eq!(
            extract_workdir(&HeaderMap::new(), &request),
            PathBuf::from("/from/system")
        );
    }

    #[test]
    fn chat_messages_convert_string_and_part_content() {
        let messages = chat_messages_to_canonical(Some(&serde_json::json!([
            {"role": "user", "content": "draw https://x/a.png"},
            {"role": "user", "content": [
                {"type": "text", "text": "and this"},
                {"type": "image_url", "image_url": {"url": "https://x/b.png"}}
            ]}
        ])));
        assert_eq!(messages.len(), 2);
        assert!(messages[1].plain_text().contains("https://x/b.png"));
    }
}
