use axum::body::Body;
use axum::extract::Json;
use axum::http::{Request, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::post;
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tower::ServiceExt;
use trellis::app::{build_app, load_state_with_settings, AppState};
use trellis::config::{Settings, ToolCallMode};
use trellis::store::{ModelRecord, NewAccount};

static MOCK_ADDR: OnceLock<SocketAddr> = OnceLock::new();
static ATTEMPTS: OnceLock<Mutex<HashMap<String, u32>>> = OnceLock::new();

fn attempts() -> &'static Mutex<HashMap<String, u32>> {
    ATTEMPTS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn model_event(event: Value) -> Result<Event, Infallible> {
    Ok(Event::default().data(json!({"type": "model", "event": event}).to_string()))
}

fn text_round(text: &str) -> Vec<Result<Event, Infallible>> {
    vec![
        model_event(json!({"type": "text-start"})),
        model_event(json!({"type": "text-delta", "delta": text})),
        model_event(json!({"type": "text-end"})),
        model_event(json!({"type": "finish", "finishReason": "stop"})),
    ]
}

async fn mock_agent(Json(body): Json<Value>) -> Response {
    let prompt = body.get("prompt").and_then(|v| v.as_str()).unwrap_or("");
    let chat_history = body
        .get("chatHistory")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    if let Some(rest) = prompt.split("RETRY_ONCE key=").nth(1) {
        let key: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        let attempt = {
            let mut map = attempts().lock().unwrap();
            let entry = map.entry(key).or_insert(0);
            *entry += 1;
            *entry
        };
        if attempt == 1 {
            return Response::builder()
                .status(StatusCode::TOO_MANY_REQUESTS)
                .header("retry-after", "1")
                .body(Body::from("rate limited"))
                .unwrap();
        }
        return Sse::new(futures_util::stream::iter(text_round("hello"))).into_response();
    }

    if prompt.contains("SLOW_ROUND") {
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        return Sse::new(futures_util::stream::iter(text_round("slow hello"))).into_response();
    }

    if prompt.contains("STREAM_AB") {
        let events = vec![
            model_event(json!({"type": "text-start"})),
            model_event(json!({"type": "text-delta", "delta": "A"})),
            model_event(json!({"type": "text-delta", "delta": "B"})),
            model_event(json!({"type": "text-end"})),
            model_event(json!({
                "type": "finish",
                "finishReason": "stop",
                "usage": {"inputTokens": 12, "outputTokens": 2}
            })),
        ];
        return Sse::new(futures_util::stream::iter(events)).into_response();
    }

    if prompt.contains("TOOL_ROUND") {
        let events = vec![
            model_event(json!({"type": "tool-input-start", "id": "T1", "toolName": "bash"})),
            model_event(json!({"type": "tool-input-delta", "id": "T1", "delta": "{\"command\":\"p"})),
            model_event(json!({"type": "tool-input-delta", "id": "T1", "delta": "wd\"}"})),
            model_event(json!({"type": "tool-input-end", "id": "T1"})),
            model_event(json!({"type": "finish", "finishReason": "tool-calls"})),
        ];
        return Sse::new(futures_util::stream::iter(events)).into_response();
    }

    if prompt.contains("INTERNAL_FIND") {
        // Second round carries the locally-executed tool result back up.
        let tool_result = chat_history.iter().find_map(|entry| {
            entry
                .get("content")
                .and_then(|v| v.as_array())
                .and_then(|blocks| {
                    blocks.iter().find(|b| {
                        b.get("type").and_then(|t| t.as_str()) == Some("tool_result")
                    })
                })
                .cloned()
        });
        if let Some(result) = tool_result {
            let id_ok = result.get("tool_use_id").and_then(|v| v.as_str()) == Some("srv_tool_1");
            let content = result
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let reply = format!(
                "tool-{}:{}",
                if id_ok { "ok" } else { "mismatch" },
                content
            );
            return Sse::new(futures_util::stream::iter(text_round(&reply))).into_response();
        }
        let input = json!({"command": "find . -maxdepth 2 -type f -name \"*.rs\""}).to_string();
        let events = vec![
            model_event(json!({
                "type": "tool-call",
                "toolCallId": "srv_tool_1",
                "toolName": "bash",
                "input": input,
            })),
            model_event(json!({"type": "finish", "finishReason": "tool-calls"})),
        ];
        return Sse::new(futures_util::stream::iter(events)).into_response();
    }

    Sse::new(futures_util::stream::iter(text_round("hello"))).into_response()
}

fn mock_upstream() -> SocketAddr {
    *MOCK_ADDR.get_or_init(|| {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Runtime::new().expect("mock runtime");
            runtime.block_on(async move {
                let app = Router::new().route("/agent", post(mock_agent));
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                    .await
                    .expect("bind mock upstream");
                tx.send(listener.local_addr().unwrap()).unwrap();
                axum::serve(listener, app).await.unwrap();
            });
        });
        let addr = rx.recv().expect("mock upstream addr");
        std::env::set_var("UPSTREAM_URL", format!("http://{addr}/agent"));
        std::env::set_var("UPSTREAM_TOKEN", "test-jwt");
        addr
    })
}

struct TestContext {
    router: Router,
    state: AppState,
    _temp_dir: TempDir,
}

fn test_settings(temp_dir: &TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.database_dsn = format!(
        "sqlite://{}",
        temp_dir.path().join("trellis-test.db").display()
    );
    settings.max_retries = 2;
    settings.retry_delay_ms = 50;
    settings.balancer_cache_ttl_secs = 1;
    settings
}

async fn setup_with(customize: impl FnOnce(&mut Settings)) -> TestContext {
    mock_upstream();
    let temp_dir = TempDir::new().expect("temp dir");
    let mut settings = test_settings(&temp_dir);
    customize(&mut settings);
    let state = load_state_with_settings(settings).await.expect("state");

    for name in ["acct-1", "acct-2"] {
        state
            .store
            .create_account(NewAccount {
                name: name.to_string(),
                session_id: format!("sess-{name}"),
                agent_mode: "orchids".to_string(),
                email: format!("{name}@example.com"),
                weight: 1,
                enabled: true,
                ..Default::default()
            })
            .await
            .expect("account");
    }
    for (model_id, channel, upstream) in [
        ("claude-sonnet", "orchids", "mock-sonnet"),
        ("warp-agent", "warp", "mock-warp"),
    ] {
        state
            .store
            .upsert_model(&ModelRecord {
                id: 0,
                model_id: model_id.to_string(),
                channel: channel.to_string(),
                upstream_model: upstream.to_string(),
                display_name: model_id.to_string(),
                enabled: true,
                is_default: true,
                sort_order: 0,
            })
            .await
            .expect("model");
    }

    TestContext {
        router: build_app(state.clone()),
        state,
        _temp_dir: temp_dir,
    }
}

async fn setup() -> TestContext {
    setup_with(|_| {}).await
}

async fn post_json(ctx: &TestContext, path: &str, body: Value) -> (StatusCode, String) {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = ctx.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

async fn get_path(ctx: &TestContext, path: &str) -> (StatusCode, String) {
    let request = Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .unwrap();
    let response = ctx.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

fn messages_body(user_text: &str, stream: bool) -> Value {
    json!({
        "model": "claude-sonnet",
        "messages": [{"role": "user", "content": user_text}],
        "stream": stream,
    })
}

/// Parses an SSE body into (event, data) pairs, skipping comment frames.
fn parse_sse(body: &str) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    for frame in body.split("\n\n") {
        let mut event_name = String::new();
        let mut data = String::new();
        for line in frame.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                event_name = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("data:") {
                data = rest.trim().to_string();
            }
        }
        if data.is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(&data) {
            Ok(value) => value,
            Err(_) => continue,
        };
        if event_name.is_empty() {
            event_name = value
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
        }
        out.push((event_name, value));
    }
    out
}

/// Block-index protocol: contiguous indices from 0, exactly one start per
/// index, deltas only between start and stop.
fn assert_block_protocol(events: &[(String, Value)]) {
    let mut started: Vec<i64> = Vec::new();
    let mut stopped: Vec<i64> = Vec::new();
    let mut next_expected = 0i64;
    for (name, data) in events {
        let index = data.get("index").and_then(|v| v.as_i64());
        match name.as_str() {
            "content_block_start" => {
                let idx = index.expect("start carries index");
                assert_eq!(idx, next_expected, "non-contiguous block index");
                assert!(!started.contains(&idx), "second start for index {idx}");
                started.push(idx);
                next_expected += 1;
            }
            "content_block_delta" => {
                let idx = index.expect("delta carries index");
                assert!(started.contains(&idx), "delta without start for {idx}");
                assert!(!stopped.contains(&idx), "delta after stop for {idx}");
            }
            "content_block_stop" => {
                let idx = index.expect("stop carries index");
                assert!(started.contains(&idx), "stop without start for {idx}");
                stopped.push(idx);
            }
            _ => {}
        }
    }
    assert_eq!(started.len(), stopped.len(), "unclosed blocks");
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let ctx = setup().await;
    let (status, body) = get_path(&ctx, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.trim(), r#"{"status":"ok"}"#);
}

#[tokio::test]
async fn non_stream_single_text_block() {
    let ctx = setup().await;
    let (status, body) = post_json(&ctx, "/v1/messages", messages_body("say hello", false)).await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["type"], "message");
    assert_eq!(value["stop_reason"], "end_turn");
    assert_eq!(value["content"], json!([{"type": "text", "text": "hello"}]));
    // Final-mode estimate of "hello" is one word.
    assert_eq!(value["usage"]["output_tokens"], 1);
    assert!(value["usage"]["input_tokens"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn streaming_emits_anthropic_event_sequence() {
    let ctx = setup().await;
    let (status, body) = post_json(&ctx, "/v1/messages", messages_body("STREAM_AB", true)).await;
    assert_eq!(status, StatusCode::OK);
    let events = parse_sse(&body);
    let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
    assert_eq!(events[1].1["content_block"]["type"], "text");
    assert_eq!(events[1].1["index"], 0);
    assert_eq!(events[2].1["delta"]["text"], "A");
    assert_eq!(events[3].1["delta"]["text"], "B");
    assert_eq!(events[5].1["delta"]["stop_reason"], "end_turn");
    // Upstream usage wins over the local estimate.
    assert_eq!(events[5].1["usage"]["output_tokens"], 2);
    assert_block_protocol(&events);
}

#[tokio::test]
async fn streaming_tool_call_proxy_mode() {
    let ctx = setup().await;
    let body = json!({
        "model": "claude-sonnet",
        "messages": [{"role": "user", "content": "TOOL_ROUND please"}],
        "tools": [{"name": "bash", "description": "run a command", "input_schema": {}}],
        "stream": true,
    });
    let (status, body) = post_json(&ctx, "/v1/messages", body).await;
    assert_eq!(status, StatusCode::OK);
    let events = parse_sse(&body);
    assert_block_protocol(&events);

    let tool_starts: Vec<&Value> = events
        .iter()
        .filter(|(name, data)| {
            name == "content_block_start"
                && data["content_block"]["type"] == "tool_use"
        })
        .map(|(_, data)| data)
        .collect();
    assert_eq!(tool_starts.len(), 1, "exactly one tool_use block");
    assert_eq!(tool_starts[0]["content_block"]["id"], "T1");
    assert_eq!(tool_starts[0]["content_block"]["name"], "bash");

    let tool_index = tool_starts[0]["index"].as_i64().unwrap();
    let partial: String = events
        .iter()
        .filter(|(name, data)| {
            name == "content_block_delta"
                && data["index"].as_i64() == Some(tool_index)
                && data["delta"]["type"] == "input_json_delta"
        })
        .map(|(_, data)| data["delta"]["partial_json"].as_str().unwrap().to_string())
        .collect();
    let input: Value = serde_json::from_str(&partial).expect("assembled tool input parses");
    assert_eq!(input, json!({"command": "pwd"}));

    let message_delta = events
        .iter()
        .find(|(name, _)| name == "message_delta")
        .unwrap();
    assert_eq!(message_delta.1["delta"]["stop_reason"], "tool_use");
}

#[tokio::test]
async fn retry_after_429_fails_over_seamlessly() {
    let ctx = setup().await;
    let key = format!("k-{}", uuid_like());
    let started = Instant::now();
    let (status, body) = post_json(
        &ctx,
        "/v1/messages",
        messages_body(&format!("RETRY_ONCE key={key}"), false),
    )
    .await;
    let elapsed = started.elapsed();
    assert_eq!(status, StatusCode::OK, "body: {body}");
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["content"][0]["text"], "hello");

    let attempt_count = *attempts().lock().unwrap().get(&key).unwrap();
    assert_eq!(attempt_count, 2, "one failover retry");
    assert!(
        elapsed >= Duration::from_secs(1),
        "Retry-After not honored: {elapsed:?}"
    );

    // Quiescence: every acquire was released.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let accounts = ctx.state.store.list_enabled_accounts().await.unwrap();
    for account in accounts {
        assert_eq!(ctx.state.balancer.active_connections(account.id).await, 0);
    }
}

#[tokio::test]
async fn streaming_retry_writes_message_start_once() {
    let ctx = setup().await;
    let key = format!("s-{}", uuid_like());
    let (status, body) = post_json(
        &ctx,
        "/v1/messages",
        messages_body(&format!("RETRY_ONCE key={key}"), true),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let starts = body.matches("message_start").count();
    assert_eq!(starts, 2, "one event name line + one payload type field");
    let events = parse_sse(&body);
    assert_eq!(
        events.iter().filter(|(n, _)| n == "message_start").count(),
        1
    );
    assert!(events.iter().any(|(n, _)| n == "message_stop"));
}

#[tokio::test]
async fn concurrency_limit_rejects_second_request() {
    let ctx = setup_with(|settings| {
        settings.concurrency_limit = 1;
        settings.concurrency_timeout_secs = 1;
    })
    .await;

    let router = ctx.router.clone();
    let first = tokio::spawn(async move {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/messages")
            .header("content-type", "application/json")
            .body(Body::from(messages_body("SLOW_ROUND", false).to_string()))
            .unwrap();
        router.oneshot(request).await.unwrap()
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    let (status, body) = post_json(&ctx, "/v1/messages", messages_body("quick", false)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, "Request timeout or server busy");
    assert!(started.elapsed() >= Duration::from_millis(900));

    let response = first.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn duplicate_in_flight_request_is_rejected() {
    let ctx = setup().await;
    let body = messages_body("SLOW_ROUND dedup", false);

    let router = ctx.router.clone();
    let body_clone = body.clone();
    let first = tokio::spawn(async move {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/messages")
            .header("content-type", "application/json")
            .body(Body::from(body_clone.to_string()))
            .unwrap();
        router.oneshot(request).await.unwrap()
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (status, text) = post_json(&ctx, "/v1/messages", body.clone()).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS, "body: {text}");
    assert!(text.contains("already in flight"));

    let response = first.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // After the holder finishes (the release is asynchronous), the same body
    // is accepted again.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (status, _) = post_json(&ctx, "/v1/messages", body).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn internal_tool_mode_executes_find_and_replays() {
    let workdir = TempDir::new().unwrap();
    std::fs::create_dir_all(workdir.path().join("src")).unwrap();
    std::fs::write(workdir.path().join("src/main.rs"), "fn main() {}").unwrap();
    std::fs::write(workdir.path().join("notes.txt"), "not rust").unwrap();

    let ctx = setup_with(|settings| {
        settings.tool_call_mode = ToolCallMode::Internal;
    })
    .await;

    let body = json!({
        "model": "claude-sonnet",
        "messages": [{"role": "user", "content": "INTERNAL_FIND in my project"}],
        "tools": [{"name": "bash", "description": "run a command", "input_schema": {}}],
        "stream": false,
        "metadata": {"workdir": workdir.path().display().to_string()},
    });
    let (status, body) = post_json(&ctx, "/v1/messages", body).await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    let value: Value = serde_json::from_str(&body).unwrap();
    let text = value["content"][0]["text"].as_str().unwrap();
    assert!(text.starts_with("tool-ok:"), "tool_use_id mismatch: {text}");
    assert!(text.contains("./src/main.rs"), "missing find output: {text}");
    assert!(!text.contains("notes.txt"));
    assert_eq!(value["stop_reason"], "end_turn");
}

#[tokio::test]
async fn no_accounts_for_channel_returns_503() {
    let ctx = setup().await;
    let (status, body) = post_json(
        &ctx,
        "/warp/v1/messages",
        json!({
            "model": "warp-agent",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": false,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "body: {body}");
    assert!(body.contains("no enabled accounts"));
}

#[tokio::test]
async fn invalid_system_shape_is_a_client_error() {
    let ctx = setup().await;
    let (status, body) = post_json(
        &ctx,
        "/v1/messages",
        json!({
            "model": "claude-sonnet",
            "messages": [{"role": "user", "content": "hi"}],
            "system": 42,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("invalid_request_error"));
}

#[tokio::test]
async fn models_listing_filters_by_channel() {
    let ctx = setup().await;

    let (status, body) = get_path(&ctx, "/v1/models").await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).unwrap();
    let ids: Vec<&str> = value["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"claude-sonnet"));
    assert!(ids.contains(&"warp-agent"));

    let (_, body) = get_path(&ctx, "/warp/v1/models").await;
    let value: Value = serde_json::from_str(&body).unwrap();
    let data = value["data"].as_array().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["id"], "warp-agent");
    assert_eq!(data[0]["owned_by"], "warp");

    let (status, body) = get_path(&ctx, "/orchids/v1/models/claude-sonnet").await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["id"], "claude-sonnet");

    let (status, _) = get_path(&ctx, "/v1/models/unknown-model").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get_path(&ctx, "/warp/v1/models/claude-sonnet").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn grok_images_only_completion_is_synthesized() {
    let ctx = setup().await;
    let (status, body) = post_json(
        &ctx,
        "/grok/v1/chat/completions",
        json!({
            "model": "grok-agent",
            "messages": [{"role": "user", "content": "draw from https://cdn.example/a.png"}],
            "stream": false,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["object"], "chat.completion");
    assert!(value["choices"][0]["message"]["content"]
        .as_str()
        .unwrap()
        .contains("![](https://cdn.example/a.png)"));

    let (status, body) = post_json(
        &ctx,
        "/grok/v1/chat/completions",
        json!({
            "model": "grok-agent",
            "messages": [{"role": "user", "content": "draw from https://cdn.example/a.png"}],
            "stream": true,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("chat.completion.chunk"));
    assert!(body.contains("[DONE]"));
}

fn uuid_like() -> String {
    format!(
        "{:x}{:x}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos(),
        std::process::id()
    )
}
