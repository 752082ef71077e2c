use crate::app::AppState;
use crate::config::{OutputTokenMode, ToolCallMode};
use crate::dispatch::{DispatchError, Dispatcher, FinishReason, UpstreamEvent, UpstreamRequest};
use crate::error::{AppError, AppResult};
use crate::prompt::{
    self, build_prompt, estimate_text_tokens, ContentBlock, Message, MessagesRequest,
    PromptInput, PromptOptions, SystemItem,
};
use crate::safe_tools::{execute_safe_tool, SafeToolResult};
use crate::store::Account;
use crate::tools::{filter_supported_tools, fix_tool_input, ToolCall, ToolTracker};
use axum::http::StatusCode;
use axum::response::sse::Event;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const EVENT_CHANNEL_CAPACITY: usize = 64;

pub enum RelayResponse {
    Stream(mpsc::Receiver<Result<Event, std::convert::Infallible>>),
    Complete(Value),
}

#[derive(Clone)]
pub struct RelayOptions {
    pub channel: String,
    pub workdir: PathBuf,
    pub conversation_id: String,
}

/// Releases the account's live-connection slot on every exit path,
/// including task panics.
struct ConnectionGuard {
    balancer: Arc<crate::balancer::LoadBalancer>,
    id: i64,
}

impl ConnectionGuard {
    fn hold(balancer: Arc<crate::balancer::LoadBalancer>, id: i64) -> Self {
        Self { balancer, id }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let balancer = self.balancer.clone();
        let id = self.id;
        tokio::spawn(async move {
            balancer.release(id).await;
        });
    }
}

struct TokenTally {
    mode: OutputTokenMode,
    input: u64,
    output: u64,
    aggregate: String,
    use_upstream: bool,
}

impl TokenTally {
    fn new(mode: OutputTokenMode, input: u64) -> Self {
        Self {
            mode,
            input,
            output: 0,
            aggregate: String::new(),
            use_upstream: false,
        }
    }

    fn add_output(&mut self, text: &str) {
        if text.is_empty() || self.use_upstream {
            return;
        }
        match self.mode {
            OutputTokenMode::Stream => self.output += estimate_text_tokens(text),
            _ => self.aggregate.push_str(text),
        }
    }

    fn set_usage(&mut self, input: Option<u64>, output: Option<u64>) {
        if let Some(input) = input {
            self.input = input;
        }
        if let Some(output) = output {
            self.output = output;
        }
        self.use_upstream = true;
    }

    fn finalize(&mut self) {
        if self.use_upstream || self.mode == OutputTokenMode::Stream {
            return;
        }
        self.output = estimate_text_tokens(&self.aggregate);
    }

    fn reset_round(&mut self) {
        self.output = 0;
        self.aggregate.clear();
        self.use_upstream = false;
    }
}

struct MessageRelay {
    state: AppState,
    options: RelayOptions,
    mode: ToolCallMode,
    is_stream: bool,
    client: Option<mpsc::Sender<Result<Event, std::convert::Infallible>>>,

    msg_id: String,
    model: String,
    effective_tools: Vec<Value>,
    built_prompt: String,
    upstream_messages: Vec<Message>,
    system: Vec<SystemItem>,
    chat_history: Vec<Value>,

    block_index: i64,
    open_block: Option<i64>,
    tracker: ToolTracker,
    pending_tool_calls: Vec<ToolCall>,
    tool_call_count: u32,
    content_blocks: Vec<Value>,
    current_text_index: Option<usize>,
    text_builders: Vec<(usize, String)>,
    response_text: String,
    tally: TokenTally,
    internal_results: Vec<SafeToolResult>,
    internal_needs_followup: bool,
    finished: bool,
    final_stop_reason: String,
    client_gone: bool,
}

/// Entry point for `/v1/messages`: validates account availability up front
/// (so capacity problems surface as HTTP 503 before any frame is written),
/// then drives the full streaming state machine.
pub async fn relay_messages(
    state: AppState,
    request: MessagesRequest,
    options: RelayOptions,
) -> AppResult<RelayResponse> {
    metrics::counter!("trellis_requests_total").increment(1);

    let mut mode = state.settings.tool_call_mode;
    if prompt::is_plan_mode(&request.messages) {
        mode = ToolCallMode::Proxy;
    }
    let effective_tools = match mode {
        ToolCallMode::Proxy => request.tools.clone(),
        _ => filter_supported_tools(&request.tools),
    };

    let prompt_opts = PromptOptions {
        conversation_id: options.conversation_id.clone(),
        max_tokens: state.settings.context_max_tokens,
        summary_max_tokens: state.settings.context_summary_max_tokens,
        keep_turns: state.settings.context_keep_turns,
        cache: state.summary_cache.clone(),
    };
    let (hits_before, misses_before) = state.summary_stats.snapshot();
    let built_prompt = build_prompt(
        &PromptInput {
            messages: &request.messages,
            system: &request.system.0,
            tools: &effective_tools,
        },
        &prompt_opts,
    )
    .await;
    let (hits_after, misses_after) = state.summary_stats.snapshot();
    if hits_after > hits_before || misses_after > misses_before {
        tracing::debug!(
            hits = hits_after - hits_before,
            misses = misses_after - misses_before,
            "summary cache consulted"
        );
    }

    // Internal tool execution replays follow-up turns; the upstream leg runs
    // non-streaming there so each round is a complete response.
    let mut is_stream = request.stream;
    if mode == ToolCallMode::Internal && is_stream {
        is_stream = false;
    }

    let first_account = select_first_account(&state, &options.channel).await?;

    let input_tokens = estimate_text_tokens(&built_prompt);
    let tracker = ToolTracker::new(&effective_tools);
    let msg_id = format!("msg_{}", uuid::Uuid::new_v4().simple());

    let (client_tx, client_rx) = if is_stream {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    let relay = MessageRelay {
        mode,
        is_stream,
        client: client_tx,
        msg_id,
        model: request.model.clone(),
        effective_tools,
        built_prompt,
        upstream_messages: request.messages.clone(),
        system: request.system.0.clone(),
        chat_history: Vec::new(),
        block_index: -1,
        open_block: None,
        tracker,
        pending_tool_calls: Vec::new(),
        tool_call_count: 0,
        content_blocks: Vec::new(),
        current_text_index: None,
        text_builders: Vec::new(),
        response_text: String::new(),
        tally: TokenTally::new(state.settings.output_token_mode, input_tokens),
        internal_results: Vec::new(),
        internal_needs_followup: false,
        finished: false,
        final_stop_reason: String::new(),
        client_gone: false,
        state,
        options,
    };

    if let Some(rx) = client_rx {
        tokio::spawn(async move {
            let _ = relay.run(first_account).await;
        });
        Ok(RelayResponse::Stream(rx))
    } else {
        let value = relay.run(first_account).await?;
        Ok(RelayResponse::Complete(value))
    }
}

async fn select_first_account(state: &AppState, channel: &str) -> AppResult<Account> {
    state
        .balancer
        .select(channel, &HashSet::new())
        .await
        .map_err(|err| match err {
            crate::balancer::BalanceError::NoAccountsAvailable => AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "overloaded_error",
                format!("no enabled accounts available for channel '{channel}'"),
            ),
            crate::balancer::BalanceError::Store(message) => {
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "api_error", message)
            }
        })
}

impl MessageRelay {
    async fn run(mut self, first_account: Account) -> AppResult<Value> {
        self.write_message_start().await;

        let mut account = first_account;
        let mut exclude: HashSet<i64> = HashSet::new();
        let mut guard = ConnectionGuard::hold(self.state.balancer.clone(), account.id);
        let mut surfaced: Option<AppError> = None;
        self.state.balancer.acquire(account.id).await;

        'rounds: loop {
            self.internal_needs_followup = false;
            self.internal_results.clear();
            let mut retries_remaining = self.state.settings.max_retries;

            loop {
                let outcome = self.run_attempt(&account).await;
                match outcome {
                    AttemptOutcome::Completed => {
                        let breaker = self.state.breakers.for_account(&account.name).await;
                        breaker.on_success().await;
                        let store = self.state.store.clone();
                        let account_id = account.id;
                        tokio::spawn(async move {
                            if let Err(err) = store.increment_usage(account_id).await {
                                tracing::warn!(account_id, %err, "failed to persist usage");
                            }
                        });
                        break;
                    }
                    AttemptOutcome::ClientGone => {
                        self.finish("end_turn").await;
                        break 'rounds;
                    }
                    AttemptOutcome::Failed(err) => {
                        tracing::error!(
                            account = %account.name,
                            error = %err,
                            "upstream request failed"
                        );
                        if err.is_client_error() {
                            // Credential-shaped 4xx: not account health, not retried.
                            surfaced = Some(self.surface_client_error(&err).await);
                            break 'rounds;
                        }
                        let breaker = self.state.breakers.for_account(&account.name).await;
                        breaker.on_failure().await;

                        if retries_remaining == 0 {
                            tracing::error!(account = %account.name, "max retries reached");
                            surfaced = Some(self.surface_exhausted(&err).await);
                            break 'rounds;
                        }
                        retries_remaining -= 1;
                        exclude.insert(account.id);
                        metrics::counter!("trellis_failovers_total").increment(1);

                        match self.next_account(&exclude).await {
                            Some(next) => {
                                tracing::warn!(
                                    failed = %account.name,
                                    next = %next.name,
                                    "switching account after upstream failure"
                                );
                                self.state.balancer.acquire(next.id).await;
                                drop(guard);
                                guard =
                                    ConnectionGuard::hold(self.state.balancer.clone(), next.id);
                                account = next;
                            }
                            None => {
                                tracing::error!("no more accounts available for failover");
                                surfaced = Some(self.surface_exhausted(&err).await);
                                break 'rounds;
                            }
                        }

                        let backoff = retry_backoff(
                            Duration::from_millis(self.state.settings.retry_delay_ms),
                            err.retry_after(),
                        );
                        if !backoff.is_zero() && !self.sleep_with_keepalive(backoff).await {
                            self.finish("end_turn").await;
                            break 'rounds;
                        }
                        self.reset_round_state().await;
                    }
                }
            }

            if self.internal_needs_followup
                && matches!(self.mode, ToolCallMode::Internal | ToolCallMode::Auto)
            {
                self.append_internal_results();
                self.reset_round_state().await;
                continue;
            }
            break;
        }

        drop(guard);

        if !self.finished {
            self.finish("end_turn").await;
        }

        if let Some(err) = surfaced {
            return Err(err);
        }
        Ok(self.into_response_json())
    }

    async fn next_account(&self, exclude: &HashSet<i64>) -> Option<Account> {
        self.state
            .balancer
            .select(&self.options.channel, exclude)
            .await
            .ok()
    }

    /// One upstream round: spawn the dispatcher, consume its events, keep the
    /// client alive, and watch for disconnects.
    async fn run_attempt(&mut self, account: &Account) -> AttemptOutcome {
        let breaker = self.state.breakers.for_account(&account.name).await;
        if !breaker.allow().await {
            return AttemptOutcome::Failed(DispatchError::Network(format!(
                "circuit breaker open for account {}",
                account.name
            )));
        }

        let dispatcher = self.make_dispatcher(account.clone());
        let upstream_request = UpstreamRequest {
            prompt: self.built_prompt.clone(),
            chat_history: self.chat_history.clone(),
            model: self.model.clone(),
            messages: self.upstream_messages.clone(),
            system: self.system.clone(),
            tools: self.effective_tools.clone(),
            stream: self.mode != ToolCallMode::Internal,
        };

        let (event_tx, mut event_rx) = mpsc::channel::<UpstreamEvent>(EVENT_CHANNEL_CAPACITY);
        let call = tokio::spawn(async move {
            dispatcher.send_request(&upstream_request, &event_tx).await
        });

        let mut keepalive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await; // first tick fires immediately; skip it

        let client_probe = self.client.clone();
        loop {
            let watch_client = self.is_stream && !self.client_gone;
            tokio::select! {
                event = event_rx.recv() => {
                    match event {
                        Some(event) => self.on_event(event).await,
                        None => break,
                    }
                }
                _ = keepalive.tick() => {
                    self.write_keepalive().await;
                }
                _ = client_closed(&client_probe), if watch_client => {
                    self.client_gone = true;
                }
            }
            if self.client_gone {
                call.abort();
                return AttemptOutcome::ClientGone;
            }
        }

        match call.await {
            Ok(Ok(())) => AttemptOutcome::Completed,
            Ok(Err(err)) => AttemptOutcome::Failed(err),
            Err(join_err) if join_err.is_cancelled() => AttemptOutcome::ClientGone,
            Err(join_err) => AttemptOutcome::Failed(DispatchError::Network(format!(
                "dispatcher task failed: {join_err}"
            ))),
        }
    }

    fn make_dispatcher(&self, account: Account) -> Dispatcher {
        let channel = if account.agent_mode.is_empty() {
            self.options.channel.clone()
        } else {
            account.agent_mode.to_ascii_lowercase()
        };
        match channel.as_str() {
            "warp" => Dispatcher::Warp(crate::dispatch::WarpDispatcher::new(
                account,
                self.state.http.clone(),
                self.state.settings.upstream_mode == "ws",
                self.state.settings.warp_max_tokens,
            )),
            "grok" => Dispatcher::Grok(crate::dispatch::GrokDispatcher::new(
                account,
                self.state.http.clone(),
            )),
            _ => Dispatcher::Orchids(crate::dispatch::OrchidsDispatcher::new(
                account,
                self.state.http.clone(),
                self.state.token_cache.clone(),
            )),
        }
    }

    async fn on_event(&mut self, event: UpstreamEvent) {
        if self.finished {
            return;
        }
        match event {
            UpstreamEvent::ReasoningStart => {
                let idx = self.next_block_index();
                self.open_block = Some(idx);
                self.write_event(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": idx,
                        "content_block": {"type": "thinking", "thinking": ""},
                    }),
                )
                .await;
            }
            UpstreamEvent::ReasoningDelta { delta } => {
                if self.is_stream {
                    self.tally.add_output(&delta);
                }
                let idx = self.block_index;
                self.write_event(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": idx,
                        "delta": {"type": "thinking_delta", "thinking": delta},
                    }),
                )
                .await;
            }
            UpstreamEvent::ReasoningEnd => {
                let idx = self.block_index;
                self.open_block = None;
                self.write_event(
                    "content_block_stop",
                    json!({"type": "content_block_stop", "index": idx}),
                )
                .await;
            }
            UpstreamEvent::TextStart => {
                let idx = self.next_block_index();
                self.open_block = Some(idx);
                if !self.is_stream {
                    self.content_blocks.push(json!({"type": "text"}));
                    let text_index = self.content_blocks.len() - 1;
                    self.current_text_index = Some(text_index);
                    self.text_builders.push((text_index, String::new()));
                }
                self.write_event(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": idx,
                        "content_block": {"type": "text", "text": ""},
                    }),
                )
                .await;
            }
            UpstreamEvent::TextDelta { delta } => {
                self.tally.add_output(&delta);
                if !self.is_stream {
                    self.response_text.push_str(&delta);
                    if let Some(text_index) = self.current_text_index {
                        if let Some((_, builder)) = self
                            .text_builders
                            .iter_mut()
                            .find(|(idx, _)| *idx == text_index)
                        {
                            builder.push_str(&delta);
                        }
                    }
                }
                let idx = self.block_index;
                self.write_event(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": idx,
                        "delta": {"type": "text_delta", "text": delta},
                    }),
                )
                .await;
            }
            UpstreamEvent::TextEnd => {
                let idx = self.block_index;
                self.open_block = None;
                self.write_event(
                    "content_block_stop",
                    json!({"type": "content_block_stop", "index": idx}),
                )
                .await;
            }
            UpstreamEvent::ToolInputStart { id, name } => {
                self.tracker.start(&id, &name);
                if !self.stream_tool_blocks() {
                    return;
                }
                let Some(resolved) = self.tracker.resolve_name(&name) else {
                    return;
                };
                self.tally.add_output(&resolved);
                let idx = self.next_block_index();
                self.tracker.blocks.insert(id.clone(), idx as u64);
                self.tool_call_count += 1;
                self.write_event(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": idx,
                        "content_block": {
                            "type": "tool_use",
                            "id": id,
                            "name": resolved,
                            "input": {},
                        },
                    }),
                )
                .await;
            }
            UpstreamEvent::ToolInputDelta { id, delta } => {
                self.tracker.append_delta(&id, &delta);
                if !self.stream_tool_blocks() || delta.is_empty() {
                    return;
                }
                let Some(idx) = self.tracker.blocks.get(&id).copied() else {
                    return;
                };
                self.write_event(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": idx,
                        "delta": {"type": "input_json_delta", "partial_json": delta},
                    }),
                )
                .await;
            }
            UpstreamEvent::ToolInputEnd { id } => {
                let buffered = self.tracker.buffered_input(&id);
                if self.stream_tool_blocks() {
                    if !buffered.is_empty() {
                        self.tally.add_output(&buffered);
                    }
                    if let Some(idx) = self.tracker.blocks.get(&id).copied() {
                        if !self.tracker.had_delta(&id) && !buffered.is_empty() {
                            self.write_event(
                                "content_block_delta",
                                json!({
                                    "type": "content_block_delta",
                                    "index": idx,
                                    "delta": {"type": "input_json_delta", "partial_json": buffered},
                                }),
                            )
                            .await;
                        }
                        self.write_event(
                            "content_block_stop",
                            json!({"type": "content_block_stop", "index": idx}),
                        )
                        .await;
                        self.tracker.blocks.remove(&id);
                    }
                }
                let Some(call) = self.tracker.finish(&id) else {
                    return;
                };
                if self.mode == ToolCallMode::Proxy && self.is_stream {
                    // The client already received the streamed block.
                    return;
                }
                self.handle_tool_call(call).await;
            }
            UpstreamEvent::ToolCall { id, name, input } => {
                let Some(call) = self.tracker.one_shot(&id, &name, &input) else {
                    return;
                };
                self.handle_tool_call(call).await;
            }
            UpstreamEvent::TokensUsed { input, output } => {
                if input.is_some() || output.is_some() {
                    self.tally.set_usage(input, output);
                }
            }
            UpstreamEvent::Finish {
                reason,
                input_tokens,
                output_tokens,
            } => {
                if input_tokens.is_some() || output_tokens.is_some() {
                    self.tally.set_usage(input_tokens, output_tokens);
                }
                let stop_reason = match reason {
                    FinishReason::ToolCalls => "tool_use",
                    _ => "end_turn",
                };
                if stop_reason == "tool_use"
                    && matches!(self.mode, ToolCallMode::Internal | ToolCallMode::Auto)
                {
                    if !self.internal_results.is_empty() {
                        self.internal_needs_followup = true;
                    }
                    return;
                }
                self.finish(stop_reason).await;
            }
        }
    }

    fn stream_tool_blocks(&self) -> bool {
        self.is_stream && matches!(self.mode, ToolCallMode::Proxy | ToolCallMode::Auto)
    }

    async fn handle_tool_call(&mut self, call: ToolCall) {
        if call.id.is_empty() {
            return;
        }
        match self.mode {
            ToolCallMode::Internal => {
                let result = execute_safe_tool(&call, &self.options.workdir);
                self.internal_results.push(result);
            }
            ToolCallMode::Auto => {
                if !self.is_stream {
                    self.emit_tool_call_nonstream(&call);
                }
                let result = execute_safe_tool(&call, &self.options.workdir);
                self.internal_results.push(result);
            }
            ToolCallMode::Proxy => {
                self.tool_call_count += 1;
                if !self.is_stream {
                    self.pending_tool_calls.push(call);
                    return;
                }
                let idx = self.tracker.blocks.remove(&call.id).map(|v| v as i64);
                self.emit_tool_call_stream(call, idx).await;
            }
        }
    }

    fn emit_tool_call_nonstream(&mut self, call: &ToolCall) {
        self.tally.add_output(&call.name);
        self.tally.add_output(&call.input);
        let fixed = fix_tool_input(&call.input);
        let input_value: Value =
            serde_json::from_str(&fixed).unwrap_or_else(|_| json!({}));
        self.content_blocks.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": input_value,
        }));
    }

    async fn emit_tool_call_stream(&mut self, call: ToolCall, idx: Option<i64>) {
        if call.id.is_empty() {
            return;
        }
        let idx = match idx {
            Some(idx) => idx,
            None => self.next_block_index(),
        };
        self.tally.add_output(&call.name);
        self.tally.add_output(&call.input);
        let fixed = fix_tool_input(&call.input);

        self.write_event(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": idx,
                "content_block": {
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": {},
                },
            }),
        )
        .await;
        self.write_event(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": idx,
                "delta": {"type": "input_json_delta", "partial_json": fixed},
            }),
        )
        .await;
        self.write_event(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": idx}),
        )
        .await;
    }

    fn should_emit_tool_calls(&self, stop_reason: &str) -> bool {
        match self.mode {
            ToolCallMode::Proxy => true,
            ToolCallMode::Auto => stop_reason == "tool_use",
            ToolCallMode::Internal => false,
        }
    }

    async fn flush_pending_tool_calls(&mut self, stop_reason: &str) {
        if !self.should_emit_tool_calls(stop_reason) {
            return;
        }
        let calls = std::mem::take(&mut self.pending_tool_calls);
        for call in calls {
            if self.is_stream {
                self.emit_tool_call_stream(call, None).await;
            } else {
                self.emit_tool_call_nonstream(&call);
            }
        }
    }

    /// Appends the locally-executed tool turn to both the structured upstream
    /// messages and the flat chat history, then the loop replays upstream.
    fn append_internal_results(&mut self) {
        let results = std::mem::take(&mut self.internal_results);
        for result in results {
            let input_value = result.input.clone();
            self.upstream_messages.push(Message::blocks(
                "assistant",
                vec![ContentBlock::ToolUse {
                    id: result.call.id.clone(),
                    name: result.call.name.clone(),
                    input: input_value.clone(),
                }],
            ));
            self.upstream_messages.push(Message::blocks(
                "user",
                vec![ContentBlock::ToolResult {
                    tool_use_id: result.call.id.clone(),
                    content: Value::String(result.output.clone()),
                    is_error: result.is_error,
                }],
            ));
            self.chat_history.push(json!({
                "role": "assistant",
                "content": [{
                    "type": "tool_use",
                    "id": result.call.id,
                    "name": result.call.name,
                    "input": input_value,
                }],
            }));
            self.chat_history.push(json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": result.call.id,
                    "content": result.output,
                    "is_error": result.is_error,
                }],
            }));
        }
    }

    /// Clears per-round state before a retry or an internal follow-up turn.
    /// The message id and the block-index high-water mark survive so indices
    /// already sent to the client are never reused.
    async fn reset_round_state(&mut self) {
        self.close_open_blocks().await;
        self.tracker = ToolTracker::new(&self.effective_tools);
        self.pending_tool_calls.clear();
        self.tool_call_count = 0;
        self.content_blocks.clear();
        self.current_text_index = None;
        self.text_builders.clear();
        self.response_text.clear();
        self.tally.reset_round();
        self.final_stop_reason.clear();
    }

    async fn close_open_blocks(&mut self) {
        if let Some(idx) = self.open_block.take() {
            self.write_event(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": idx}),
            )
            .await;
        }
        let open_tools: Vec<u64> = self.tracker.blocks.values().copied().collect();
        for idx in open_tools {
            self.write_event(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": idx}),
            )
            .await;
        }
        self.tracker.blocks.clear();
    }

    fn next_block_index(&mut self) -> i64 {
        self.block_index += 1;
        self.block_index
    }

    async fn finish(&mut self, stop_reason: &str) {
        if self.finished {
            return;
        }
        let mut stop_reason = stop_reason.to_string();
        if stop_reason == "tool_use"
            && self.tool_call_count == 0
            && self.pending_tool_calls.is_empty()
        {
            stop_reason = "end_turn".to_string();
        }
        self.flush_pending_tool_calls(&stop_reason).await;
        self.close_open_blocks().await;
        self.tally.finalize();
        self.finished = true;
        self.final_stop_reason = stop_reason.clone();

        self.write_event(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": Value::Null},
                "usage": {"output_tokens": self.tally.output},
            }),
        )
        .await;
        self.write_event("message_stop", json!({"type": "message_stop"}))
            .await;

        tracing::info!(
            msg_id = %self.msg_id,
            stop_reason = %self.final_stop_reason,
            input_tokens = self.tally.input,
            output_tokens = self.tally.output,
            "request completed"
        );
    }

    async fn surface_client_error(&mut self, err: &DispatchError) -> AppError {
        let status = err.status().unwrap_or(StatusCode::BAD_GATEWAY);
        if self.is_stream {
            self.write_error_frame(status, &err.to_string()).await;
            self.finish("end_turn").await;
        } else {
            self.finished = true;
            self.final_stop_reason = "end_turn".to_string();
        }
        AppError::new(status, "invalid_request_error", err.to_string())
    }

    async fn surface_exhausted(&mut self, err: &DispatchError) -> AppError {
        let retry_after = err.retry_after().map(|d| d.as_secs());
        if self.is_stream {
            self.write_error_frame(StatusCode::BAD_GATEWAY, &err.to_string())
                .await;
            self.finish("end_turn").await;
        } else {
            self.finished = true;
            self.final_stop_reason = "end_turn".to_string();
        }
        let status = match err.status() {
            Some(StatusCode::TOO_MANY_REQUESTS) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::BAD_GATEWAY,
        };
        AppError::new(status, "api_error", err.to_string()).with_retry_after(retry_after)
    }

    async fn write_error_frame(&mut self, status: StatusCode, message: &str) {
        let code = if status == StatusCode::TOO_MANY_REQUESTS {
            "rate_limit_error"
        } else if status.is_client_error() {
            "invalid_request_error"
        } else {
            "api_error"
        };
        self.write_event(
            "error",
            json!({"type": "error", "error": {"type": code, "message": message}}),
        )
        .await;
    }

    async fn write_message_start(&mut self) {
        let data = json!({
            "type": "message_start",
            "message": {
                "id": self.msg_id,
                "type": "message",
                "role": "assistant",
                "content": [],
                "model": self.model,
                "stop_reason": Value::Null,
                "stop_sequence": Value::Null,
                "usage": {"input_tokens": self.tally.input, "output_tokens": 0},
            },
        });
        self.write_event("message_start", data).await;
    }

    async fn write_keepalive(&mut self) {
        if !self.is_stream || self.finished {
            return;
        }
        if let Some(client) = self.client.as_ref() {
            if client
                .send(Ok(Event::default().comment("keepalive")))
                .await
                .is_err()
            {
                self.client_gone = true;
            }
        }
    }

    async fn write_event(&mut self, name: &str, data: Value) {
        if !self.is_stream {
            return;
        }
        if let Some(client) = self.client.as_ref() {
            let event = Event::default().event(name).data(data.to_string());
            if client.send(Ok(event)).await.is_err() {
                self.client_gone = true;
            }
        }
    }

    /// Sleeps out the retry back-off while keeping the stream alive; false
    /// means the client went away meanwhile.
    async fn sleep_with_keepalive(&mut self, backoff: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + backoff;
        let mut keepalive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await;
        let client_probe = self.client.clone();
        loop {
            let watch_client = self.is_stream && !self.client_gone;
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                _ = keepalive.tick() => self.write_keepalive().await,
                _ = client_closed(&client_probe), if watch_client => {
                    self.client_gone = true;
                }
            }
            if self.client_gone && self.is_stream {
                return false;
            }
        }
    }

    fn into_response_json(mut self) -> Value {
        let stop_reason = if self.final_stop_reason.is_empty() {
            "end_turn".to_string()
        } else {
            self.final_stop_reason.clone()
        };

        for (text_index, builder) in &self.text_builders {
            if let Some(block) = self.content_blocks.get_mut(*text_index) {
                if block.get("type").and_then(|v| v.as_str()) == Some("text") {
                    block["text"] = Value::String(builder.clone());
                }
            }
        }
        for block in self.content_blocks.iter_mut() {
            if block.get("type").and_then(|v| v.as_str()) == Some("text")
                && block.get("text").is_none()
            {
                block["text"] = Value::String(String::new());
            }
        }
        if self.content_blocks.is_empty() && !self.response_text.is_empty() {
            self.content_blocks
                .push(json!({"type": "text", "text": self.response_text}));
        }

        json!({
            "id": self.msg_id,
            "type": "message",
            "role": "assistant",
            "content": self.content_blocks,
            "model": self.model,
            "stop_reason": stop_reason,
            "stop_sequence": Value::Null,
            "usage": {
                "input_tokens": self.tally.input,
                "output_tokens": self.tally.output,
            },
        })
    }
}

enum AttemptOutcome {
    Completed,
    Failed(DispatchError),
    ClientGone,
}

async fn client_closed(client: &Option<mpsc::Sender<Result<Event, std::convert::Infallible>>>) {
    match client {
        Some(sender) => sender.closed().await,
        None => std::future::pending().await,
    }
}

/// Retry-After from the upstream wins over the configured delay when longer.
fn retry_backoff(configured: Duration, retry_after: Option<Duration>) -> Duration {
    match retry_after {
        Some(hint) => configured.max(hint),
        None => configured,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_backoff_honors_upstream_hint() {
        assert_eq!(
            retry_backoff(Duration::from_millis(500), Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
        assert_eq!(
            retry_backoff(Duration::from_secs(2), Some(Duration::from_secs(1))),
            Duration::from_secs(2)
        );
        assert_eq!(
            retry_backoff(Duration::from_millis(500), None),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn token_tally_final_mode_tokenizes_aggregate_once() {
        let mut tally = TokenTally::new(OutputTokenMode::Final, 10);
        tally.add_output("hello ");
        tally.add_output("world");
        assert_eq!(tally.output, 0);
        tally.finalize();
        assert_eq!(tally.output, estimate_text_tokens("hello world"));
    }

    #[test]
    fn token_tally_stream_mode_counts_incrementally() {
        let mut tally = TokenTally::new(OutputTokenMode::Stream, 0);
        tally.add_output("hello");
        tally.add_output("world");
        assert!(tally.output >= 2);
        let before = tally.output;
        tally.finalize();
        assert_eq!(tally.output, before);
    }

    #[test]
    fn token_tally_upstream_usage_freezes_local_estimation() {
        let mut tally = TokenTally::new(OutputTokenMode::Final, 10);
        tally.add_output("ignored once upstream reports");
        tally.set_usage(Some(42), Some(7));
        tally.add_output("still ignored");
        tally.finalize();
        assert_eq!(tally.input, 42);
        assert_eq!(tally.output, 7);
    }

    #[test]
    fn token_tally_reset_clears_output_only() {
        let mut tally = TokenTally::new(OutputTokenMode::Final, 33);
        tally.add_output("text");
        tally.set_usage(None, Some(5));
        tally.reset_round();
        assert_eq!(tally.input, 33);
        assert_eq!(tally.output, 0);
        assert!(!tally.use_upstream);
    }
}
