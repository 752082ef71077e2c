use crate::summary_cache::{SummaryCache, SummaryEntry};
use chrono::Utc;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub const WARP_TOOL_RESULT_CEILING: u64 = 1_800;
pub const WARP_HARD_BUDGET: u64 = 12_000;
const WARP_WRAPPER_OVERHEAD: u64 = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemItem {
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(default)]
    pub text: String,
}

/// Anthropic `system` decodes from a bare string, an array of items, or a
/// single item object. Anything else is a client error.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemItems(pub Vec<SystemItem>);

impl<'de> Deserialize<'de> for SystemItems {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::Null => Ok(Self(Vec::new())),
            Value::String(text) => Ok(Self(vec![SystemItem {
                item_type: "text".to_string(),
                text,
            }])),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(
                        serde_json::from_value(item)
                            .map_err(|e| D::Error::custom(format!("invalid system item: {e}")))?,
                    );
                }
                Ok(Self(out))
            }
            Value::Object(_) => {
                let item: SystemItem = serde_json::from_value(value)
                    .map_err(|e| D::Error::custom(format!("invalid system item: {e}")))?;
                Ok(Self(vec![item]))
            }
            _ => Err(D::Error::custom("system must be string or array")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    Image {
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    Document {
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
}

impl Message {
    pub fn text(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn blocks(role: &str, blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: role.to_string(),
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Concatenated text content, ignoring non-text blocks.
    pub fn plain_text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => {
                let mut parts = Vec::new();
                for block in blocks {
                    if let ContentBlock::Text { text } = block {
                        let trimmed = text.trim();
                        if !trimmed.is_empty() {
                            parts.push(trimmed.to_string());
                        }
                    }
                }
                parts.join("\n")
            }
        }
    }
}

/// The canonical (Anthropic-shaped) request every channel handler decodes to.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub system: SystemItems,
    #[serde(default)]
    pub tools: Vec<Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn is_cjk(ch: char) -> bool {
    matches!(ch as u32,
        0x3040..=0x30FF      // hiragana + katakana
        | 0x3400..=0x4DBF    // CJK extension A
        | 0x4E00..=0x9FFF    // CJK unified
        | 0xAC00..=0xD7AF    // hangul
        | 0xF900..=0xFAFF    // CJK compatibility
        | 0x20000..=0x2A6DF)
}

/// Fast CJK-aware estimate: words x 1.3 + CJK chars x 1.5, rounded.
pub fn estimate_text_tokens(text: &str) -> u64 {
    if text.trim().is_empty() {
        return 0;
    }
    let mut words = 0u64;
    let mut cjk = 0u64;
    let mut in_word = false;
    for ch in text.chars() {
        if is_cjk(ch) {
            cjk += 1;
            in_word = false;
        } else if ch.is_whitespace() {
            in_word = false;
        } else if !in_word {
            words += 1;
            in_word = true;
        }
    }
    let estimate = (words as f64 * 1.3 + cjk as f64 * 1.5).round() as u64;
    estimate.max(1)
}

#[derive(Clone, Default)]
pub struct PromptOptions {
    pub conversation_id: String,
    pub max_tokens: u64,
    pub summary_max_tokens: u64,
    pub keep_turns: usize,
    pub cache: Option<Arc<dyn SummaryCache>>,
}

pub struct PromptInput<'a> {
    pub messages: &'a [Message],
    pub system: &'a [SystemItem],
    pub tools: &'a [Value],
}

/// Assembles the provider-neutral Markdown prompt. When the estimate exceeds
/// the context budget, the oldest turns are collapsed into a cached summary
/// and only the last `keep_turns` turns are rendered verbatim.
pub async fn build_prompt(input: &PromptInput<'_>, opts: &PromptOptions) -> String {
    let mut sections: Vec<String> = Vec::new();

    let system_text = render_system(input.system);
    if !system_text.is_empty() {
        sections.push(format!("<system>\n{system_text}\n</system>"));
    }

    let tool_section = render_tools(input.tools);
    if !tool_section.is_empty() {
        sections.push(tool_section);
    }

    let (history, latest_user) = split_latest_user(input.messages);

    let full_history = render_history(history);
    let over_budget = opts.max_tokens > 0
        && estimate_text_tokens(&full_history) + estimate_text_tokens(&latest_user)
            > opts.max_tokens;

    if over_budget && history.len() > opts.keep_turns {
        let split = history.len() - opts.keep_turns;
        let (old, kept) = history.split_at(split);
        let summary = summarize_turns(old, opts).await;
        if !summary.is_empty() {
            sections.push(format!(
                "<conversation_summary>\n{summary}\n</conversation_summary>"
            ));
        }
        let kept_history = render_history(kept);
        if !kept_history.is_empty() {
            sections.push(format!("## Conversation\n\n{kept_history}"));
        }
    } else if !full_history.is_empty() {
        sections.push(format!("## Conversation\n\n{full_history}"));
    }

    if !latest_user.is_empty() {
        sections.push(format!("<user_request>\n{latest_user}\n</user_request>"));
    }

    sections.join("\n\n")
}

fn render_system(system: &[SystemItem]) -> String {
    let mut parts = Vec::new();
    for item in system {
        if item.item_type.eq_ignore_ascii_case("text") {
            let trimmed = item.text.trim();
            if !trimmed.is_empty() {
                parts.push(trimmed.to_string());
            }
        }
    }
    parts.join("\n\n")
}

fn render_tools(tools: &[Value]) -> String {
    let mut lines = Vec::new();
    for tool in tools {
        let Some(name) = tool.get("name").and_then(|v| v.as_str()) else {
            continue;
        };
        let description = tool
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if description.is_empty() {
            lines.push(format!("- {name}"));
        } else {
            let short: String = description.chars().take(200).collect();
            lines.push(format!("- {name}: {short}"));
        }
    }
    if lines.is_empty() {
        String::new()
    } else {
        format!("<available_tools>\n{}\n</available_tools>", lines.join("\n"))
    }
}

/// Splits off the trailing user message so it can be rendered inside
/// `<user_request>`; everything before it is conversation history.
fn split_latest_user(messages: &[Message]) -> (&[Message], String) {
    if let Some(last) = messages.last() {
        if last.role.eq_ignore_ascii_case("user") {
            let text = last.plain_text().trim().to_string();
            if !text.is_empty() {
                return (&messages[..messages.len() - 1], text);
            }
        }
    }
    (messages, String::new())
}

fn render_history(messages: &[Message]) -> String {
    let mut parts = Vec::new();
    for message in messages {
        let label = match message.role.to_ascii_lowercase().as_str() {
            "assistant" => "**Assistant:**",
            "system" => "**System:**",
            _ => "**User:**",
        };
        let body = render_message_body(message);
        if body.is_empty() {
            continue;
        }
        parts.push(format!("{label}\n{body}"));
    }
    parts.join("\n\n")
}

fn render_message_body(message: &Message) -> String {
    match &message.content {
        MessageContent::Text(text) => text.trim().to_string(),
        MessageContent::Blocks(blocks) => {
            let mut parts = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => {
                        let trimmed = text.trim();
                        if !trimmed.is_empty() {
                            parts.push(trimmed.to_string());
                        }
                    }
                    ContentBlock::ToolUse { name, input, .. } => {
                        parts.push(format!("[tool call: {name} {input}]"));
                    }
                    ContentBlock::ToolResult {
                        content, is_error, ..
                    } => {
                        let rendered = tool_result_text(content);
                        if *is_error {
                            parts.push(format!("[tool error]\n{rendered}"));
                        } else {
                            parts.push(format!("[tool result]\n{rendered}"));
                        }
                    }
                    ContentBlock::Image { .. } => parts.push("[image]".to_string()),
                    ContentBlock::Document { .. } => parts.push("[document]".to_string()),
                }
            }
            parts.join("\n")
        }
    }
}

pub fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(items) => {
            let mut parts = Vec::new();
            for item in items {
                if let Some(text) = item.get("text").and_then(|v| v.as_str()) {
                    parts.push(text.to_string());
                }
            }
            parts.join("\n")
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

async fn summarize_turns(turns: &[Message], opts: &PromptOptions) -> String {
    if turns.is_empty() {
        return String::new();
    }
    let key = turns_fingerprint(&opts.conversation_id, turns);
    if let Some(cache) = opts.cache.as_ref() {
        if let Some(entry) = cache.get(&key).await {
            return entry.summary;
        }
    }
    let summary = fallback_summary(turns, opts.summary_max_tokens);
    if let Some(cache) = opts.cache.as_ref() {
        cache
            .put(
                &key,
                SummaryEntry {
                    summary: summary.clone(),
                    tokens: estimate_text_tokens(&summary),
                    created_at: Utc::now(),
                },
            )
            .await;
    }
    summary
}

pub fn turns_fingerprint(conversation_id: &str, turns: &[Message]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(conversation_id.as_bytes());
    hasher.update([0u8]);
    for turn in turns {
        hasher.update(turn.role.as_bytes());
        hasher.update([0u8]);
        hasher.update(render_message_body(turn).as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Extractive summary used when no precomputed entry exists: one clipped line
/// per turn, bounded by the summary token budget.
fn fallback_summary(turns: &[Message], max_tokens: u64) -> String {
    let budget = if max_tokens == 0 { 512 } else { max_tokens };
    let mut lines = Vec::new();
    for turn in turns {
        let body = render_message_body(turn);
        let clipped: String = body.chars().take(160).collect();
        let clipped = clipped.replace('\n', " ");
        if clipped.trim().is_empty() {
            continue;
        }
        lines.push(format!("- {}: {}", turn.role, clipped.trim()));
    }
    let mut summary = lines.join("\n");
    while estimate_text_tokens(&summary) > budget {
        let keep = summary.chars().count() * 3 / 4;
        summary = summary.chars().take(keep).collect();
    }
    summary
}

pub fn extract_user_text(messages: &[Message]) -> String {
    for message in messages.iter().rev() {
        if !message.role.eq_ignore_ascii_case("user") {
            continue;
        }
        return message.plain_text().trim().to_string();
    }
    String::new()
}

/// Plan mode is detected from the latest user text with `<system-reminder>`
/// blocks removed so reminder boilerplate cannot trigger it.
pub fn is_plan_mode(messages: &[Message]) -> bool {
    let text = extract_user_text(messages);
    strip_system_reminders(&text)
        .to_ascii_lowercase()
        .contains("plan mode")
}

pub fn strip_system_reminders(text: &str) -> String {
    const START_TAG: &str = "<system-reminder>";
    const END_TAG: &str = "</system-reminder>";
    if !text.contains(START_TAG) {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        match rest.find(START_TAG) {
            Some(start) => {
                out.push_str(&rest[..start]);
                let after_start = &rest[start + START_TAG.len()..];
                match after_start.rfind(END_TAG) {
                    Some(end) => rest = &after_start[end + END_TAG.len()..],
                    None => break,
                }
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }
    out
}

/// Extracts the working directory hint from system text items
/// ("working directory: <path>").
pub fn extract_workdir_from_system(system: &[SystemItem]) -> String {
    for item in system {
        if !item.item_type.eq_ignore_ascii_case("text") {
            continue;
        }
        let lower = item.text.to_ascii_lowercase();
        if let Some(pos) = lower.find("working directory:") {
            let tail = &item.text[pos + "working directory:".len()..];
            let line = tail.lines().next().unwrap_or("").trim();
            if !line.is_empty() {
                return line.to_string();
            }
        }
    }
    String::new()
}

/// Estimates the Warp payload: prompt plus per-message costs with a fixed
/// wrapper overhead.
pub fn estimate_warp_tokens(built_prompt: &str, messages: &[Message]) -> u64 {
    let mut total = estimate_text_tokens(built_prompt) + WARP_WRAPPER_OVERHEAD;
    for message in messages {
        match &message.content {
            MessageContent::Text(text) => {
                total += estimate_text_tokens(text.trim()) + 15;
            }
            MessageContent::Blocks(blocks) => {
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            total += estimate_text_tokens(text.trim()) + 10;
                        }
                        ContentBlock::ToolResult { content, .. } => match content {
                            Value::String(text) => total += estimate_text_tokens(text) + 10,
                            _ => total += 200,
                        },
                        _ => total += 50,
                    }
                }
            }
        }
    }
    total
}

/// Clamps oversized tool_result blocks to roughly `ceiling` tokens each.
pub fn compress_tool_results(messages: &[Message], ceiling: u64) -> (Vec<Message>, usize) {
    let mut compressed = 0usize;
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        let MessageContent::Blocks(blocks) = &message.content else {
            out.push(message.clone());
            continue;
        };
        let mut new_blocks = Vec::with_capacity(blocks.len());
        for block in blocks {
            match block {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content: Value::String(text),
                    is_error,
                } if estimate_text_tokens(text) > ceiling => {
                    // ~3 chars per estimated token keeps the clip close to the ceiling.
                    let keep_chars = (ceiling as usize).saturating_mul(3);
                    let mut clipped: String = text.chars().take(keep_chars).collect();
                    clipped.push_str("\n…[tool result truncated]");
                    compressed += 1;
                    new_blocks.push(ContentBlock::ToolResult {
                        tool_use_id: tool_use_id.clone(),
                        content: Value::String(clipped),
                        is_error: *is_error,
                    });
                }
                other => new_blocks.push(other.clone()),
            }
        }
        out.push(Message {
            role: message.role.clone(),
            content: MessageContent::Blocks(new_blocks),
        });
    }
    (out, compressed)
}

pub struct WarpBudgetOutcome {
    pub messages: Vec<Message>,
    pub before_tokens: u64,
    pub after_tokens: u64,
    pub compressed_blocks: usize,
    pub dropped_messages: usize,
}

/// Keeps the Warp payload under `min(max_tokens, 12000)`: first compress
/// tool results, then drop oldest messages while retaining the last user
/// message.
pub fn enforce_warp_budget(
    built_prompt: &str,
    messages: &[Message],
    max_tokens: u64,
) -> WarpBudgetOutcome {
    let budget = if max_tokens == 0 {
        WARP_HARD_BUDGET
    } else {
        max_tokens.min(WARP_HARD_BUDGET)
    };

    let (compressed, compressed_blocks) =
        compress_tool_results(messages, WARP_TOOL_RESULT_CEILING);
    let before_tokens = estimate_warp_tokens(built_prompt, &compressed);
    if before_tokens <= budget {
        return WarpBudgetOutcome {
            messages: compressed,
            before_tokens,
            after_tokens: before_tokens,
            compressed_blocks,
            dropped_messages: 0,
        };
    }

    let last_user = compressed
        .iter()
        .rposition(|m| m.role.eq_ignore_ascii_case("user"))
        .unwrap_or(compressed.len().saturating_sub(1));

    let mut start = 0usize;
    while start < last_user
        && estimate_warp_tokens(built_prompt, &compressed[start..]) > budget
    {
        start += 1;
    }
    let trimmed: Vec<Message> = if start >= compressed.len() {
        compressed[compressed.len() - 1..].to_vec()
    } else {
        compressed[start..].to_vec()
    };
    let after_tokens = estimate_warp_tokens(built_prompt, &trimmed);
    WarpBudgetOutcome {
        messages: trimmed,
        before_tokens,
        after_tokens,
        compressed_blocks,
        dropped_messages: start,
    }
}
