use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Tools the internal executor understands; `internal`/`auto` modes narrow
/// the declared tool list to these before the request goes upstream.
const SUPPORTED_INTERNAL_TOOLS: [&str; 1] = ["bash"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: String,
}

#[derive(Debug, Clone)]
struct ToolNameInfo {
    declared: String,
    normalized: String,
}

/// Per-request tool-call state: maps upstream tool ids to declared client
/// tools, buffers streamed input fragments, and guarantees at-most-once
/// emission per id (prior streamed state wins over late one-shot events).
#[derive(Default)]
pub struct ToolTracker {
    names: HashMap<String, String>,
    buffers: HashMap<String, String>,
    had_delta: HashMap<String, bool>,
    handled: HashSet<String>,
    pub blocks: HashMap<String, u64>,
    current_input_id: Option<String>,
    allowed: HashMap<String, String>,
    index: Vec<ToolNameInfo>,
}

impl ToolTracker {
    pub fn new(declared_tools: &[Value]) -> Self {
        let mut allowed = HashMap::new();
        let mut index = Vec::new();
        for tool in declared_tools {
            let Some(name) = tool.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            allowed.insert(name.to_ascii_lowercase(), name.to_string());
            index.push(ToolNameInfo {
                declared: name.to_string(),
                normalized: normalize_tool_name(name),
            });
        }
        Self {
            allowed,
            index,
            ..Default::default()
        }
    }

    pub fn has_tool_list(&self) -> bool {
        !self.allowed.is_empty()
    }

    /// Maps an upstream tool name onto the client-declared set: exact
    /// case-insensitive match first, then the similarity index.
    pub fn resolve_name(&self, upstream_name: &str) -> Option<String> {
        let name = upstream_name.trim();
        if name.is_empty() {
            return None;
        }
        if !self.has_tool_list() {
            return Some(name.to_string());
        }
        if let Some(declared) = self.allowed.get(&name.to_ascii_lowercase()) {
            return Some(declared.clone());
        }
        let normalized = normalize_tool_name(name);
        if normalized.is_empty() {
            return None;
        }
        for info in &self.index {
            if info.normalized == normalized {
                return Some(info.declared.clone());
            }
        }
        for info in &self.index {
            if info.normalized.contains(&normalized) || normalized.contains(&info.normalized) {
                return Some(info.declared.clone());
            }
        }
        None
    }

    pub fn start(&mut self, id: &str, upstream_name: &str) {
        if id.is_empty() || upstream_name.is_empty() {
            return;
        }
        self.current_input_id = Some(id.to_string());
        self.names.insert(id.to_string(), upstream_name.to_string());
        self.buffers.insert(id.to_string(), String::new());
        self.had_delta.insert(id.to_string(), false);
    }

    pub fn append_delta(&mut self, id: &str, delta: &str) {
        if let Some(buffer) = self.buffers.get_mut(id) {
            buffer.push_str(delta);
        }
        if !delta.is_empty() {
            self.had_delta.insert(id.to_string(), true);
        }
    }

    pub fn had_delta(&self, id: &str) -> bool {
        self.had_delta.get(id).copied().unwrap_or(false)
    }

    pub fn buffered_input(&self, id: &str) -> String {
        self.buffers
            .get(id)
            .map(|b| b.trim().to_string())
            .unwrap_or_default()
    }

    pub fn is_streaming(&self, id: &str) -> bool {
        self.buffers.contains_key(id)
    }

    pub fn current_input_id(&self) -> Option<&str> {
        self.current_input_id.as_deref()
    }

    /// Finalizes a streamed tool input. Returns the normalized call exactly
    /// once; later `finish`/`one_shot` calls for the same id yield nothing.
    pub fn finish(&mut self, id: &str) -> Option<ToolCall> {
        if id.is_empty() {
            return None;
        }
        if self.current_input_id.as_deref() == Some(id) {
            self.current_input_id = None;
        }
        let name = self.names.remove(id);
        let input = self.buffered_input(id);
        self.buffers.remove(id);
        self.had_delta.remove(id);
        let name = name.filter(|n| !n.is_empty())?;
        if self.handled.contains(id) {
            return None;
        }
        let resolved = self.resolve_name(&name)?;
        self.handled.insert(id.to_string());
        Some(ToolCall {
            id: id.to_string(),
            name: resolved,
            input,
        })
    }

    /// Accepts a complete `tool-call` event. Suppressed when streamed state
    /// exists for the id, when the id was already handled, or when another
    /// tool input is currently streaming.
    pub fn one_shot(&mut self, id: &str, upstream_name: &str, input: &str) -> Option<ToolCall> {
        if id.is_empty() {
            return None;
        }
        if let Some(current) = self.current_input_id.as_deref() {
            if current != id {
                return None;
            }
        }
        if self.handled.contains(id) || self.buffers.contains_key(id) {
            return None;
        }
        let resolved = self.resolve_name(upstream_name)?;
        self.handled.insert(id.to_string());
        Some(ToolCall {
            id: id.to_string(),
            name: resolved,
            input: input.to_string(),
        })
    }
}

fn normalize_tool_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Keeps only the declared tools the internal executor can run.
pub fn filter_supported_tools(tools: &[Value]) -> Vec<Value> {
    tools
        .iter()
        .filter(|tool| {
            tool.get("name")
                .and_then(|v| v.as_str())
                .map(|name| {
                    SUPPORTED_INTERNAL_TOOLS
                        .iter()
                        .any(|s| name.eq_ignore_ascii_case(s))
                })
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// Repairs truncated streamed tool input into the largest valid JSON prefix:
/// strips trailing commas, terminates an open string, and closes unbalanced
/// braces/brackets in nesting order. Empty input becomes `{}`.
pub fn fix_tool_input(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return "{}".to_string();
    }

    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;
    for ch in trimmed.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '}' if !in_string => {
                stack.pop();
            }
            '[' if !in_string => stack.push(']'),
            ']' if !in_string => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut result = trimmed.to_string();
    if in_string {
        if escape_next {
            result.pop();
        }
        result.push('"');
    }
    loop {
        let tail = result.trim_end().to_string();
        if let Some(stripped) = tail.strip_suffix(',') {
            result = stripped.to_string();
        } else {
            result = tail;
            break;
        }
    }
    while let Some(closer) = stack.pop() {
        result.push(closer);
    }
    result
}
