use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallMode {
    Proxy,
    Internal,
    Auto,
}

impl ToolCallMode {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "internal" => Self::Internal,
            "auto" => Self::Auto,
            _ => Self::Proxy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputTokenMode {
    Stream,
    Final,
    Upstream,
}

impl OutputTokenMode {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" => Self::Stream,
            "upstream" => Self::Upstream,
            _ => Self::Final,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,

    pub concurrency_limit: usize,
    pub concurrency_timeout_secs: u64,

    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_ms: u64,

    pub tool_call_mode: ToolCallMode,
    pub output_token_mode: OutputTokenMode,
    pub upstream_mode: String,

    pub context_max_tokens: u64,
    pub context_summary_max_tokens: u64,
    pub context_keep_turns: usize,

    pub summary_cache_mode: String,
    pub summary_cache_size: usize,
    pub summary_cache_ttl_secs: u64,

    pub warp_max_tokens: u64,

    pub dedup_window_ms: u64,
    pub balancer_cache_ttl_secs: u64,

    pub proxy_http: String,
    pub proxy_https: String,
    pub proxy_user: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            metrics_path: "/metrics".to_string(),
            database_dsn: "sqlite://./data/trellis.db".to_string(),
            concurrency_limit: 100,
            concurrency_timeout_secs: 120,
            max_retries: 2,
            retry_delay_ms: 500,
            request_timeout_ms: 120_000,
            tool_call_mode: ToolCallMode::Proxy,
            output_token_mode: OutputTokenMode::Final,
            upstream_mode: "sse".to_string(),
            context_max_tokens: 48_000,
            context_summary_max_tokens: 1_024,
            context_keep_turns: 6,
            summary_cache_mode: "memory".to_string(),
            summary_cache_size: 256,
            summary_cache_ttl_secs: 1_800,
            warp_max_tokens: 12_000,
            dedup_window_ms: 3_000,
            balancer_cache_ttl_secs: 5,
            proxy_http: String::new(),
            proxy_https: String::new(),
            proxy_user: String::new(),
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|v| v.trim().parse().ok())
}

impl Settings {
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(v) = env_string("TRELLIS_LISTEN") {
            settings.listen = v;
        }
        if let Some(v) = env_string("TRELLIS_METRICS_PATH") {
            settings.metrics_path = v;
        }
        if let Some(v) = env_string("TRELLIS_DATABASE_DSN").or_else(|| env_string("DATABASE_URL")) {
            settings.database_dsn = v;
        }
        if let Some(v) = env_parse("TRELLIS_CONCURRENCY_LIMIT") {
            settings.concurrency_limit = v;
        }
        if let Some(v) = env_parse("TRELLIS_CONCURRENCY_TIMEOUT_SECS") {
            settings.concurrency_timeout_secs = v;
        }
        if let Some(v) = env_parse("TRELLIS_MAX_RETRIES") {
            settings.max_retries = v;
        }
        if let Some(v) = env_parse("TRELLIS_RETRY_DELAY_MS") {
            settings.retry_delay_ms = v;
        }
        if let Some(v) = env_parse("TRELLIS_REQUEST_TIMEOUT_MS") {
            settings.request_timeout_ms = v;
        }
        if let Some(v) = env_string("TRELLIS_TOOL_CALL_MODE") {
            settings.tool_call_mode = ToolCallMode::from_str(&v);
        }
        if let Some(v) = env_string("TRELLIS_OUTPUT_TOKEN_MODE") {
            settings.output_token_mode = OutputTokenMode::from_str(&v);
        }
        if let Some(v) = env_string("TRELLIS_UPSTREAM_MODE") {
            settings.upstream_mode = v.to_ascii_lowercase();
        }
        if let Some(v) = env_parse("TRELLIS_CONTEXT_MAX_TOKENS") {
            settings.context_max_tokens = v;
        }
        if let Some(v) = env_parse("TRELLIS_CONTEXT_KEEP_TURNS") {
            settings.context_keep_turns = v;
        }
        if let Some(v) = env_string("TRELLIS_SUMMARY_CACHE_MODE") {
            settings.summary_cache_mode = v.to_ascii_lowercase();
        }
        if let Some(v) = env_parse("TRELLIS_SUMMARY_CACHE_SIZE") {
            settings.summary_cache_size = v;
        }
        if let Some(v) = env_parse("TRELLIS_SUMMARY_CACHE_TTL_SECS") {
            settings.summary_cache_ttl_secs = v;
        }
        if let Some(v) = env_parse("TRELLIS_DEDUP_WINDOW_MS") {
            settings.dedup_window_ms = v;
        }
        if let Some(v) = env_string("TRELLIS_PROXY_HTTP") {
            settings.proxy_http = v;
        }
        if let Some(v) = env_string("TRELLIS_PROXY_HTTPS") {
            settings.proxy_https = v;
        }
        settings
    }
}
