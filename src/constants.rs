/// Upstream chat-completion defaults
pub const DEFAULT_MODEL: &str = "glm-4.6";
pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://open.bigmodel.cn";
pub const CHAT_COMPLETIONS_PATH: &str = "/api/paas/v4/chat/completions";

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer in both Persian and English.";

/// Environment variables read at startup
pub const API_KEY_ENV: &str = "BIGMODEL_API_KEY";
pub const BASE_URL_ENV: &str = "BIGMODEL_BASE_URL";

/// Event-stream wire markers
pub const SSE_DATA_PREFIX: &str = "data:";
pub const SSE_DONE_SENTINEL: &str = "[DONE]";

/// Reply used when a non-streaming completion carries no content
pub const NO_RESPONSE_FALLBACK: &str = "No response from model.";

/// Reply used by the canned table for unknown prompts
pub const CANNED_FALLBACK: &str = "sorry i don't understand that";

/// Client-facing text for mid-stream failures
pub const STREAM_ERROR_MESSAGE: &str = "Internal server error";

/// Relay limits
pub const SSE_CHANNEL_CAPACITY: usize = 100;
pub const SSE_KEEPALIVE_SECS: u64 = 15;
pub const MAX_PENDING_LINE_BYTES: usize = 1024 * 1024;

/// Database defaults
pub const DB_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA busy_timeout = 5000",
];
