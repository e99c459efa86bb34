use crate::chat::{ChatService, HistoryPolicy, ReplySource};
use crate::constants::*;
use crate::db::ConversationStore;
use crate::types::*;
use crate::upstream::UpstreamClient;
use clap::{Parser, ValueEnum};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ReplyMode {
    /// Relay prompts to the chat-completion API.
    Upstream,
    /// Answer from the built-in canned table.
    Canned,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 3000)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "parley.db")]
    pub database: String,
    #[arg(long, value_enum, default_value_t = ReplyMode::Upstream)]
    pub reply_mode: ReplyMode,
    /// Full chat-completions URL. Defaults to $BIGMODEL_BASE_URL + the completions path.
    #[arg(long)]
    pub upstream_url: Option<String>,
    #[arg(long, default_value = DEFAULT_MODEL)]
    pub model: String,
    #[arg(long, default_value = DEFAULT_SYSTEM_PROMPT)]
    pub system_prompt: String,
    #[arg(long, default_value_t = false)]
    pub include_history: bool,
    #[arg(long, default_value_t = 40)]
    pub max_history_turns: usize,
    /// Attach the running transcript to every streamed token.
    #[arg(long, default_value_t = false)]
    pub full_content: bool,
    /// Longest silence tolerated while reading an upstream response. Streams may run
    /// longer than this as long as data keeps arriving.
    #[arg(long, default_value_t = 120)]
    pub read_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 1024 * 1024)]
    pub max_body_size: usize,
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
}

impl Args {
    pub fn history_policy(&self) -> HistoryPolicy {
        HistoryPolicy {
            enabled: self.include_history,
            max_turns: self.max_history_turns,
        }
    }

    /// Explicit flag, then `$BIGMODEL_BASE_URL`, then the built-in default.
    pub fn resolve_upstream_url(&self, env_base_url: Option<String>) -> String {
        if let Some(url) = &self.upstream_url {
            return url.clone();
        }
        let base = env_base_url
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_UPSTREAM_BASE_URL.to_string());
        format!("{}{}", base.trim_end_matches('/'), CHAT_COMPLETIONS_PATH)
    }

    pub fn build_http_client(&self) -> Result<reqwest::Client> {
        let client = reqwest::Client::builder()
            .read_timeout(std::time::Duration::from_secs(self.read_timeout_secs))
            .connect_timeout(std::time::Duration::from_secs(self.connect_timeout_secs))
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(std::time::Duration::from_secs(60)))
            .build()?;
        Ok(client)
    }

    /// Builds the reply source. Upstream mode requires an API key.
    pub fn reply_source(
        &self,
        client: reqwest::Client,
        api_key: Option<String>,
        env_base_url: Option<String>,
    ) -> Result<ReplySource> {
        match self.reply_mode {
            ReplyMode::Canned => Ok(ReplySource::Canned),
            ReplyMode::Upstream => {
                let api_key = match api_key {
                    Some(k) if !k.trim().is_empty() => k,
                    _ => {
                        return Err(RelayError::Internal(
                            format!(
                                "{} environment variable is missing or empty (or use --reply-mode canned)",
                                API_KEY_ENV
                            ),
                            tracing_error::SpanTrace::capture(),
                        )
                        .into())
                    }
                };
                Ok(ReplySource::Upstream(UpstreamClient::new(
                    client,
                    self.resolve_upstream_url(env_base_url),
                    api_key,
                    self.model.clone(),
                    self.system_prompt.clone(),
                )))
            }
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatService>,
    pub args: Arc<Args>,
}

impl AppState {
    pub fn new(store: ConversationStore, source: ReplySource, args: Args) -> Self {
        let chat = ChatService::new(store, source, args.history_policy());
        Self {
            chat: Arc::new(chat),
            args: Arc::new(args),
        }
    }
}
