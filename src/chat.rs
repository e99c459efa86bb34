use crate::canned::canned_reply;
use crate::db::ConversationStore;
use crate::relay::prime;
use crate::types::*;
use crate::upstream::{EventStream, UpstreamClient};
use futures_util::StreamExt;

/// Where bot replies come from.
#[derive(Clone, Debug)]
pub enum ReplySource {
    Upstream(UpstreamClient),
    Canned,
}

impl ReplySource {
    pub fn name(&self) -> &'static str {
        match self {
            ReplySource::Upstream(_) => "upstream",
            ReplySource::Canned => "canned",
        }
    }
}

/// How much prior conversation is sent upstream with each prompt.
#[derive(Clone, Copy, Debug, Default)]
pub struct HistoryPolicy {
    pub enabled: bool,
    pub max_turns: usize,
}

pub struct ChatService {
    store: ConversationStore,
    source: ReplySource,
    history: HistoryPolicy,
}

/// Rejects empty and whitespace-only prompts. Runs before any side effect.
pub fn validate_prompt(text: &str) -> Result<&str> {
    if text.trim().is_empty() {
        return Err(RelayError::Validation("Message cannot be empty".to_string()).into());
    }
    Ok(text)
}

impl ChatService {
    pub fn new(store: ConversationStore, source: ReplySource, history: HistoryPolicy) -> Self {
        Self {
            store,
            source,
            history,
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn source(&self) -> &ReplySource {
        &self.source
    }

    async fn prior_turns(&self) -> Result<Vec<Turn>> {
        if !self.history.enabled || matches!(self.source, ReplySource::Canned) {
            return Ok(Vec::new());
        }
        self.store.recent(self.history.max_turns).await
    }

    /// Non-streaming exchange. The user turn is stored before the reply is requested,
    /// so an upstream failure leaves it without a matching bot turn.
    #[tracing::instrument(name = "chat.message", skip_all, fields(source = self.source.name()))]
    pub async fn send_message(&self, text: &str) -> Result<Exchange> {
        let text = validate_prompt(text)?;
        let history = self.prior_turns().await?;
        let user = self.store.append(Sender::User, text).await?;

        let reply = match &self.source {
            ReplySource::Upstream(client) => client.complete(&history, text).await?,
            ReplySource::Canned => canned_reply(text).to_string(),
        };
        let bot = self.store.append(Sender::Bot, &reply).await?;

        Ok(Exchange {
            user_message: user.text,
            bot_message: bot.text,
        })
    }

    /// Validates, stores the user turn and opens the reply stream. Errors returned here
    /// happen before anything has been sent to the client.
    #[tracing::instrument(name = "chat.stream", skip_all, fields(source = self.source.name()))]
    pub async fn open_stream(&self, text: &str) -> Result<EventStream> {
        let text = validate_prompt(text)?;
        let history = self.prior_turns().await?;
        self.store.append(Sender::User, text).await?;

        let events: EventStream = match &self.source {
            ReplySource::Upstream(client) => client.open_stream(&history, text).await?,
            ReplySource::Canned => {
                let reply = canned_reply(text);
                futures_util::stream::iter(vec![Ok(StreamEvent::token(reply))]).boxed()
            }
        };
        prime(events).await
    }

    pub async fn history(&self) -> Result<Vec<Turn>> {
        self.store.all().await
    }

    pub async fn reset(&self) -> Result<u64> {
        self.store.clear().await
    }
}
