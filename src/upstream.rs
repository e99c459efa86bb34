use crate::constants::NO_RESPONSE_FALLBACK;
use crate::specs::openai::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatRole,
};
use crate::sse::SseParser;
use crate::types::*;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use std::collections::VecDeque;

/// Lazy, forward-only sequence of parsed upstream events.
pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

#[derive(Clone, Debug)]
pub struct UpstreamClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    system_prompt: String,
}

impl UpstreamClient {
    pub fn new(
        http: reqwest::Client,
        url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            http,
            url: url.into(),
            api_key: api_key.into(),
            model: model.into(),
            system_prompt: system_prompt.into(),
        }
    }

    fn request(&self, history: &[Turn], prompt: &str, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: build_messages(&self.system_prompt, history, prompt),
            stream,
            temperature: None,
            max_tokens: None,
        }
    }

    async fn send(&self, body: &ChatCompletionRequest) -> Result<reqwest::Response> {
        tracing::info!(
            "[⚙️  -> ☁️ ] POST {} model={} messages={} stream={}",
            self.url,
            body.model,
            body.messages.len(),
            body.stream
        );

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(RelayError::Network)?;

        let status = response.status();
        tracing::info!("[☁️  -> ⚙️ ] Status: {}", status);
        if status.is_success() {
            return Ok(response);
        }

        let error_body = match response.text().await {
            Ok(text) => text,
            Err(e) => format!("Upstream error (body unreadable): {}", e),
        };
        tracing::error!(
            "[☁️  -> ⚙️ ] Upstream Error: {}",
            crate::logging::preview(&error_body, 500)
        );
        Err(RelayError::Upstream(status, error_body).into())
    }

    /// Issues a streaming request. A non-success status fails here, before any event
    /// is produced.
    pub async fn open_stream(&self, history: &[Turn], prompt: &str) -> Result<EventStream> {
        let body = self.request(history, prompt, true);
        let response = self.send(&body).await?;
        Ok(decode_events(response.bytes_stream()))
    }

    /// Issues a single non-incremental request and returns the reply text.
    pub async fn complete(&self, history: &[Turn], prompt: &str) -> Result<String> {
        let body = self.request(history, prompt, false);
        let response = self.send(&body).await?;
        let parsed: ChatCompletionResponse = response.json().await.map_err(RelayError::Network)?;

        match parsed.content() {
            Some(text) => Ok(text.to_string()),
            None => {
                tracing::warn!("[☁️  -> ⚙️ ] Completion carried no content, using fallback");
                Ok(NO_RESPONSE_FALLBACK.to_string())
            }
        }
    }
}

/// System instruction, then prior exchanges in order, then the new prompt.
///
/// History comes from the single ordered log. Only a user turn immediately answered by
/// a bot turn forms a pair; orphaned user turns (a failed relay) and stray bot turns are
/// dropped so roles strictly alternate.
pub fn build_messages(system_prompt: &str, history: &[Turn], prompt: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::new(ChatRole::System, system_prompt));

    let mut turns = history.iter().peekable();
    while let Some(turn) = turns.next() {
        if turn.sender != Sender::User {
            continue;
        }
        if let Some(reply) = turns.next_if(|next| next.sender == Sender::Bot) {
            messages.push(ChatMessage::new(ChatRole::User, turn.text.as_str()));
            messages.push(ChatMessage::new(ChatRole::Assistant, reply.text.as_str()));
        }
    }

    messages.push(ChatMessage::new(ChatRole::User, prompt));
    messages
}

/// Adapts a raw body stream into parsed events. Reading stops after the end sentinel;
/// a transport error is yielded once and ends the stream.
pub fn decode_events<S, E>(body: S) -> EventStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<RelayError> + Send + 'static,
{
    struct DecodeState<S> {
        body: std::pin::Pin<Box<S>>,
        parser: SseParser,
        pending: VecDeque<StreamEvent>,
        exhausted: bool,
    }

    let state = DecodeState {
        body: Box::pin(body),
        parser: SseParser::new(),
        pending: VecDeque::new(),
        exhausted: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.exhausted || state.parser.is_finished() {
                if state.parser.skipped() > 0 {
                    tracing::debug!(
                        "[☁️  -> ⚙️ ] {} fragments skipped while parsing",
                        state.parser.skipped()
                    );
                }
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => state.pending.extend(state.parser.feed(&chunk)),
                Some(Err(e)) => {
                    state.exhausted = true;
                    let err: RelayError = e.into();
                    return Some((Err(ObservedError::from(err)), state));
                }
                None => {
                    state.exhausted = true;
                    state.pending.extend(state.parser.finish());
                }
            }
        }
    })
    .boxed()
}
