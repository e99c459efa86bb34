use crate::constants::STREAM_ERROR_MESSAGE;
use crate::db::ConversationStore;
use crate::logging::RelayMetric;
use crate::types::*;
use crate::upstream::EventStream;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;

/// Why the read loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Upstream sent the end sentinel.
    Sentinel,
    /// Upstream closed the body without a sentinel.
    Closed,
    /// Upstream reported an error, or reading the body failed.
    Failed(String),
    /// The client went away; nothing more can be forwarded.
    Disconnected,
}

/// Terminal state of one relay operation.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    Done { persisted: Option<Turn> },
    Failed { reason: String, persisted: Option<Turn> },
}

impl RelayOutcome {
    pub fn persisted(&self) -> Option<&Turn> {
        match self {
            RelayOutcome::Done { persisted } | RelayOutcome::Failed { persisted, .. } => {
                persisted.as_ref()
            }
        }
    }
}

/// Consumes upstream events, forwards tokens to the client in order, and writes the
/// finished transcript as one bot turn.
///
/// `run` takes `self` by value and every exit of the read loop funnels into the single
/// consuming `finish` transition, so the terminal write cannot happen twice.
pub struct StreamReassembler {
    store: ConversationStore,
    transcript: String,
    include_full_content: bool,
    metric: RelayMetric,
}

impl StreamReassembler {
    pub fn new(store: ConversationStore, include_full_content: bool) -> Self {
        Self {
            store,
            transcript: String::new(),
            include_full_content,
            metric: RelayMetric::new(),
        }
    }

    pub async fn run<S>(mut self, source: S, tx: mpsc::Sender<ClientEvent>) -> RelayOutcome
    where
        S: Stream<Item = Result<StreamEvent>> + Unpin,
    {
        let termination = self.pump(source, &tx).await;
        self.finish(termination, tx).await
    }

    /// Read loop. The source is dropped on return, releasing the upstream reader on
    /// every exit path.
    async fn pump<S>(&mut self, mut source: S, tx: &mpsc::Sender<ClientEvent>) -> Termination
    where
        S: Stream<Item = Result<StreamEvent>> + Unpin,
    {
        while let Some(item) = source.next().await {
            match item {
                Ok(StreamEvent::Token { content }) => {
                    if !self.forward(content, tx).await {
                        tracing::info!("[⚙️  -> 🖥️ ] Client disconnected mid-stream");
                        return Termination::Disconnected;
                    }
                }
                Ok(StreamEvent::Done { .. }) => return Termination::Sentinel,
                Ok(StreamEvent::Error { message }) => {
                    tracing::error!("[☁️  -> ⚙️ ] Upstream reported error mid-stream: {}", message);
                    return Termination::Failed(message);
                }
                Err(e) => {
                    tracing::error!("[☁️  -> ⚙️ ] Stream read failed: {}", e.inner);
                    return Termination::Failed(e.inner.to_string());
                }
            }
        }
        tracing::debug!("[☁️  -> ⚙️ ] Upstream closed without end marker");
        Termination::Closed
    }

    async fn forward(&mut self, content: String, tx: &mpsc::Sender<ClientEvent>) -> bool {
        self.metric.record_token(&content);
        self.transcript.push_str(&content);
        let event = ClientEvent::Token {
            token: content,
            full_content: self
                .include_full_content
                .then(|| self.transcript.clone()),
        };
        tx.send(event).await.is_ok()
    }

    async fn finish(self, termination: Termination, tx: mpsc::Sender<ClientEvent>) -> RelayOutcome {
        let persisted = self.persist().await;

        let outcome = match (termination, persisted) {
            (Termination::Failed(reason), Ok(turn)) => RelayOutcome::Failed {
                reason,
                persisted: turn,
            },
            (_, Err(e)) => {
                tracing::error!("[⚙️  -> 💾] Terminal write failed: {}", e);
                RelayOutcome::Failed {
                    reason: e.inner.to_string(),
                    persisted: None,
                }
            }
            (Termination::Disconnected, Ok(turn)) => RelayOutcome::Failed {
                reason: "client disconnected".to_string(),
                persisted: turn,
            },
            (Termination::Sentinel | Termination::Closed, Ok(turn)) => {
                RelayOutcome::Done { persisted: turn }
            }
        };

        let terminal = match &outcome {
            RelayOutcome::Done { .. } => ClientEvent::Done {
                content: self.transcript.clone(),
            },
            RelayOutcome::Failed { .. } => ClientEvent::Error {
                error: STREAM_ERROR_MESSAGE.to_string(),
            },
        };
        if tx.send(terminal).await.is_err() {
            tracing::trace!("Client disconnected, terminal event dropped");
        }
        drop(tx);

        let label = match &outcome {
            RelayOutcome::Done { .. } => "done",
            RelayOutcome::Failed { .. } => "failed",
        };
        self.metric.log_summary(label, outcome.persisted().is_some());
        outcome
    }

    async fn persist(&self) -> Result<Option<Turn>> {
        if self.transcript.trim().is_empty() {
            tracing::debug!("[⚙️ ] Empty transcript, nothing to persist");
            return Ok(None);
        }
        let turn = self.store.append(Sender::Bot, &self.transcript).await?;
        Ok(Some(turn))
    }
}

/// Awaits the first event before the client channel is committed, so that a failure
/// which happens before any output becomes a plain error response instead of a stream.
pub async fn prime(mut source: EventStream) -> Result<EventStream> {
    let first = match source.next().await {
        None => return Ok(source),
        Some(Err(e)) => return Err(e),
        Some(Ok(StreamEvent::Error { message })) => {
            return Err(RelayError::Upstream(axum::http::StatusCode::BAD_GATEWAY, message).into())
        }
        Some(Ok(event)) => event,
    };
    Ok(futures_util::stream::once(async move { Ok(first) })
        .chain(source)
        .boxed())
}
