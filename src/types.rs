use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing_error::SpanTrace;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Bot => "bot",
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sender {
    type Err = RelayError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Sender::User),
            "bot" => Ok(Sender::Bot),
            other => Err(RelayError::Internal(
                format!("unknown sender in store: {}", other),
                SpanTrace::capture(),
            )),
        }
    }
}

/// One persisted utterance. Rows are append-only; `id` gives the conversation order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub id: i64,
    pub sender: Sender,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// A unit parsed out of the upstream event stream. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Token { content: String },
    Done { final_text: String },
    Error { message: String },
}

impl StreamEvent {
    pub fn token(content: impl Into<String>) -> Self {
        Self::Token {
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Record written to the client's event stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientEvent {
    Token {
        token: String,
        #[serde(
            rename = "fullContent",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        full_content: Option<String>,
    },
    Done {
        content: String,
    },
    Error {
        error: String,
    },
}

impl ClientEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Token { .. })
    }

    pub fn to_sse_event(&self) -> axum::response::sse::Event {
        match serde_json::to_string(self) {
            Ok(json) => axum::response::sse::Event::default().data(json),
            Err(e) => {
                tracing::error!("Failed to serialize client event: {}", e);
                axum::response::sse::Event::default()
                    .data(r#"{"type":"error","error":"Internal server error"}"#)
            }
        }
    }
}

/// Result of one non-streaming exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Exchange {
    pub user_message: String,
    pub bot_message: String,
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl RelayError {
    pub fn status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::Upstream(..) | RelayError::Network(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Validation(_) => "VALIDATION_ERROR",
            RelayError::Upstream(..) => "UPSTREAM_ERROR",
            RelayError::Network(_) => "NETWORK_ERROR",
            RelayError::Parse(_) => "PARSE_ERROR",
            RelayError::Database(_) => "DATABASE_ERROR",
            RelayError::Serialization(_) => "SERIALIZATION_ERROR",
            RelayError::Io(_) => "IO_ERROR",
            RelayError::Internal(..) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to show a client. Store and internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            RelayError::Validation(m) => m.clone(),
            RelayError::Upstream(status, _) => {
                format!("Upstream model request failed with status {}", status.as_u16())
            }
            RelayError::Network(_) => "Upstream model is unreachable".to_string(),
            _ => "Internal server error".to_string(),
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let status = self.inner.status();
        if status.is_server_error() {
            tracing::error!("[⚙️  -> 🖥️ ] Request failed: {}", self);
        } else {
            tracing::debug!("[⚙️  -> 🖥️ ] Request rejected: {}", self.inner);
        }
        (
            status,
            axum::Json(serde_json::json!({
                "error": self.inner.public_message(),
                "code": self.inner.code(),
            })),
        )
            .into_response()
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: RelayError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<RelayError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;
