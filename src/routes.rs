use crate::constants::{SSE_CHANNEL_CAPACITY, SSE_KEEPALIVE_SECS};
use crate::health;
use crate::logging::request_id_middleware;
use crate::relay::StreamReassembler;
use crate::types::*;
use crate::AppState;
use axum::extract::rejection::JsonRejection;
use axum::response::sse::{Event, KeepAlive};
use axum::{
    extract::{Query, State},
    middleware,
    response::{IntoResponse, Response, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::Instrument;

#[derive(Debug, Default, Deserialize)]
pub struct MessageRequest {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub messages: Vec<Turn>,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub message: &'static str,
    pub deleted: u64,
}

pub fn build_router(state: AppState) -> Router {
    let max_body_size = state.args.max_body_size;
    Router::new()
        .route(
            "/bot/v1/message/stream",
            get(stream_message_query).post(stream_message_json),
        )
        .route("/bot/v1/message", post(send_message))
        .route("/bot/v1/messages", get(list_messages).delete(reset_messages))
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .layer(axum::extract::DefaultBodyLimit::max(max_body_size))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

async fn stream_message_query(
    State(state): State<AppState>,
    Query(req): Query<MessageRequest>,
) -> Response {
    relay_stream(state, req.text).await
}

async fn stream_message_json(
    State(state): State<AppState>,
    body: std::result::Result<Json<MessageRequest>, JsonRejection>,
) -> Response {
    match parse_body(body) {
        Ok(req) => relay_stream(state, req.text).await,
        Err(e) => e.into_response(),
    }
}

/// Body rejections (bad JSON, wrong content type) use the same error shape as every
/// other failure.
fn parse_body(body: std::result::Result<Json<MessageRequest>, JsonRejection>) -> Result<MessageRequest> {
    match body {
        Ok(Json(req)) => Ok(req),
        Err(rejection) => Err(RelayError::Validation(rejection.body_text()).into()),
    }
}

/// Opens the upstream stream and, once it has produced its first event, hands it to a
/// reassembler task that feeds the SSE response.
async fn relay_stream(state: AppState, text: String) -> Response {
    let events = match state.chat.open_stream(&text).await {
        Ok(events) => events,
        Err(e) => return e.into_response(),
    };

    let (tx, rx) = mpsc::channel::<ClientEvent>(SSE_CHANNEL_CAPACITY);
    let reassembler = StreamReassembler::new(state.chat.store().clone(), state.args.full_content);

    let stream_span = tracing::info_span!(
        "stream",
        stream_id = %uuid::Uuid::new_v4(),
        source = state.chat.source().name()
    );
    tokio::spawn(reassembler.run(events, tx).instrument(stream_span));

    let body = ReceiverStream::new(rx).map(|event| Ok::<Event, Infallible>(event.to_sse_event()));
    Sse::new(body)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(SSE_KEEPALIVE_SECS))
                .text("keepalive"),
        )
        .into_response()
}

async fn send_message(
    State(state): State<AppState>,
    body: std::result::Result<Json<MessageRequest>, JsonRejection>,
) -> Response {
    let req = match parse_body(body) {
        Ok(req) => req,
        Err(e) => return e.into_response(),
    };
    match state.chat.send_message(&req.text).await {
        Ok(exchange) => Json(exchange).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn list_messages(State(state): State<AppState>) -> Response {
    match state.chat.history().await {
        Ok(messages) => Json(HistoryResponse { messages }).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn reset_messages(State(state): State<AppState>) -> Response {
    match state.chat.reset().await {
        Ok(deleted) => Json(ResetResponse {
            message: "Conversation cleared",
            deleted,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}
