use axum::{
    body::Body,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use std::panic;
use std::time::Instant;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Sets up a global panic hook that logs panics using tracing before the default hook runs.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Wraps every request in a `request` span and echoes its id back to the client.
pub async fn request_id_middleware(req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = match req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
    {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => Uuid::new_v4().to_string(),
    };

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path()
    );
    let mut response = next.run(req).instrument(span).await;

    if let Ok(val) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    response
}

/// At most `max_chars` characters of `s`, respecting UTF-8 boundaries.
pub fn preview(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Counters for one relayed stream, logged once when it ends.
pub struct RelayMetric {
    pub tokens: usize,
    pub text_chars: usize,
    started: Instant,
}

impl Default for RelayMetric {
    fn default() -> Self {
        Self {
            tokens: 0,
            text_chars: 0,
            started: Instant::now(),
        }
    }
}

impl RelayMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_token(&mut self, content: &str) {
        self.tokens += 1;
        self.text_chars += content.chars().count();
    }

    pub fn log_summary(&self, outcome: &str, persisted: bool) {
        info!(
            target: "flight_recorder",
            "[STREAM END] Tokens: {} | Text: {} chars | Persisted: {} | Outcome: {} | {} ms",
            self.tokens,
            self.text_chars,
            persisted,
            outcome,
            self.started.elapsed().as_millis()
        );
    }
}
