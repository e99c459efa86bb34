//! HTTP-level tests for the chat endpoints, with the upstream API mocked by wiremock.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use clap::Parser;
use parley::chat::ReplySource;
use parley::db::{init_db, ConversationStore};
use parley::routes::build_router;
use parley::types::{ClientEvent, Sender};
use parley::upstream::UpstreamClient;
use parley::{AppState, Args};
use serde_json::json;
use tempfile::TempDir;
use tower::util::ServiceExt;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

const COMPLETIONS_PATH: &str = "/api/paas/v4/chat/completions";

struct TestApp {
    _dir: TempDir,
    router: Router,
    store: ConversationStore,
}

async fn setup_app(source: ReplySource, extra_args: &[&str]) -> TestApp {
    let dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(e) => panic!("Failed to create temp dir: {:?}", e),
    };
    let pool = match init_db(dir.path().join("api.db")).await {
        Ok(p) => p,
        Err(e) => panic!("Failed to init DB: {:?}", e),
    };
    let store = ConversationStore::new(pool);

    let mut argv = vec!["parley"];
    argv.extend_from_slice(extra_args);
    let args = Args::parse_from(argv);

    let router = build_router(AppState::new(store.clone(), source, args));
    TestApp {
        _dir: dir,
        router,
        store,
    }
}

fn upstream_source(server: &MockServer) -> ReplySource {
    ReplySource::Upstream(UpstreamClient::new(
        reqwest::Client::new(),
        format!("{}{}", server.uri(), COMPLETIONS_PATH),
        "test-key",
        "glm-4.6",
        "You are a helpful assistant.",
    ))
}

fn sse_chunk(content: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({ "id": "c1", "choices": [{ "index": 0, "delta": { "content": content } }] })
    )
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn parse_sse(body: &str) -> Vec<ClientEvent> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|payload| serde_json::from_str(payload.trim_start()).unwrap())
        .collect()
}

async fn counts(store: &ConversationStore) -> (i64, i64) {
    (
        store.count(Sender::User).await.unwrap(),
        store.count(Sender::Bot).await.unwrap(),
    )
}

mod health_tests {
    use super::*;

    #[tokio::test]
    async fn test_health_liveness() {
        let app = setup_app(ReplySource::Canned, &[]).await;
        let (status, body) = send(&app.router, get("/health")).await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_health_readiness() {
        let app = setup_app(ReplySource::Canned, &[]).await;
        let (status, body) = send(&app.router, get("/readyz")).await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "ready");
        assert_eq!(json["database"], "ok");
        assert_eq!(json["reply_source"], "canned");
    }

    #[tokio::test]
    async fn test_request_id_header_is_set() {
        let app = setup_app(ReplySource::Canned, &[]).await;
        let response = app.router.clone().oneshot(get("/health")).await.unwrap();
        assert!(response.headers().contains_key("x-request-id"));

        let request = Request::builder()
            .uri("/health")
            .header("x-request-id", "abc-123")
            .body(Body::empty())
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.headers()["x-request-id"], "abc-123");
    }
}

mod direct_tests {
    use super::*;

    #[tokio::test]
    async fn test_canned_hello() {
        let app = setup_app(ReplySource::Canned, &["--reply-mode", "canned"]).await;
        let (status, body) = send(
            &app.router,
            post_json("/bot/v1/message", json!({ "text": "hello" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["userMessage"], "hello");
        assert_eq!(json["botMessage"], "Hi there! How can I assist you today?");
        assert_eq!(counts(&app.store).await, (1, 1));
    }

    #[tokio::test]
    async fn test_empty_prompt_is_rejected_without_side_effects() {
        let app = setup_app(ReplySource::Canned, &[]).await;

        for text in ["", "   "] {
            let (status, body) = send(
                &app.router,
                post_json("/bot/v1/message", json!({ "text": text })),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            let json: serde_json::Value = serde_json::from_str(&body).unwrap();
            assert_eq!(json["code"], "VALIDATION_ERROR");
            assert!(json["error"].is_string());
        }

        let (status, _) = send(&app.router, get("/bot/v1/message/stream?text=%20%20")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&app.router, get("/bot/v1/message/stream")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert_eq!(counts(&app.store).await, (0, 0));
    }

    #[tokio::test]
    async fn test_malformed_body_gets_json_error() {
        let app = setup_app(ReplySource::Canned, &[]).await;

        for uri in ["/bot/v1/message", "/bot/v1/message/stream"] {
            let request = Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from("{\"text\": "))
                .unwrap();
            let (status, body) = send(&app.router, request).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            let json: serde_json::Value = serde_json::from_str(&body).unwrap();
            assert_eq!(json["code"], "VALIDATION_ERROR");

            let request = Request::builder()
                .method("POST")
                .uri(uri)
                .body(Body::from(r#"{"text":"hello"}"#))
                .unwrap();
            let (status, body) = send(&app.router, request).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            let json: serde_json::Value = serde_json::from_str(&body).unwrap();
            assert_eq!(json["code"], "VALIDATION_ERROR");
        }

        assert_eq!(counts(&app.store).await, (0, 0));
    }

    #[tokio::test]
    async fn test_upstream_completion() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path(COMPLETIONS_PATH))
            .and(matchers::header("authorization", "Bearer test-key"))
            .and(matchers::body_partial_json(json!({ "model": "glm-4.6", "stream": false })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "index": 0, "message": { "role": "assistant", "content": "Hi!" } }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let app = setup_app(upstream_source(&server), &[]).await;
        let (status, body) = send(
            &app.router,
            post_json("/bot/v1/message", json!({ "text": "hey" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["botMessage"], "Hi!");
        assert_eq!(counts(&app.store).await, (1, 1));
    }

    #[tokio::test]
    async fn test_upstream_completion_without_content_uses_fallback() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
            .mount(&server)
            .await;

        let app = setup_app(upstream_source(&server), &[]).await;
        let (status, body) = send(
            &app.router,
            post_json("/bot/v1/message", json!({ "text": "hey" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["botMessage"], parley::constants::NO_RESPONSE_FALLBACK);
    }

    #[tokio::test]
    async fn test_upstream_blank_completion_uses_fallback() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({ "choices": [{ "index": 0, "message": { "role": "assistant", "content": "  " } }] }),
            ))
            .mount(&server)
            .await;

        let app = setup_app(upstream_source(&server), &[]).await;
        let (status, body) = send(
            &app.router,
            post_json("/bot/v1/message", json!({ "text": "hey" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["botMessage"], parley::constants::NO_RESPONSE_FALLBACK);
        assert_eq!(counts(&app.store).await, (1, 1));
    }

    #[tokio::test]
    async fn test_upstream_failure_leaves_orphaned_user_turn() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&server)
            .await;

        let app = setup_app(upstream_source(&server), &[]).await;
        let (status, body) = send(
            &app.router,
            post_json("/bot/v1/message", json!({ "text": "hey" })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["code"], "UPSTREAM_ERROR");
        assert!(!body.contains("invalid api key"));
        assert_eq!(counts(&app.store).await, (1, 0));
    }
}

mod stream_tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_with_sentinel() {
        let server = MockServer::start().await;
        let body = format!("{}{}data: [DONE]\n\n", sse_chunk("Hel"), sse_chunk("lo!"));
        Mock::given(matchers::method("POST"))
            .and(matchers::path(COMPLETIONS_PATH))
            .and(matchers::header("authorization", "Bearer test-key"))
            .and(matchers::body_partial_json(json!({ "model": "glm-4.6", "stream": true })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let app = setup_app(upstream_source(&server), &[]).await;
        let response = app
            .router
            .clone()
            .oneshot(get("/bot/v1/message/stream?text=hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "text/event-stream"
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let events = parse_sse(&String::from_utf8(bytes.to_vec()).unwrap());

        assert_eq!(
            events,
            vec![
                ClientEvent::Token {
                    token: "Hel".to_string(),
                    full_content: None
                },
                ClientEvent::Token {
                    token: "lo!".to_string(),
                    full_content: None
                },
                ClientEvent::Done {
                    content: "Hello!".to_string()
                },
            ]
        );

        let turns = app.store.all().await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].sender, Sender::User);
        assert_eq!(turns[0].text, "hello");
        assert_eq!(turns[1].sender, Sender::Bot);
        assert_eq!(turns[1].text, "Hello!");
    }

    #[tokio::test]
    async fn test_stream_closed_without_sentinel() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(sse_chunk("partial"), "text/event-stream"),
            )
            .mount(&server)
            .await;

        let app = setup_app(upstream_source(&server), &[]).await;
        let (status, body) = send(&app.router, get("/bot/v1/message/stream?text=hi")).await;

        assert_eq!(status, StatusCode::OK);
        let events = parse_sse(&body);
        assert_eq!(
            events.last(),
            Some(&ClientEvent::Done {
                content: "partial".to_string()
            })
        );
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        let turns = app.store.all().await.unwrap();
        let bots: Vec<&str> = turns
            .iter()
            .filter(|t| t.sender == Sender::Bot)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(bots, vec!["partial"]);
    }

    #[tokio::test]
    async fn test_stream_skips_malformed_fragment() {
        let server = MockServer::start().await;
        let body = format!(
            "{}data: {{\"choices\":[{{\"delta\":\n\n{}data: [DONE]\n\n",
            sse_chunk("a"),
            sse_chunk("b")
        );
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let app = setup_app(upstream_source(&server), &[]).await;
        let (_, body) = send(&app.router, get("/bot/v1/message/stream?text=hi")).await;
        let events = parse_sse(&body);

        assert_eq!(
            events.last(),
            Some(&ClientEvent::Done {
                content: "ab".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_upstream_failure_before_stream() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let app = setup_app(upstream_source(&server), &[]).await;
        let response = app
            .router
            .clone()
            .oneshot(get("/bot/v1/message/stream?text=hello"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "application/json"
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["code"], "UPSTREAM_ERROR");

        assert_eq!(app.store.count(Sender::Bot).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upstream_error_event_before_first_token() {
        let server = MockServer::start().await;
        let body = "data: {\"error\":{\"message\":\"model not found\",\"code\":\"1211\"}}\n\n";
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let app = setup_app(upstream_source(&server), &[]).await;
        let (status, body) = send(&app.router, get("/bot/v1/message/stream?text=hello")).await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["code"], "UPSTREAM_ERROR");
        assert_eq!(app.store.count(Sender::Bot).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upstream_error_event_after_first_token() {
        let server = MockServer::start().await;
        let body = format!(
            "{}data: {{\"error\":{{\"message\":\"rate limited\",\"code\":\"1302\"}}}}\n\n{}",
            sse_chunk("Hel"),
            sse_chunk("never")
        );
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let app = setup_app(upstream_source(&server), &[]).await;
        let (status, body) = send(&app.router, get("/bot/v1/message/stream?text=hello")).await;

        assert_eq!(status, StatusCode::OK);
        let events = parse_sse(&body);
        assert_eq!(
            events,
            vec![
                ClientEvent::Token {
                    token: "Hel".to_string(),
                    full_content: None
                },
                ClientEvent::Error {
                    error: parley::constants::STREAM_ERROR_MESSAGE.to_string()
                },
            ]
        );
        assert!(!body.contains("rate limited"));

        let turns = app.store.all().await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].sender, Sender::Bot);
        assert_eq!(turns[1].text, "Hel");
    }

    #[tokio::test]
    async fn test_stream_json_body_with_canned_source() {
        let app = setup_app(ReplySource::Canned, &["--full-content"]).await;
        let (status, body) = send(
            &app.router,
            post_json("/bot/v1/message/stream", json!({ "text": "Hello" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let reply = "Hi there! How can I assist you today?".to_string();
        assert_eq!(
            parse_sse(&body),
            vec![
                ClientEvent::Token {
                    token: reply.clone(),
                    full_content: Some(reply.clone())
                },
                ClientEvent::Done { content: reply },
            ]
        );
        assert_eq!(counts(&app.store).await, (1, 1));
    }

    #[tokio::test]
    async fn test_history_is_sent_upstream_when_enabled() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                format!("{}data: [DONE]\n\n", sse_chunk("answer")),
                "text/event-stream",
            ))
            .expect(2)
            .mount(&server)
            .await;

        let app = setup_app(upstream_source(&server), &["--include-history"]).await;
        send(&app.router, get("/bot/v1/message/stream?text=first")).await;
        send(&app.router, get("/bot/v1/message/stream?text=second")).await;

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);

        let body: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
        let messages = body["messages"].as_array().unwrap();
        let pairs: Vec<(&str, &str)> = messages
            .iter()
            .map(|m| (m["role"].as_str().unwrap(), m["content"].as_str().unwrap()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("system", "You are a helpful assistant."),
                ("user", "first"),
                ("assistant", "answer"),
                ("user", "second"),
            ]
        );
    }
}

mod history_tests {
    use super::*;

    #[tokio::test]
    async fn test_list_and_reset() {
        let app = setup_app(ReplySource::Canned, &[]).await;
        send(
            &app.router,
            post_json("/bot/v1/message", json!({ "text": "bye" })),
        )
        .await;

        let (status, body) = send(&app.router, get("/bot/v1/messages")).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        let messages = json["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["sender"], "user");
        assert_eq!(messages[1]["sender"], "bot");
        assert!(messages[1]["createdAt"].is_string());

        let request = Request::builder()
            .method("DELETE")
            .uri("/bot/v1/messages")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app.router, request).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["deleted"], 2);
        assert!(json["message"].is_string());

        assert_eq!(counts(&app.store).await, (0, 0));
    }
}
