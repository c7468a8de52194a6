use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use streamchat_rs::auth::Credential;
use streamchat_rs::client::{ChatClient, StreamEvent, StreamState};
use streamchat_rs::config::{AppConfig, ChatConfig};
use streamchat_rs::error::ChatError;
use streamchat_rs::protocol::{FinishReason, Role};
use streamchat_rs::session::ChatSession;

fn chunk_frame(delta: &Value, finish_reason: Option<&str>) -> String {
    let chunk = json!({
        "id": "chatcmpl_mock",
        "object": "chat.completion.chunk",
        "created": 1_727_000_000_u64,
        "model": "default",
        "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}]
    });
    format!("data: {chunk}\n\n")
}

fn sse_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .body(body)
        .expect("stream response")
}

async fn spawn_session(app: Router) -> (ChatSession, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    let mut config = AppConfig::default();
    config.server.base_url = format!("http://{addr}");
    config.chat = ChatConfig {
        default_model: "assistant".to_string(),
        ..ChatConfig::default()
    };
    let client = ChatClient::new(&config).expect("build client");
    let session = ChatSession::new(client, Credential::new("sk-test"), &config.chat);
    (session, server)
}

#[tokio::test]
async fn test_session_accumulates_hello() {
    let body = [
        chunk_frame(&json!({"role": "assistant"}), None),
        chunk_frame(&json!({"content": "Hel"}), None),
        chunk_frame(&json!({"content": "lo"}), Some("stop")),
        "data: [DONE]\n\n".to_string(),
    ]
    .concat();
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let body = body.clone();
            async move { sse_response(Body::from(body)) }
        }),
    );
    let (mut session, server) = spawn_session(app).await;

    assert!(!session.has_messages());
    session.send("hi").await;
    assert!(session.is_streaming());
    // The in-progress reply is not part of the published history.
    assert_eq!(session.conversation().len(), 1);

    let completion = session.finish().await.expect("completion");
    assert!(completion.saw_sentinel);
    assert!(!session.is_streaming());

    let messages: Vec<_> = session.conversation().messages().collect();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "hi");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "Hello");
    assert!(session.conversation().entries()[1].timestamp > 0);

    server.abort();
}

#[tokio::test]
async fn test_session_merges_tool_call_fragments() {
    let body = [
        chunk_frame(
            &json!({"role": "assistant", "tool_calls": [{
                "index": 0, "id": "a", "type": "function",
                "function": {"name": "f", "arguments": "{\"x\":"}
            }]}),
            None,
        ),
        chunk_frame(
            &json!({"tool_calls": [{"index": 0, "function": {"arguments": "1}"}}]}),
            Some("tool_calls"),
        ),
        "data: [DONE]\n\n".to_string(),
    ]
    .concat();
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let body = body.clone();
            async move { sse_response(Body::from(body)) }
        }),
    );
    let (mut session, server) = spawn_session(app).await;

    session.send("call f").await;
    let mut finish_reason = None;
    while let Some(event) = session.next_event().await {
        if let Some(builder) = session.in_progress() {
            finish_reason = builder.finish_reason();
        }
        if event.is_terminal() {
            break;
        }
    }
    assert_eq!(finish_reason, Some(FinishReason::ToolCalls));

    let message = session.last_message().expect("assistant message");
    let tool_calls = message.tool_calls.as_ref().expect("tool calls");
    assert_eq!(tool_calls.len(), 1);
    assert_eq!(tool_calls[0].id, "a");
    assert_eq!(tool_calls[0].function.name, "f");
    assert_eq!(tool_calls[0].function.arguments, "{\"x\":1}");

    server.abort();
}

#[tokio::test]
async fn test_session_sends_history_on_next_turn() {
    let requests = Arc::new(AtomicUsize::new(0));
    let seen_messages: Arc<parking_lot::Mutex<Vec<usize>>> = Arc::default();
    let requests_clone = Arc::clone(&requests);
    let seen_clone = Arc::clone(&seen_messages);
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move |Json(payload): Json<Value>| {
            let requests = Arc::clone(&requests_clone);
            let seen = Arc::clone(&seen_clone);
            async move {
                requests.fetch_add(1, Ordering::Relaxed);
                let count = payload["messages"].as_array().map_or(0, Vec::len);
                seen.lock().push(count);
                assert_eq!(payload["model"], "assistant/gpt-4o");
                assert_eq!(payload["memory_config"]["enabled"], false);
                sse_response(Body::from(format!(
                    "{}data: [DONE]\n\n",
                    chunk_frame(&json!({"role": "assistant", "content": "ok"}), Some("stop"))
                )))
            }
        }),
    );
    let (mut session, server) = spawn_session(app).await;
    session.set_model("assistant/gpt-4o");
    session.set_memory_config(Some(streamchat_rs::protocol::MemoryConfig {
        enabled: false,
        max_long_term: None,
        auto_save: None,
    }));

    session.send("first").await;
    session.finish().await.expect("first turn");
    session.send("second").await;
    session.finish().await.expect("second turn");

    assert_eq!(requests.load(Ordering::Relaxed), 2);
    // The in-progress assistant message is never sent upstream.
    assert_eq!(*seen_messages.lock(), vec![1, 3]);
    assert_eq!(session.conversation().len(), 4);

    session.clear().await;
    assert!(!session.has_messages());
    assert!(session.last_message().is_none());

    server.abort();
}

fn stalled_app() -> Router {
    Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            let frames = stream::iter(vec![
                Ok::<_, Infallible>(Bytes::from(chunk_frame(&json!({"role": "assistant"}), None))),
                Ok(Bytes::from(chunk_frame(&json!({"content": "Hel"}), None))),
            ]);
            sse_response(Body::from_stream(frames.chain(stream::pending())))
        }),
    )
}

async fn read_until_content(session: &mut ChatSession, expected: &str) {
    loop {
        match session.next_event().await {
            Some(StreamEvent::Chunk(_)) => {
                if session.in_progress().map(|b| b.content()) == Some(expected) {
                    return;
                }
            }
            other => panic!("stream ended early: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_cancel_keeps_partial_message() {
    let (mut session, server) = spawn_session(stalled_app()).await;

    session.send("hi").await;
    read_until_content(&mut session, "Hel").await;
    assert_eq!(session.cancel().await, Some(StreamState::Cancelled));
    assert!(!session.is_streaming());

    let message = session.last_message().expect("partial message");
    assert_eq!(message.role, Role::Assistant);
    assert_eq!(message.content, "Hel");
    assert_eq!(session.cancel().await, None);

    server.abort();
}

#[tokio::test]
async fn test_send_cancels_previous_stream() {
    let (mut session, server) = spawn_session(stalled_app()).await;

    session.send("one").await;
    read_until_content(&mut session, "Hel").await;
    session.send("two").await;
    read_until_content(&mut session, "Hel").await;

    let roles: Vec<Role> = session.conversation().messages().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
    assert!(session.in_progress().is_some());

    session.cancel().await;
    assert_eq!(session.conversation().len(), 4);

    server.abort();
}

#[tokio::test]
async fn test_error_publishes_empty_partial_message() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }),
    );
    let (mut session, server) = spawn_session(app).await;

    session.send("hi").await;
    let err = session.finish().await.unwrap_err();
    assert!(matches!(err, ChatError::Upstream { status: 502, .. }));
    assert!(err.is_transient());

    let message = session.last_message().expect("partial message");
    assert_eq!(message.role, Role::Assistant);
    assert!(message.content.is_empty());
    assert_eq!(session.conversation().len(), 2);

    server.abort();
}

#[tokio::test]
async fn test_finish_without_stream_is_error() {
    let (mut session, server) = spawn_session(Router::new()).await;
    assert!(matches!(session.finish().await, Err(ChatError::Read(_))));
    assert!(session.next_event().await.is_none());
    server.abort();
}
