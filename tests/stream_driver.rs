use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use streamchat_rs::auth::Credential;
use streamchat_rs::client::{
    ChatClient, ChatStream, Completion, StreamEvent, StreamHandler, StreamState,
};
use streamchat_rs::config::AppConfig;
use streamchat_rs::error::ChatError;
use streamchat_rs::protocol::{ChatCompletionRequest, MemoryConfig, Message, StreamChunk};

fn chunk_frame(delta: &Value) -> String {
    let chunk = json!({
        "id": "chatcmpl_mock",
        "object": "chat.completion.chunk",
        "created": 1_727_000_000_u64,
        "model": "default",
        "choices": [{"index": 0, "delta": delta, "finish_reason": null}]
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

fn hello_frames() -> Vec<String> {
    vec![
        chunk_frame(&json!({"role": "assistant"})),
        chunk_frame(&json!({"content": "Hel"})),
        chunk_frame(&json!({"content": "lo"})),
    ]
}

async fn spawn_upstream(app: Router) -> (ChatClient, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    let mut config = AppConfig::default();
    config.server.base_url = format!("http://{addr}");
    let client = ChatClient::new(&config).expect("build client");
    (client, server)
}

fn static_stream_app(body: String) -> Router {
    Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let body = body.clone();
            async move { sse_response(Body::from(body)) }
        }),
    )
}

fn request() -> ChatCompletionRequest {
    ChatCompletionRequest::new("default", vec![Message::user("ping")])
}

fn credential() -> Credential {
    Credential::new("sk-test")
}

async fn collect_events(mut stream: ChatStream) -> (Vec<StreamEvent>, StreamState) {
    let mut events = Vec::new();
    while let Some(event) = stream.recv().await {
        events.push(event);
    }
    let state = stream.state();
    (events, state)
}

fn contents(events: &[StreamEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Chunk(chunk) => chunk.primary_choice()?.delta.content.clone(),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_stream_delivers_chunks_then_completes_on_sentinel() {
    let mut body = hello_frames().concat();
    body.push_str("data: [DONE]\n\n");
    body.push_str(&chunk_frame(&json!({"content": "after sentinel"})));
    let (client, server) = spawn_upstream(static_stream_app(body)).await;

    let (events, state) = collect_events(client.start_stream(request(), &credential())).await;
    assert_eq!(contents(&events), vec!["Hel", "lo"]);
    assert_eq!(events.len(), 4);
    let Some(StreamEvent::Complete(completion)) = events.last() else {
        panic!("expected completion as the last event");
    };
    assert_eq!(
        *completion,
        Completion {
            saw_sentinel: true,
            chunks: 3,
            skipped: 0,
        }
    );
    assert_eq!(state, StreamState::Completed);

    server.abort();
}

#[tokio::test]
async fn test_stream_request_carries_bearer_and_stream_flag() {
    let captured: Arc<Mutex<Option<(HeaderMap, Value)>>> = Arc::new(Mutex::new(None));
    let captured_clone = Arc::clone(&captured);
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move |headers: HeaderMap, Json(payload): Json<Value>| {
            let captured = Arc::clone(&captured_clone);
            async move {
                *captured.lock() = Some((headers, payload));
                sse_response(Body::from("data: [DONE]\n\n"))
            }
        }),
    );
    let (client, server) = spawn_upstream(app).await;

    let request = request()
        .with_temperature(0.5)
        .with_memory_config(MemoryConfig::default());
    let (events, _) = collect_events(client.start_stream(request, &credential())).await;
    assert!(matches!(events.as_slice(), [StreamEvent::Complete(_)]));

    let (headers, payload) = captured.lock().take().expect("request captured");
    assert_eq!(headers["authorization"], "Bearer sk-test");
    assert_eq!(payload["stream"], true);
    assert_eq!(payload["model"], "default");
    assert_eq!(payload["messages"][0]["role"], "user");
    assert_eq!(payload["messages"][0]["content"], "ping");
    assert_eq!(payload["temperature"], 0.5);
    assert_eq!(payload["memory_config"]["max_long_term"], 10);
    assert!(payload.get("max_tokens").is_none());

    server.abort();
}

#[tokio::test]
async fn test_malformed_frame_does_not_abort_stream() {
    let frames = hello_frames();
    let body = format!(
        "{}{}data: {{\"choices\": [oops\n\n{}data: [DONE]\n\n",
        frames[0], frames[1], frames[2]
    );
    let (client, server) = spawn_upstream(static_stream_app(body)).await;

    let (events, state) = collect_events(client.start_stream(request(), &credential())).await;
    assert_eq!(contents(&events), vec!["Hel", "lo"]);
    let Some(StreamEvent::Complete(completion)) = events.last() else {
        panic!("expected completion as the last event");
    };
    assert_eq!(completion.skipped, 1);
    assert_eq!(state, StreamState::Completed);

    server.abort();
}

#[tokio::test]
async fn test_end_of_body_without_sentinel_completes() {
    let (client, server) = spawn_upstream(static_stream_app(hello_frames().concat())).await;

    let (events, state) = collect_events(client.start_stream(request(), &credential())).await;
    assert_eq!(contents(&events), vec!["Hel", "lo"]);
    let Some(StreamEvent::Complete(completion)) = events.last() else {
        panic!("expected completion as the last event");
    };
    assert!(!completion.saw_sentinel);
    assert_eq!(state, StreamState::Completed);

    server.abort();
}

#[tokio::test]
async fn test_non_success_status_is_single_error() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"detail": "persona not found"})),
            )
        }),
    );
    let (client, server) = spawn_upstream(app).await;

    let (events, state) = collect_events(client.start_stream(request(), &credential())).await;
    assert_eq!(events.len(), 1);
    let StreamEvent::Error(ChatError::Upstream { status, message }) = &events[0] else {
        panic!("expected upstream error, got {:?}", events[0]);
    };
    assert_eq!(*status, 500);
    assert!(message.contains("persona not found"));
    assert_eq!(state, StreamState::Failed);

    server.abort();
}

#[tokio::test]
async fn test_empty_error_body_reports_status() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async { StatusCode::UNAUTHORIZED }),
    );
    let (client, server) = spawn_upstream(app).await;

    let (events, _) = collect_events(client.start_stream(request(), &credential())).await;
    let [StreamEvent::Error(err)] = events.as_slice() else {
        panic!("expected a single error event");
    };
    assert_eq!(
        err.to_string(),
        "Upstream error: status=401, message=HTTP error! status: 401"
    );
    assert!(!err.is_transient());

    server.abort();
}

#[tokio::test]
async fn test_cancel_releases_stalled_stream() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            let first = stream::iter(vec![Ok::<_, Infallible>(Bytes::from(
                chunk_frame(&json!({"role": "assistant", "content": "Hel"})),
            ))]);
            sse_response(Body::from_stream(first.chain(stream::pending())))
        }),
    );
    let (client, server) = spawn_upstream(app).await;

    let mut stream = client.start_stream(request(), &credential());
    assert!(matches!(stream.recv().await, Some(StreamEvent::Chunk(_))));
    assert_eq!(stream.state(), StreamState::Reading);
    assert_eq!(stream.cancel().await, StreamState::Cancelled);

    server.abort();
}

#[tokio::test]
async fn test_chat_stream_is_a_futures_stream() {
    let mut body = hello_frames().concat();
    body.push_str("data: [DONE]\n\n");
    let (client, server) = spawn_upstream(static_stream_app(body)).await;

    let events: Vec<StreamEvent> = client
        .start_stream(request(), &credential())
        .collect()
        .await;
    assert_eq!(events.len(), 4);
    assert!(events[..3].iter().all(|event| !event.is_terminal()));
    assert!(events[3].is_terminal());

    server.abort();
}

#[derive(Default)]
struct RecordingHandler {
    calls: Vec<String>,
}

impl StreamHandler for RecordingHandler {
    fn on_chunk(&mut self, chunk: StreamChunk) {
        let content = chunk
            .primary_choice()
            .and_then(|choice| choice.delta.content.clone())
            .unwrap_or_default();
        self.calls.push(format!("chunk:{content}"));
    }

    fn on_complete(&mut self, completion: Completion) {
        self.calls.push(format!("complete:{}", completion.saw_sentinel));
    }

    fn on_error(&mut self, error: ChatError) {
        self.calls.push(format!("error:{error}"));
    }
}

#[tokio::test]
async fn test_handler_sees_chunks_in_order_then_one_completion() {
    let mut body = hello_frames().concat();
    body.push_str("data: [DONE]\n\n");
    let (client, server) = spawn_upstream(static_stream_app(body)).await;

    let mut handler = RecordingHandler::default();
    let state = client
        .start_stream(request(), &credential())
        .drive(&mut handler)
        .await;
    assert_eq!(
        handler.calls,
        vec!["chunk:", "chunk:Hel", "chunk:lo", "complete:true"]
    );
    assert_eq!(state, StreamState::Completed);

    server.abort();
}

#[tokio::test]
async fn test_handler_sees_single_error() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "overloaded") }),
    );
    let (client, server) = spawn_upstream(app).await;

    let mut handler = RecordingHandler::default();
    let state = client
        .start_stream(request(), &credential())
        .drive(&mut handler)
        .await;
    assert_eq!(
        handler.calls,
        vec!["error:Upstream error: status=503, message=overloaded"]
    );
    assert_eq!(state, StreamState::Failed);

    server.abort();
}

#[tokio::test]
async fn test_complete_non_streaming() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|Json(payload): Json<Value>| async move {
            assert_eq!(payload["stream"], false);
            Json(json!({
                "id": "chatcmpl_mock",
                "object": "chat.completion",
                "created": 1_727_000_000_u64,
                "model": "default",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "pong"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
            }))
        }),
    );
    let (client, server) = spawn_upstream(app).await;

    let response = client
        .complete(request(), &credential())
        .await
        .expect("completion");
    assert_eq!(response.first_message().map(|m| m.content.as_str()), Some("pong"));
    assert_eq!(response.usage.map(|u| u.total_tokens), Some(7));

    server.abort();
}

#[tokio::test]
async fn test_complete_with_bad_json_is_decode_error() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async { "{\"id\": " }),
    );
    let (client, server) = spawn_upstream(app).await;

    let err = client.complete(request(), &credential()).await.unwrap_err();
    assert!(matches!(err, ChatError::Decode(_)));

    server.abort();
}

#[tokio::test]
async fn test_list_models() {
    let app = Router::new().route(
        "/v1/models",
        get(|headers: HeaderMap| async move {
            if headers.get("authorization").is_none() {
                return (StatusCode::UNAUTHORIZED, Json(json!({"detail": "Not authenticated"})));
            }
            (
                StatusCode::OK,
                Json(json!({
                    "object": "list",
                    "data": [
                        {"id": "default", "object": "model", "created": 1, "owned_by": "memchat"},
                        {"id": "default/deepseek-ai/DeepSeek-V3.2", "object": "model", "created": 1, "owned_by": "memchat"}
                    ]
                })),
            )
        }),
    );
    let (client, server) = spawn_upstream(app).await;

    let models = client.list_models(&credential()).await.expect("models");
    let ids: Vec<&str> = models.data.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["default", "default/deepseek-ai/DeepSeek-V3.2"]);

    server.abort();
}
