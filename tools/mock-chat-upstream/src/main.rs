use std::convert::Infallible;
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

const DEFAULT_UPSTREAM_PORT: u16 = 19_001;

type MockBody = UnsyncBoxBody<Bytes, Infallible>;

#[derive(Copy, Clone)]
enum MockScenario {
    Text,
    ToolCalls,
    Malformed,
    NoSentinel,
    SplitUtf8,
    Error,
}

impl MockScenario {
    fn as_str(self) -> &'static str {
        match self {
            MockScenario::Text => "text",
            MockScenario::ToolCalls => "tool-calls",
            MockScenario::Malformed => "malformed",
            MockScenario::NoSentinel => "no-sentinel",
            MockScenario::SplitUtf8 => "split-utf8",
            MockScenario::Error => "error",
        }
    }
}

struct RequestStats {
    stream: AtomicU64,
    nonstream: AtomicU64,
    unauthorized: AtomicU64,
}

impl RequestStats {
    const fn new() -> Self {
        Self {
            stream: AtomicU64::new(0),
            nonstream: AtomicU64::new(0),
            unauthorized: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.stream.load(Ordering::Relaxed),
            self.nonstream.load(Ordering::Relaxed),
            self.unauthorized.load(Ordering::Relaxed),
        )
    }

    fn reset(&self) {
        self.stream.store(0, Ordering::Relaxed);
        self.nonstream.store(0, Ordering::Relaxed);
        self.unauthorized.store(0, Ordering::Relaxed);
    }
}

struct MockState {
    scenario: MockScenario,
    frame_delay: Duration,
    stats: RequestStats,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let port = env_u16("UPSTREAM_PORT", DEFAULT_UPSTREAM_PORT);
    let state = Arc::new(MockState {
        scenario: parse_scenario(),
        frame_delay: Duration::from_millis(u64::from(env_u16("MOCK_FRAME_DELAY_MS", 0))),
        stats: RequestStats::new(),
    });

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap_or_else(|err| panic!("failed to bind mock upstream on 127.0.0.1:{port}: {err}"));
    eprintln!(
        "mock chat upstream on 127.0.0.1:{port} (scenario {})",
        state.scenario.as_str()
    );

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok((stream, remote_addr)) => (stream, remote_addr),
            Err(err) => {
                eprintln!("accept error: {err}");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let service_state = Arc::clone(&state);
        let service = service_fn(move |request: Request<Incoming>| {
            let state_ref = Arc::clone(&service_state);
            async move { Ok::<_, Infallible>(handle_request(request, &state_ref).await) }
        });

        tokio::spawn(async move {
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                eprintln!("mock upstream connection error from {remote_addr}: {err}");
            }
        });
    }
}

fn env_u16(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(default)
}

fn parse_scenario() -> MockScenario {
    match env::var("MOCK_SCENARIO").as_deref() {
        Ok("tool-calls") => MockScenario::ToolCalls,
        Ok("malformed") => MockScenario::Malformed,
        Ok("no-sentinel") => MockScenario::NoSentinel,
        Ok("split-utf8") => MockScenario::SplitUtf8,
        Ok("error") => MockScenario::Error,
        Ok("text") | Err(_) => MockScenario::Text,
        Ok(other) => {
            eprintln!("unknown MOCK_SCENARIO '{other}', fallback to text");
            MockScenario::Text
        }
    }
}

async fn handle_request(request: Request<Incoming>, state: &Arc<MockState>) -> Response<MockBody> {
    let (parts, body) = request.into_parts();
    let body = read_request_body(body).await;

    let method = parts.method;
    let path = parts.uri.path();

    if method == Method::GET && path == "/_mock/stats" {
        return stats_response(state);
    }
    if method == Method::POST && path == "/_mock/reset" {
        state.stats.reset();
        return simple_response_static(StatusCode::OK, "application/json", br#"{"ok":true}"#);
    }

    let authorized = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("Bearer ") && value.len() > "Bearer ".len());
    if !authorized {
        state.stats.unauthorized.fetch_add(1, Ordering::Relaxed);
        return simple_response_static(
            StatusCode::UNAUTHORIZED,
            "application/json",
            br#"{"detail":"Not authenticated"}"#,
        );
    }

    if method == Method::GET && path == "/v1/models" {
        return simple_response_static(StatusCode::OK, "application/json", MODELS_LIST);
    }
    if path != "/v1/chat/completions" {
        return simple_response_static(
            StatusCode::NOT_FOUND,
            "application/json",
            br#"{"detail":"Not Found"}"#,
        );
    }
    if method != Method::POST {
        return simple_response_static(
            StatusCode::METHOD_NOT_ALLOWED,
            "application/json",
            br#"{"detail":"Method Not Allowed"}"#,
        );
    }
    if matches!(state.scenario, MockScenario::Error) {
        return simple_response_static(
            StatusCode::SERVICE_UNAVAILABLE,
            "application/json",
            br#"{"detail":"mock_injected_error"}"#,
        );
    }

    if wants_stream(&body) {
        state.stats.stream.fetch_add(1, Ordering::Relaxed);
        streaming_response(state.scenario, state.frame_delay)
    } else {
        state.stats.nonstream.fetch_add(1, Ordering::Relaxed);
        non_streaming_response(state.scenario)
    }
}

async fn read_request_body(body: Incoming) -> Bytes {
    match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    }
}

fn wants_stream(body: &[u8]) -> bool {
    body.windows(b"\"stream\":true".len())
        .any(|window| window == b"\"stream\":true")
}

fn stats_response(state: &MockState) -> Response<MockBody> {
    let (stream, nonstream, unauthorized) = state.stats.snapshot();
    let body = format!(
        "{{\"scenario\":\"{}\",\"stream\":{stream},\"nonstream\":{nonstream},\"unauthorized\":{unauthorized}}}",
        state.scenario.as_str()
    );
    simple_response(
        StatusCode::OK,
        "application/json",
        Bytes::from(body.into_bytes()),
    )
}

fn non_streaming_response(scenario: MockScenario) -> Response<MockBody> {
    let body = match scenario {
        MockScenario::ToolCalls => CHAT_NONSTREAM_TOOL_CALLS,
        MockScenario::Malformed => br#"{"id":"chatcmpl-mock","choices":"#,
        _ => CHAT_NONSTREAM_TEXT,
    };
    simple_response_static(StatusCode::OK, "application/json", body)
}

fn stream_frames(scenario: MockScenario) -> Vec<Bytes> {
    let frames: &[&'static [u8]] = match scenario {
        MockScenario::Text | MockScenario::Error => &[TEXT_ROLE, TEXT_HEL, TEXT_LO, TEXT_STOP, DONE],
        MockScenario::ToolCalls => &[TOOL_START, TOOL_ARGS_1, TOOL_ARGS_2, TOOL_STOP, DONE],
        MockScenario::Malformed => &[TEXT_ROLE, TEXT_HEL, MALFORMED, TEXT_LO, DONE],
        MockScenario::NoSentinel => &[TEXT_ROLE, TEXT_HEL, TEXT_LO],
        MockScenario::SplitUtf8 => {
            // Cut inside the four-byte emoji so no single write is valid UTF-8.
            let cut = UTF8_FRAME.len() - 30;
            return vec![
                Bytes::from_static(TEXT_ROLE),
                Bytes::from_static(&UTF8_FRAME[..cut]),
                Bytes::from_static(&UTF8_FRAME[cut..]),
                Bytes::from_static(DONE),
            ];
        }
    };
    frames.iter().copied().map(Bytes::from_static).collect()
}

fn streaming_response(scenario: MockScenario, frame_delay: Duration) -> Response<MockBody> {
    let frames = stream_frames(scenario);
    let body = stream::unfold(frames.into_iter(), move |mut frames| async move {
        let frame = frames.next()?;
        if !frame_delay.is_zero() {
            tokio::time::sleep(frame_delay).await;
        }
        Some((Ok::<_, Infallible>(Frame::data(frame)), frames))
    });
    let mut response = Response::new(StreamBody::new(body).boxed_unsync());
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn simple_response(
    status: StatusCode,
    content_type: &'static str,
    body: Bytes,
) -> Response<MockBody> {
    let mut response = Response::new(Full::new(body).boxed_unsync());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn simple_response_static(
    status: StatusCode,
    content_type: &'static str,
    body: &'static [u8],
) -> Response<MockBody> {
    simple_response(status, content_type, Bytes::from_static(body))
}

const MODELS_LIST: &[u8] = br#"{"object":"list","data":[{"id":"default","object":"model","created":1,"owned_by":"mock"},{"id":"default/deepseek-ai/DeepSeek-V3.2","object":"model","created":1,"owned_by":"mock"}]}"#;

const CHAT_NONSTREAM_TEXT: &[u8] = br#"{"id":"chatcmpl-mock","object":"chat.completion","created":1,"model":"default","choices":[{"index":0,"message":{"role":"assistant","content":"Hello"},"finish_reason":"stop"}],"usage":{"prompt_tokens":3,"completion_tokens":1,"total_tokens":4}}"#;
const CHAT_NONSTREAM_TOOL_CALLS: &[u8] = br#"{"id":"chatcmpl-mock","object":"chat.completion","created":1,"model":"default","choices":[{"index":0,"message":{"role":"assistant","content":null,"tool_calls":[{"id":"call_1","type":"function","function":{"name":"get_weather","arguments":"{\"city\":\"Paris\"}"}}]},"finish_reason":"tool_calls"}]}"#;

const TEXT_ROLE: &[u8] = b"data: {\"id\":\"chatcmpl-mock\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"default\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n";
const TEXT_HEL: &[u8] = b"data: {\"id\":\"chatcmpl-mock\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"default\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n";
const TEXT_LO: &[u8] = b"data: {\"id\":\"chatcmpl-mock\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"default\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n";
const TEXT_STOP: &[u8] = b"data: {\"id\":\"chatcmpl-mock\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"default\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n";
const TOOL_START: &[u8] = b"data: {\"id\":\"chatcmpl-mock\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"default\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"type\":\"function\",\"function\":{\"name\":\"get_weather\",\"arguments\":\"\"}}]},\"finish_reason\":null}]}\n\n";
const TOOL_ARGS_1: &[u8] = b"data: {\"id\":\"chatcmpl-mock\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"default\",\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"city\\\":\"}}]},\"finish_reason\":null}]}\n\n";
const TOOL_ARGS_2: &[u8] = b"data: {\"id\":\"chatcmpl-mock\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"default\",\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"Paris\\\"}\"}}]},\"finish_reason\":null}]}\n\n";
const TOOL_STOP: &[u8] = b"data: {\"id\":\"chatcmpl-mock\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"default\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n";
const UTF8_FRAME: &[u8] = "data: {\"id\":\"chatcmpl-mock\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"default\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"h\u{e9}llo \u{1f600}\"},\"finish_reason\":null}]}\n\n".as_bytes();
const MALFORMED: &[u8] = b"data: {not json}\n\n";
const DONE: &[u8] = b"data: [DONE]\n\n";
