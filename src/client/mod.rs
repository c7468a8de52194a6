//! HTTP client for the chat backend.
//!
//! [`ChatClient::start_stream`] spawns one task per stream. The task owns the
//! response body and sends [`StreamEvent`]s over a bounded channel to the
//! returned [`ChatStream`], which is also the cancellation handle.
mod driver;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use http::header::{ACCEPT, AUTHORIZATION};
use http::HeaderValue;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::auth::Credential;
use crate::config::{AppConfig, ServerConfig};
use crate::error::{upstream_error, ChatError};
use crate::protocol::{ChatCompletionRequest, ChatCompletionResponse, ModelsResponse, StreamChunk};
use crate::state::StreamIdGenerator;

use self::driver::{drive_byte_stream, SharedStreamState, StreamSink};
pub use self::driver::{Completion, StreamEvent, StreamState};

fn build_reqwest_client(config: &ServerConfig) -> Result<reqwest::Client, ChatError> {
    // No whole-request timeout here: streams are bounded per read instead.
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(config.http_pool_max_idle_per_host)
        .tcp_nodelay(true)
        .connect_timeout(config.connect_timeout())
        .redirect(reqwest::redirect::Policy::none());

    if let Some(proxy_url) = config.proxy.as_deref() {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| ChatError::Config(format!("Invalid proxy URL: {err}")))?;
        builder = builder.no_proxy().proxy(proxy);
    } else if !config.http_use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| ChatError::Config(format!("Failed to build HTTP client: {err}")))
}

fn endpoint_url(base_url: &str, path: &str) -> Result<url::Url, ChatError> {
    let joined = format!("{}{}", base_url.trim().trim_end_matches('/'), path);
    url::Url::parse(&joined)
        .map_err(|err| ChatError::Config(format!("Invalid endpoint URL '{joined}': {err}")))
}

fn send_error(err: &reqwest::Error) -> ChatError {
    if err.is_builder() {
        ChatError::InvalidRequest(err.to_string())
    } else {
        ChatError::Connection(err.to_string())
    }
}

/// Client for the completions and models endpoints.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    completions_url: url::Url,
    models_url: url::Url,
    request_timeout: Duration,
    read_timeout: Option<Duration>,
    channel_capacity: usize,
    stream_ids: Arc<StreamIdGenerator>,
}

impl ChatClient {
    /// Build a client from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Config`] when the endpoint URLs or proxy are
    /// invalid, or the HTTP client cannot be built.
    pub fn new(config: &AppConfig) -> Result<Self, ChatError> {
        let server = &config.server;
        Ok(Self {
            http: build_reqwest_client(server)?,
            completions_url: endpoint_url(&server.base_url, &server.completions_path)?,
            models_url: endpoint_url(&server.base_url, &server.models_path)?,
            request_timeout: server.request_timeout(),
            read_timeout: server.read_timeout(),
            channel_capacity: config.chat.stream_channel_capacity.max(1),
            stream_ids: Arc::new(StreamIdGenerator::new()),
        })
    }

    #[must_use]
    pub fn completions_url(&self) -> &url::Url {
        &self.completions_url
    }

    /// Start a streaming completion.
    ///
    /// The request is sent with `stream: true` regardless of its flag. Must
    /// be called from within a tokio runtime. Failures, including a rejected
    /// connection or a non-success status, arrive as the stream's single
    /// [`StreamEvent::Error`].
    #[must_use]
    pub fn start_stream(&self, mut request: ChatCompletionRequest, credential: &Credential) -> ChatStream {
        request.stream = true;
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let state = SharedStreamState::new();
        let stream_id = self.stream_ids.next_id();
        let span = tracing::info_span!("chat_stream", stream_id = %stream_id, model = %request.model);

        let task = run_stream(
            self.http.clone(),
            self.completions_url.clone(),
            request,
            credential.authorization_header(),
            StreamSink::new(tx, cancel_rx, state.clone()),
            self.read_timeout,
        );
        let handle = tokio::spawn(task.instrument(span));

        ChatStream {
            rx,
            cancel_tx,
            handle: Some(handle),
            state,
            stream_id,
        }
    }

    /// Non-streaming completion: same request shape with `stream: false`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Connection`], [`ChatError::Upstream`] or
    /// [`ChatError::Decode`] depending on where the call failed.
    pub async fn complete(
        &self,
        mut request: ChatCompletionRequest,
        credential: &Credential,
    ) -> Result<ChatCompletionResponse, ChatError> {
        request.stream = false;
        let builder = self
            .http
            .post(self.completions_url.clone())
            .header(AUTHORIZATION, credential.authorization_header()?)
            .json(&request);
        let response: ChatCompletionResponse = self.send_json(builder).await?;
        if let Some(usage) = &response.usage {
            crate::observability::log_usage(&response.model, usage);
        }
        Ok(response)
    }

    /// List the models the backend exposes.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Connection`], [`ChatError::Upstream`] or
    /// [`ChatError::Decode`] depending on where the call failed.
    pub async fn list_models(&self, credential: &Credential) -> Result<ModelsResponse, ChatError> {
        let builder = self
            .http
            .get(self.models_url.clone())
            .header(AUTHORIZATION, credential.authorization_header()?);
        self.send_json(builder).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, ChatError> {
        let response = builder
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|err| send_error(&err))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| ChatError::UnreadableBody(err.to_string()))?;
        if !status.is_success() {
            return Err(upstream_error(status.as_u16(), &String::from_utf8_lossy(&body)));
        }
        serde_json::from_slice(&body).map_err(|err| ChatError::Decode(err.to_string()))
    }
}

async fn run_stream(
    http: reqwest::Client,
    url: url::Url,
    request: ChatCompletionRequest,
    authorization: Result<HeaderValue, ChatError>,
    mut sink: StreamSink,
    read_timeout: Option<Duration>,
) -> StreamState {
    sink.advance(StreamState::Connecting);
    let authorization = match authorization {
        Ok(value) => value,
        Err(err) => return sink.fail(err).await,
    };

    let send = http
        .post(url)
        .header(AUTHORIZATION, authorization)
        .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
        .json(&request)
        .send();
    let response = tokio::select! {
        biased;
        () = sink.cancelled() => return sink.finish_cancelled(),
        response = send => response,
    };
    let response = match response {
        Ok(response) => response,
        Err(err) => return sink.fail(send_error(&err)).await,
    };

    let status = response.status();
    if !status.is_success() {
        let body = tokio::select! {
            biased;
            () = sink.cancelled() => return sink.finish_cancelled(),
            body = response.text() => body.unwrap_or_default(),
        };
        return sink.fail(upstream_error(status.as_u16(), &body)).await;
    }

    tracing::debug!(status = status.as_u16(), "stream connected");
    drive_byte_stream(response.bytes_stream(), sink, read_timeout).await
}

/// Callback-style consumer of a stream.
///
/// For a stream that is not cancelled, exactly one of `on_complete` and
/// `on_error` is called, after the last `on_chunk`.
pub trait StreamHandler {
    fn on_chunk(&mut self, chunk: StreamChunk);
    fn on_complete(&mut self, completion: Completion);
    fn on_error(&mut self, error: ChatError);
}

/// Handle to one running stream.
///
/// Yields [`StreamEvent`]s in arrival order and ends after the terminal
/// event. Dropping the handle aborts the stream task.
#[derive(Debug)]
pub struct ChatStream {
    rx: mpsc::Receiver<StreamEvent>,
    cancel_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<StreamState>>,
    state: SharedStreamState,
    stream_id: uuid::Uuid,
}

impl ChatStream {
    /// Next event, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Current state. `Completed` and `Failed` are recorded only once the
    /// matching terminal event is queued for the consumer.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state.get()
    }

    #[must_use]
    pub fn stream_id(&self) -> uuid::Uuid {
        self.stream_id
    }

    /// Cancel the stream and wait for its task to release the connection.
    ///
    /// Returns the state the stream ended in. A stream that already resolved
    /// keeps its `Completed` or `Failed` state.
    pub async fn cancel(mut self) -> StreamState {
        self.cancel_tx.send_replace(true);
        self.rx.close();
        self.join_task().await
    }

    async fn join_task(&mut self) -> StreamState {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(stream_id = %self.stream_id, error = %err, "stream task did not finish cleanly");
                self.state.advance(StreamState::Cancelled);
            }
        }
        self.state.get()
    }

    /// Feed every event to `handler` until the stream ends.
    pub async fn drive<H: StreamHandler + ?Sized>(mut self, handler: &mut H) -> StreamState {
        while let Some(event) = self.rx.recv().await {
            match event {
                StreamEvent::Chunk(chunk) => handler.on_chunk(chunk),
                StreamEvent::Complete(completion) => handler.on_complete(completion),
                StreamEvent::Error(error) => handler.on_error(error),
            }
        }
        self.join_task().await
    }
}

impl Stream for ChatStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}
