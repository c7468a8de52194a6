//! A chat session: one conversation, at most one active stream.
use crate::auth::Credential;
use crate::client::{ChatClient, ChatStream, Completion, StreamEvent, StreamState};
use crate::config::ChatConfig;
use crate::conversation::{Conversation, MessageBuilder};
use crate::error::ChatError;
use crate::protocol::{ChatCompletionRequest, MemoryConfig, Message, Tool, ToolChoice};

/// Conversation state plus the stream currently writing into it.
///
/// Starting a new exchange cancels the previous stream and waits for it to
/// release its connection, so two streams never write the same in-progress
/// message.
#[derive(Debug)]
pub struct ChatSession {
    client: ChatClient,
    credential: Credential,
    conversation: Conversation,
    active: Option<ChatStream>,
    model: String,
    memory_config: Option<MemoryConfig>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    tools: Option<Vec<Tool>>,
    tool_choice: Option<ToolChoice>,
}

impl ChatSession {
    #[must_use]
    pub fn new(client: ChatClient, credential: Credential, chat: &ChatConfig) -> Self {
        Self {
            client,
            credential,
            conversation: Conversation::new(),
            active: None,
            model: chat.default_model.clone(),
            memory_config: chat.memory_config.clone(),
            temperature: chat.temperature,
            max_tokens: chat.max_tokens,
            tools: None,
            tool_choice: None,
        }
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    #[must_use]
    pub fn memory_config(&self) -> Option<&MemoryConfig> {
        self.memory_config.as_ref()
    }

    pub fn set_memory_config(&mut self, memory_config: Option<MemoryConfig>) {
        self.memory_config = memory_config;
    }

    pub fn set_tools(&mut self, tools: Vec<Tool>, tool_choice: Option<ToolChoice>) {
        self.tools = if tools.is_empty() { None } else { Some(tools) };
        self.tool_choice = tool_choice;
    }

    #[must_use]
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// The assistant message being streamed, if any.
    #[must_use]
    pub fn in_progress(&self) -> Option<&MessageBuilder> {
        self.conversation.in_progress()
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.active.is_some()
    }

    #[must_use]
    pub fn has_messages(&self) -> bool {
        !self.conversation.is_empty()
    }

    #[must_use]
    pub fn last_message(&self) -> Option<&Message> {
        self.conversation.last_message()
    }

    /// Add a system or tool message to the history without starting a stream.
    pub fn push_message(&mut self, message: Message) {
        self.conversation.push(message);
    }

    fn build_request(&self) -> ChatCompletionRequest {
        let mut request =
            ChatCompletionRequest::new(self.model.clone(), self.conversation.to_request_messages());
        request.temperature = self.temperature;
        request.max_tokens = self.max_tokens;
        request.tools.clone_from(&self.tools);
        request.tool_choice.clone_from(&self.tool_choice);
        request.memory_config.clone_from(&self.memory_config);
        request
    }

    /// Append a user message and start streaming the assistant reply.
    ///
    /// Any stream still running is cancelled first and its partial reply is
    /// kept in the history.
    pub async fn send(&mut self, text: impl Into<String>) {
        self.cancel().await;
        self.conversation.push(Message::user(text));
        let request = self.build_request();
        self.conversation.begin_assistant();
        self.active = Some(self.client.start_stream(request, &self.credential));
    }

    /// Next event of the active stream, folded into the conversation.
    ///
    /// On the terminal event the in-progress message is published and the
    /// session stops streaming. Returns `None` when nothing is streaming.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        let stream = self.active.as_mut()?;
        let event = stream.recv().await;
        match &event {
            Some(StreamEvent::Chunk(chunk)) => {
                self.conversation.apply_chunk(chunk);
            }
            Some(StreamEvent::Complete(_) | StreamEvent::Error(_)) | None => {
                self.active = None;
                self.conversation.publish_in_progress();
            }
        }
        event
    }

    /// Drive the active stream to its end.
    ///
    /// # Errors
    ///
    /// Returns the stream's error, or [`ChatError::Read`] if nothing is
    /// streaming or the stream ended without a terminal event.
    pub async fn finish(&mut self) -> Result<Completion, ChatError> {
        if self.active.is_none() {
            return Err(ChatError::Read("no active stream".to_string()));
        }
        loop {
            match self.next_event().await {
                Some(StreamEvent::Chunk(_)) => {}
                Some(StreamEvent::Complete(completion)) => return Ok(completion),
                Some(StreamEvent::Error(error)) => return Err(error),
                None => {
                    return Err(ChatError::Read(
                        "stream ended without a terminal event".to_string(),
                    ))
                }
            }
        }
    }

    /// Cancel the active stream, keeping its partial reply in the history.
    ///
    /// Returns the state the cancelled stream ended in, or `None` when
    /// nothing was streaming.
    pub async fn cancel(&mut self) -> Option<StreamState> {
        let stream = self.active.take()?;
        let state = stream.cancel().await;
        self.conversation.publish_in_progress();
        Some(state)
    }

    /// Cancel any active stream and drop the whole history.
    pub async fn clear(&mut self) {
        if let Some(stream) = self.active.take() {
            stream.cancel().await;
        }
        self.conversation.clear();
    }
}
