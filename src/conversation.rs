//! Conversation history and the in-progress assistant message.
//!
//! Stream deltas are folded into a [`MessageBuilder`] that the conversation
//! owns separately from its published history. The builder is turned into an
//! immutable [`Message`] and appended in one step when its stream completes,
//! fails or is cancelled, so readers of the history never observe a
//! half-merged entry.
use crate::protocol::{
    Delta, FinishReason, FunctionCall, Message, Role, StreamChunk, ToolCall, ToolCallDelta,
};
use crate::util::unix_now_secs;

/// Accumulates stream deltas into one assistant message.
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    role: Option<Role>,
    content: String,
    tool_calls: Vec<(u32, ToolCall)>,
    finish_reason: Option<FinishReason>,
    chunks: usize,
}

impl MessageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold the first choice (index 0) of `chunk` into the message.
    ///
    /// Other choices are ignored. Never fails: every field is a best-effort
    /// merge.
    pub fn apply_chunk(&mut self, chunk: &StreamChunk) {
        self.chunks += 1;
        let Some(choice) = chunk.primary_choice() else {
            return;
        };
        self.apply_delta(&choice.delta);
        if let Some(reason) = choice.finish_reason {
            self.finish_reason = Some(reason);
        }
    }

    /// Merge a single delta: role is set once, content and tool-call
    /// arguments are appended.
    pub fn apply_delta(&mut self, delta: &Delta) {
        if let Some(role) = delta.role {
            if self.role.is_none() {
                self.role = Some(role);
            }
        }
        if let Some(content) = delta.content.as_deref() {
            self.content.push_str(content);
        }
        if let Some(tool_calls) = delta.tool_calls.as_deref() {
            for (position, fragment) in tool_calls.iter().enumerate() {
                let index = fragment
                    .index
                    .unwrap_or_else(|| u32::try_from(position).unwrap_or(u32::MAX));
                self.merge_tool_call(index, fragment);
            }
        }
    }

    fn merge_tool_call(&mut self, index: u32, fragment: &ToolCallDelta) {
        let function = fragment.function.as_ref();
        let arguments = function.and_then(|f| f.arguments.as_deref());

        let slot = match self.tool_calls.binary_search_by_key(&index, |(i, _)| *i) {
            Ok(slot) => slot,
            Err(slot) => {
                let call = ToolCall {
                    id: fragment.id.clone().unwrap_or_default(),
                    kind: fragment.kind.unwrap_or_default(),
                    function: FunctionCall {
                        name: function
                            .and_then(|f| f.name.clone())
                            .unwrap_or_default(),
                        arguments: arguments.unwrap_or_default().to_owned(),
                    },
                };
                self.tool_calls.insert(slot, (index, call));
                return;
            }
        };

        let call = &mut self.tool_calls[slot].1;
        if call.id.is_empty() {
            if let Some(id) = fragment.id.as_deref() {
                call.id.push_str(id);
            }
        }
        if call.function.name.is_empty() {
            if let Some(name) = function.and_then(|f| f.name.as_deref()) {
                call.function.name.push_str(name);
            }
        }
        if let Some(arguments) = arguments {
            call.function.arguments.push_str(arguments);
        }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role.unwrap_or(Role::Assistant)
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Tool calls merged so far, ordered by their stream index.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.tool_calls.iter().map(|(_, call)| call)
    }

    #[must_use]
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Number of chunks folded in.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    /// A copy of the message as accumulated so far.
    #[must_use]
    pub fn snapshot(&self) -> Message {
        self.clone().finish()
    }

    /// Close the builder into an immutable message.
    #[must_use]
    pub fn finish(self) -> Message {
        let tool_calls = if self.tool_calls.is_empty() {
            None
        } else {
            Some(self.tool_calls.into_iter().map(|(_, call)| call).collect())
        };
        Message {
            role: self.role.unwrap_or(Role::Assistant),
            content: self.content,
            tool_calls,
            tool_call_id: None,
        }
    }
}

/// A published history entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationEntry {
    pub message: Message,
    /// Unix seconds at which the entry was published.
    pub timestamp: u64,
}

/// Ordered chat history with at most one in-progress assistant message.
#[derive(Debug, Default)]
pub struct Conversation {
    entries: Vec<ConversationEntry>,
    in_progress: Option<MessageBuilder>,
}

impl Conversation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a finished message to the history.
    pub fn push(&mut self, message: Message) {
        self.entries.push(ConversationEntry {
            message,
            timestamp: unix_now_secs(),
        });
    }

    /// Start a new in-progress assistant message.
    ///
    /// An in-progress message left over from an earlier stream is published
    /// first, so there is never more than one.
    pub fn begin_assistant(&mut self) -> &mut MessageBuilder {
        if self.in_progress.is_some() {
            tracing::debug!("publishing interrupted in-progress message before new stream");
            self.publish_in_progress();
        }
        self.in_progress.insert(MessageBuilder::new())
    }

    /// Fold a chunk into the in-progress message.
    ///
    /// Returns `false` when no message is in progress; the chunk is dropped.
    pub fn apply_chunk(&mut self, chunk: &StreamChunk) -> bool {
        match self.in_progress.as_mut() {
            Some(builder) => {
                builder.apply_chunk(chunk);
                true
            }
            None => {
                tracing::debug!(chunk_id = %chunk.id, "dropping chunk with no in-progress message");
                false
            }
        }
    }

    /// Close the in-progress message and append it to the history.
    ///
    /// Partial (even empty) messages are kept; callers that want to discard
    /// them can use [`Self::pop`].
    pub fn publish_in_progress(&mut self) -> Option<&Message> {
        let builder = self.in_progress.take()?;
        self.push(builder.finish());
        self.entries.last().map(|entry| &entry.message)
    }

    #[must_use]
    pub fn in_progress(&self) -> Option<&MessageBuilder> {
        self.in_progress.as_ref()
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.in_progress.is_some()
    }

    /// Remove and return the most recent history entry.
    pub fn pop(&mut self) -> Option<Message> {
        self.entries.pop().map(|entry| entry.message)
    }

    #[must_use]
    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|entry| &entry.message)
    }

    /// Published messages, cloned for a request body.
    #[must_use]
    pub fn to_request_messages(&self) -> Vec<Message> {
        self.messages().cloned().collect()
    }

    #[must_use]
    pub fn last_message(&self) -> Option<&Message> {
        self.entries.last().map(|entry| &entry.message)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all history, including any in-progress message.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.in_progress = None;
    }
}
