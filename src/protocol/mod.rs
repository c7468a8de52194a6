pub mod chat;
pub mod models;

pub use chat::{
    ChatCompletionRequest, ChatCompletionResponse, Choice, Delta, FinishReason, FunctionCall,
    FunctionCallDelta, MemoryConfig, Message, Role, StreamChoice, StreamChunk, Tool,
    ToolCall, ToolCallDelta, ToolChoice, ToolFunction, ToolKind, Usage,
};
pub use models::{Model, ModelSelector, ModelsResponse};
