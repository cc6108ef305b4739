use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use valet_core::{Message, Result, Tool};

/// A request to an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// The model to use, e.g. "mock/test-model" (provider-specific part).
    pub model: String,
    /// Conversation history.
    pub messages: Vec<Message>,
    /// Available tools.
    pub tools: Arc<Vec<Tool>>,
    /// System prompt (separate from messages for providers that support it).
    pub system: Option<String>,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Temperature.
    pub temperature: f32,
}

/// Why the model stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

/// One event of a provider's normalized output stream.
///
/// Tool calls arrive fragmented: a `ToolCallStart` names the call, zero or
/// more `ToolCallDelta` events carry argument JSON fragments, and a
/// `ToolCallEnd` closes it. A provider is allowed to drop the end event on
/// abnormal stream termination — the consumer must finalize open buffers.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    ThinkingDelta(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, fragment: String },
    ToolCallEnd { id: String },
    /// Usage stats (sent at end of stream).
    Usage(Usage),
    /// Stream is done.
    Done(StopReason),
    /// An error occurred mid-stream. Terminal for this stream.
    Error(String),
}

/// Token usage statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub thinking_tokens: u32,
}

impl Usage {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens + self.thinking_tokens
    }

    pub fn merge(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.thinking_tokens += other.thinking_tokens;
    }
}

/// Trait implemented by each LLM provider adapter.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Human-readable name, e.g. "Anthropic", "OpenAI", "Mock".
    fn name(&self) -> &str;

    /// Open a streaming request. The returned receiver yields a lazy, finite,
    /// non-restartable sequence of events; the provider honors the
    /// cancellation token by closing the stream early.
    async fn stream(
        &self,
        request: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamEvent>>;
}
