//! Mock LLM provider for deterministic testing.
//!
//! Streams pre-configured turns without making any HTTP calls. Tool-call
//! arguments are emitted as split JSON fragments so consumers exercise
//! their accumulation path.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::provider::*;
use valet_core::{Result, ToolCall, ValetError};

/// A mock LLM provider that streams pre-configured turns.
///
/// # Example
/// ```
/// use valet_llm::MockProvider;
/// let provider = MockProvider::new()
///     .with_response("Hello, world!");
/// ```
pub struct MockProvider {
    turns: Arc<Mutex<Vec<MockTurn>>>,
    /// Track all requests received (for assertions in tests).
    pub requests: Arc<Mutex<Vec<LlmRequest>>>,
    name: String,
}

/// A pre-configured turn from the mock provider.
#[derive(Clone, Default)]
pub struct MockTurn {
    pub text: String,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    /// Ids of tool calls whose `ToolCallEnd` event is withheld, simulating
    /// a stream that terminates before closing its argument buffers.
    pub unterminated: Vec<String>,
    pub usage: Usage,
    /// If set, the stream emits this error after any text.
    pub error: Option<String>,
    /// If set, `stream()` itself fails before producing a receiver.
    pub connect_error: Option<String>,
    /// Pause between streamed words, for tests that need a paced stream.
    pub word_delay_ms: u64,
}

impl MockTurn {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            usage: default_usage(),
            ..Default::default()
        }
    }
}

fn default_usage() -> Usage {
    Usage {
        input_tokens: 100,
        output_tokens: 50,
        thinking_tokens: 0,
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            turns: Arc::new(Mutex::new(vec![])),
            requests: Arc::new(Mutex::new(vec![])),
            name: "Mock".into(),
        }
    }

    /// Queue a simple text response.
    pub fn with_response(self, text: &str) -> Self {
        self.turns.lock().unwrap().push(MockTurn::text(text));
        self
    }

    /// Queue a turn that requests one tool call (and says nothing else).
    pub fn with_tool_call(self, call_id: &str, name: &str, args: serde_json::Value) -> Self {
        self.turns.lock().unwrap().push(MockTurn {
            tool_calls: vec![ToolCall {
                id: call_id.to_string(),
                name: name.to_string(),
                arguments: args,
            }],
            usage: default_usage(),
            ..Default::default()
        });
        self
    }

    /// Queue a turn that requests several tool calls in one iteration.
    pub fn with_tool_calls(self, calls: Vec<(&str, &str, serde_json::Value)>) -> Self {
        self.turns.lock().unwrap().push(MockTurn {
            tool_calls: calls
                .into_iter()
                .map(|(id, name, args)| ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments: args,
                })
                .collect(),
            usage: default_usage(),
            ..Default::default()
        });
        self
    }

    /// Queue a tool call whose argument buffer never receives its end event.
    pub fn with_unterminated_tool_call(
        self,
        call_id: &str,
        name: &str,
        args: serde_json::Value,
    ) -> Self {
        self.turns.lock().unwrap().push(MockTurn {
            tool_calls: vec![ToolCall {
                id: call_id.to_string(),
                name: name.to_string(),
                arguments: args,
            }],
            unterminated: vec![call_id.to_string()],
            usage: default_usage(),
            ..Default::default()
        });
        self
    }

    /// Queue a mid-stream error.
    pub fn with_error(self, error: &str) -> Self {
        self.turns.lock().unwrap().push(MockTurn {
            error: Some(error.to_string()),
            ..Default::default()
        });
        self
    }

    /// Queue a fully custom turn.
    pub fn with_turn(self, turn: MockTurn) -> Self {
        self.turns.lock().unwrap().push(turn);
        self
    }

    fn next_turn(&self) -> MockTurn {
        let mut turns = self.turns.lock().unwrap();
        if turns.is_empty() {
            MockTurn::text("(mock: no more queued turns)")
        } else {
            turns.remove(0)
        }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(
        &self,
        request: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        self.requests.lock().unwrap().push(request.clone());
        let turn = self.next_turn();

        if let Some(err) = turn.connect_error {
            return Err(ValetError::Provider(err));
        }

        let (tx, rx) = mpsc::channel(64);
        let cancel = cancel.clone();

        tokio::spawn(async move {
            if let Some(thinking) = turn.thinking {
                let _ = tx.send(StreamEvent::ThinkingDelta(thinking)).await;
            }

            // Stream the text word by word
            for word in turn.text.split_whitespace() {
                if cancel.is_cancelled() {
                    return;
                }
                let _ = tx.send(StreamEvent::TextDelta(format!("{word} "))).await;
                if turn.word_delay_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(turn.word_delay_ms)).await;
                } else {
                    tokio::task::yield_now().await;
                }
            }

            if let Some(err) = turn.error {
                let _ = tx.send(StreamEvent::Error(err)).await;
                return;
            }

            // Stream tool calls as start / split argument fragments / end
            let has_tool_calls = !turn.tool_calls.is_empty();
            for tc in turn.tool_calls {
                let _ = tx
                    .send(StreamEvent::ToolCallStart {
                        id: tc.id.clone(),
                        name: tc.name.clone(),
                    })
                    .await;
                let json = tc.arguments.to_string();
                let mut mid = json.len() / 2;
                while !json.is_char_boundary(mid) {
                    mid -= 1;
                }
                for fragment in [&json[..mid], &json[mid..]] {
                    if !fragment.is_empty() {
                        let _ = tx
                            .send(StreamEvent::ToolCallDelta {
                                id: tc.id.clone(),
                                fragment: fragment.to_string(),
                            })
                            .await;
                    }
                }
                if !turn.unterminated.contains(&tc.id) {
                    let _ = tx.send(StreamEvent::ToolCallEnd { id: tc.id }).await;
                }
            }

            let _ = tx.send(StreamEvent::Usage(turn.usage)).await;
            let stop = if has_tool_calls {
                StopReason::ToolUse
            } else {
                StopReason::EndTurn
            };
            let _ = tx.send(StreamEvent::Done(stop)).await;
        });

        Ok(rx)
    }
}
