use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message in a conversation. History is append-only: once a later message
/// has been appended, earlier messages are never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub created_at: DateTime<Utc>,
    /// Token usage attributed to this message (assistant messages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single content block within a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        /// Base64-encoded image data or a URL.
        data: String,
        media_type: String,
    },
    /// A tool invocation requested by the assistant.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// The answer to a `ToolUse` block, carried in the next user-role message.
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    Thinking {
        text: String,
    },
}

/// Token usage attached to an assistant message.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Message {
    /// Create a simple text message.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: vec![ContentBlock::Text { text: text.into() }],
            created_at: Utc::now(),
            usage: None,
        }
    }

    /// Create a message from raw content blocks.
    pub fn with_blocks(role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content,
            created_at: Utc::now(),
            usage: None,
        }
    }

    /// Create the user-role message that answers an assistant turn's tool calls.
    /// One `ToolResult` block per answered `ToolUse`, in execution order.
    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        debug_assert!(
            results
                .iter()
                .all(|b| matches!(b, ContentBlock::ToolResult { .. }))
        );
        Self::with_blocks(Role::User, results)
    }

    /// Extract all text content joined together.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// All `ToolUse` blocks in this message, in arrival order.
    pub fn tool_uses(&self) -> Vec<&ContentBlock> {
        self.content
            .iter()
            .filter(|c| matches!(c, ContentBlock::ToolUse { .. }))
            .collect()
    }

    /// Ids of `ToolUse` blocks in this message that `next` does not answer
    /// with a matching `ToolResult`. Empty means the pairing invariant holds.
    pub fn unanswered_tool_uses(&self, next: &Message) -> Vec<String> {
        let answered: Vec<&str> = next
            .content
            .iter()
            .filter_map(|c| match c {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect();
        self.content
            .iter()
            .filter_map(|c| match c {
                ContentBlock::ToolUse { id, .. } if !answered.contains(&id.as_str()) => {
                    Some(id.clone())
                }
                _ => None,
            })
            .collect()
    }
}
