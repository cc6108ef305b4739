use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An inbound message from an external channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Channel-specific message ID.
    pub id: String,
    /// Channel identifier (e.g., "telegram", "slack").
    pub channel: String,
    /// External chat/conversation identifier within the channel.
    pub chat_id: String,
    /// Sender identifier (channel-specific).
    pub sender: String,
    /// Text content.
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// A live message being incrementally edited in place. Obtained from
/// `Channel::start_stream`; must be finished exactly once.
#[async_trait]
pub trait StreamingReply: Send {
    /// Replace the message content with the current accumulated text.
    async fn update(&mut self, content: &str) -> valet_core::Result<()>;

    /// Final edit. Consumes the handle so it cannot be used again.
    async fn finish(self: Box<Self>, content: &str) -> valet_core::Result<()>;
}

/// Trait implemented by each channel adapter.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Unique identifier for this channel instance.
    fn id(&self) -> &str;

    /// Channel type name (e.g., "telegram", "slack").
    fn channel_type(&self) -> &str;

    /// Send a message and return its platform-specific message ID.
    async fn send(&self, chat_id: &str, text: &str) -> valet_core::Result<String>;

    /// Whether this channel supports incremental message editing.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Open a live-edited message for incremental delivery. Channels that
    /// don't support editing keep the default, and callers fall back to a
    /// single `send` at the end of the run.
    async fn start_stream(
        &self,
        chat_id: &str,
        initial: &str,
    ) -> valet_core::Result<Box<dyn StreamingReply>> {
        let _ = (chat_id, initial);
        Err(valet_core::ValetError::Channel {
            channel: self.id().to_string(),
            reason: "streaming not supported".into(),
        })
    }

    /// Check if the channel is currently connected.
    fn is_connected(&self) -> bool;
}
