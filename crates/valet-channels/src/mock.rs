//! In-memory channel for deterministic testing.
//!
//! Records every outbound send, streaming update, and finish with a
//! timestamp so tests can assert on delivery counts and throttle spacing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

use crate::adapter::{Channel, StreamingReply};

/// One recorded outbound send.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub chat_id: String,
    pub text: String,
}

/// Recording of one streaming reply's life.
#[derive(Debug, Clone, Default)]
pub struct StreamRecord {
    /// (instant, content) per update, in order.
    pub updates: Vec<(Instant, String)>,
    pub finished_with: Option<String>,
    pub finish_count: u32,
}

#[derive(Default)]
struct MockState {
    sent: Vec<SentMessage>,
    streams: Vec<Arc<Mutex<StreamRecord>>>,
}

/// A channel adapter that records everything and sends nothing.
#[derive(Clone)]
pub struct MockChannel {
    id: String,
    streaming: bool,
    state: Arc<Mutex<MockState>>,
}

impl MockChannel {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            streaming: false,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Enable the streaming (live-edit) capability.
    pub fn with_streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.len()
    }

    /// Snapshot of every stream opened on this channel.
    pub fn streams(&self) -> Vec<StreamRecord> {
        self.state
            .lock()
            .streams
            .iter()
            .map(|s| s.lock().clone())
            .collect()
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn channel_type(&self) -> &str {
        "mock"
    }

    async fn send(&self, chat_id: &str, text: &str) -> valet_core::Result<String> {
        let mut state = self.state.lock();
        state.sent.push(SentMessage {
            chat_id: chat_id.to_string(),
            text: text.to_string(),
        });
        Ok(format!("msg_{}", state.sent.len()))
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    async fn start_stream(
        &self,
        _chat_id: &str,
        initial: &str,
    ) -> valet_core::Result<Box<dyn StreamingReply>> {
        if !self.streaming {
            return Err(valet_core::ValetError::Channel {
                channel: self.id.clone(),
                reason: "streaming not supported".into(),
            });
        }
        let record = Arc::new(Mutex::new(StreamRecord {
            updates: vec![(Instant::now(), initial.to_string())],
            ..Default::default()
        }));
        self.state.lock().streams.push(Arc::clone(&record));
        Ok(Box::new(MockStream { record }))
    }

    fn is_connected(&self) -> bool {
        true
    }
}

struct MockStream {
    record: Arc<Mutex<StreamRecord>>,
}

#[async_trait]
impl StreamingReply for MockStream {
    async fn update(&mut self, content: &str) -> valet_core::Result<()> {
        self.record
            .lock()
            .updates
            .push((Instant::now(), content.to_string()));
        Ok(())
    }

    async fn finish(self: Box<Self>, content: &str) -> valet_core::Result<()> {
        let mut record = self.record.lock();
        record.finished_with = Some(content.to_string());
        record.finish_count += 1;
        Ok(())
    }
}
