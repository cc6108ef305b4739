use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::sync::Arc;
use tokio::sync::broadcast;

/// Correlation tag attached to every lifecycle event so a UI layer or log
/// sink can group events by the run that produced them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventTag {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teammate_id: Option<Uuid>,
}

impl EventTag {
    pub fn session(session_id: Uuid) -> Self {
        Self {
            session_id: Some(session_id),
            ..Default::default()
        }
    }

    pub fn job(job_id: Uuid, run_id: Uuid) -> Self {
        Self {
            job_id: Some(job_id),
            run_id: Some(run_id),
            ..Default::default()
        }
    }

    pub fn teammate(teammate_id: Uuid) -> Self {
        Self {
            teammate_id: Some(teammate_id),
            ..Default::default()
        }
    }
}

/// Lifecycle events flowing from every loop instance to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    ToolCall {
        tag: EventTag,
        tool_name: String,
        tool_call_id: String,
    },
    ToolResult {
        tag: EventTag,
        tool_call_id: String,
        is_error: bool,
    },
    Iteration {
        tag: EventTag,
        iteration: u32,
    },
    Error {
        tag: EventTag,
        error: String,
    },
    End {
        tag: EventTag,
        iterations: u32,
        tool_calls: u32,
    },
}

/// A broadcast-based event bus for system-wide pub/sub. Producers never
/// block: publishing with no subscribers is a no-op.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: Event) {
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}
