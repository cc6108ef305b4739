//! # Auto-reply runner
//!
//! Unattended agent loops triggered by inbound external-channel messages.
//! Resolves the model bound to the channel (global default as fallback),
//! resolves or lazily materializes the session keyed by (channel id, chat
//! id), and — when the channel supports it — streams partial output back
//! through a live-edited message, throttled to a minimum inter-update
//! interval with a trailing flush.
//!
//! A run is preempted at iteration boundaries: when a newer message for the
//! same conversation is waiting, the current run cancels itself early so the
//! next message is not starved behind a long-running turn.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent_loop::{AgentLoop, LoopConfig, LoopEvent};
use crate::approval::AutoApprove;
use crate::context::{ExecutionScope, ToolContext};
use crate::registry::ToolRegistry;
use crate::session::SessionManager;
use valet_channels::{Channel, IncomingMessage, StreamingReply};
use valet_config::AutoReplyConfig;
use valet_core::{EventBus, EventTag, Message, Result, Role, ValetError};
use valet_llm::LlmProvider;

/// (channel id, external chat id) — the conversation key.
type ConvKey = (String, String);

#[derive(Default)]
struct QueueState {
    /// Conversations with a run in flight.
    active: HashSet<ConvKey>,
    /// Messages that arrived while their conversation was busy.
    queued: HashMap<ConvKey, VecDeque<IncomingMessage>>,
}

pub struct AutoReplyRunner {
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    sessions: Arc<SessionManager>,
    base_config: LoopConfig,
    throttle: Duration,
    default_model: Option<String>,
    model_bindings: HashMap<String, String>,
    working_dir: PathBuf,
    state: parking_lot::Mutex<QueueState>,
    bus: EventBus,
}

impl AutoReplyRunner {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        sessions: Arc<SessionManager>,
        base_config: LoopConfig,
        autoreply: &AutoReplyConfig,
        working_dir: PathBuf,
        bus: EventBus,
    ) -> Self {
        Self {
            provider,
            registry,
            sessions,
            base_config,
            throttle: Duration::from_millis(autoreply.throttle_ms),
            default_model: autoreply.default_model.clone(),
            model_bindings: autoreply.model_bindings.clone(),
            working_dir,
            state: parking_lot::Mutex::new(QueueState::default()),
            bus,
        }
    }

    /// Resolve the model bound to a channel, falling back to the global
    /// default. A conversation with no resolvable model is a configuration
    /// error: it fails before any loop starts.
    fn resolve_model(&self, channel_id: &str) -> Result<String> {
        self.model_bindings
            .get(channel_id)
            .cloned()
            .or_else(|| self.default_model.clone())
            .or_else(|| Some(self.base_config.model.clone()).filter(|m| !m.is_empty()))
            .ok_or_else(|| {
                ValetError::Config(format!("no model bound for channel '{channel_id}'"))
            })
    }

    /// Number of messages waiting behind the active run of a conversation.
    fn queued_len(&self, key: &ConvKey) -> usize {
        self.state
            .lock()
            .queued
            .get(key)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Entry point for one inbound message. If the conversation is idle the
    /// run starts immediately; otherwise the message queues behind the
    /// active run and is picked up as soon as that run ends.
    pub async fn handle(&self, channel: Arc<dyn Channel>, msg: IncomingMessage) -> Result<()> {
        let key: ConvKey = (channel.id().to_string(), msg.chat_id.clone());
        {
            let mut state = self.state.lock();
            if state.active.contains(&key) {
                debug!(channel = %key.0, chat = %key.1, "conversation busy — queueing inbound message");
                state.queued.entry(key).or_default().push_back(msg);
                return Ok(());
            }
            state.active.insert(key.clone());
        }

        let mut next = Some(msg);
        while let Some(m) = next {
            if let Err(e) = self.process_one(&channel, m).await {
                warn!(channel = %key.0, chat = %key.1, error = %e, "auto-reply run failed");
            }
            next = {
                let mut state = self.state.lock();
                let n = state.queued.get_mut(&key).and_then(|q| q.pop_front());
                if n.is_none() {
                    state.active.remove(&key);
                    state.queued.remove(&key);
                }
                n
            };
        }
        Ok(())
    }

    async fn process_one(&self, channel: &Arc<dyn Channel>, msg: IncomingMessage) -> Result<()> {
        let key: ConvKey = (channel.id().to_string(), msg.chat_id.clone());
        let model = match self.resolve_model(&key.0) {
            Ok(model) => model,
            Err(e) => {
                // Nothing to run, but the sender still sees an outcome.
                let _ = channel
                    .send(&msg.chat_id, "This channel is not configured for replies.")
                    .await;
                return Err(e);
            }
        };

        let session_id = self.sessions.find_or_create(&key.0, &key.1).await;
        let run_lock = self.sessions.run_lock(session_id).await;
        let _run_guard = run_lock.lock().await;

        self.sessions
            .append(session_id, vec![Message::text(Role::User, msg.text.clone())])
            .await;
        let history = self.sessions.history(session_id).await;
        let history_len = history.len();

        let cancel = CancellationToken::new();
        let ctx = ToolContext::new(self.working_dir.clone())
            .with_session(session_id)
            .with_scope(ExecutionScope::Plugin {
                allowed_prefixes: vec![self.working_dir.clone()],
            })
            .with_channel(Arc::clone(channel), &key.1)
            .with_cancel(cancel.clone());

        let config = LoopConfig {
            model,
            ..self.base_config.clone()
        };
        let agent = Arc::new(
            AgentLoop::new(
                Arc::clone(&self.provider),
                Arc::clone(&self.registry),
                Arc::new(AutoApprove),
                config,
            )
            .with_observer(self.bus.clone(), EventTag::session(session_id)),
        );

        // Open the live-edit handle up front when the channel supports it.
        let mut stream: Option<Box<dyn StreamingReply>> = if channel.supports_streaming() {
            match channel.start_stream(&key.1, "…").await {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(channel = %key.0, error = %e, "could not open streaming reply — falling back to send");
                    None
                }
            }
        } else {
            None
        };

        let (mut rx, handle) = agent.spawn(history, ctx);

        // Throttled incremental delivery: text deltas and tool-argument
        // deltas both mark the reply dirty; an update goes out at most once
        // per throttle window, and the final state always goes out through
        // the finalize below.
        let mut text = String::new();
        let mut dirty = false;
        let mut last_update = Instant::now() - self.throttle;

        while let Some(event) = rx.recv().await {
            match event {
                LoopEvent::TextDelta { text: delta } => {
                    text.push_str(&delta);
                    dirty = true;
                }
                LoopEvent::ToolCallDelta { .. } => {
                    dirty = true;
                }
                LoopEvent::Iteration { .. } => {
                    // Iteration boundary: yield to a newer message instead of
                    // starving it behind this turn.
                    if self.queued_len(&key) > 0 {
                        info!(channel = %key.0, chat = %key.1, "newer inbound message waiting — cancelling run early");
                        cancel.cancel();
                    }
                }
                _ => {}
            }
            if dirty && last_update.elapsed() >= self.throttle {
                if let Some(s) = stream.as_mut() {
                    let _ = s.update(&text).await;
                }
                last_update = Instant::now();
                dirty = false;
            }
        }

        let outcome = handle
            .await
            .map_err(|e| ValetError::Agent(format!("auto-reply task join error: {e}")))?;

        // Finalize exactly once, synthesizing a fallback when the run
        // produced nothing (or died on a provider error).
        let (final_text, result) = match outcome {
            Ok(outcome) => {
                let final_text = if outcome.final_text.is_empty() {
                    "I wasn't able to produce a reply to that.".to_string()
                } else {
                    outcome.final_text.clone()
                };
                self.sessions
                    .append(
                        session_id,
                        outcome.messages.into_iter().skip(history_len).collect(),
                    )
                    .await;
                (final_text, Ok(()))
            }
            Err(e) => (
                format!("Something went wrong while handling this message: {e}"),
                Err(e),
            ),
        };

        match stream.take() {
            Some(s) => {
                s.finish(&final_text).await?;
            }
            None => {
                channel.send(&key.1, &final_text).await?;
            }
        }
        result
    }
}
