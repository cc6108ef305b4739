//! The agent loop — the iterative state machine interleaving model
//! streaming with tool execution.
//!
//! One loop instance drives one conversation-turn sequence: stream model
//! output into structured content blocks, execute requested tools through
//! the approval gate, append the paired results as a new user turn, and
//! repeat until the model stops calling tools or a limit/cancellation is
//! hit. Every runner in this crate — sub-agents, teammates, cron runs,
//! auto-reply runs — is this one mechanism under a different configuration.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::approval::ApprovalPolicy;
use crate::context::ToolContext;
use crate::registry::ToolRegistry;
use valet_core::{
    ContentBlock, Event, EventBus, EventTag, Message, Result, Role, TokenUsage, ToolCall,
    ToolResult, ValetError,
};
use valet_llm::{LlmProvider, LlmRequest, StopReason, StreamEvent, Usage};

/// Immutable configuration for one loop instance.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_iterations: u32,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl LoopConfig {
    pub fn from_agent_config(config: &valet_config::AgentConfig) -> Self {
        Self {
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            max_iterations: config.max_iterations,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }
}

/// One event of the loop's output sequence — lazy, finite, non-restartable.
#[derive(Debug, Clone)]
pub enum LoopEvent {
    MessageStart { iteration: u32 },
    TextDelta { text: String },
    ThinkingDelta { text: String },
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, fragment: String },
    ToolCallEnd { id: String },
    ToolCallResult { id: String, content: String, is_error: bool },
    /// Boundary after a turn's tool results were appended.
    Iteration { iteration: u32, tool_calls: u32 },
    Error { message: String },
    MessageEnd { usage: Usage, stop_reason: StopReason },
}

/// How the loop came to rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// The model produced a turn with no tool calls.
    Completed,
    MaxIterations,
    Cancelled,
}

/// Live progress, exposed through `AgentLoop::status`.
#[derive(Debug, Clone, Default)]
pub struct RunProgress {
    pub iteration: u32,
    pub tool_calls: u32,
    pub current_step: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunStatus {
    pub executing: bool,
    pub progress: RunProgress,
}

/// Consolidated result of one loop run.
#[derive(Debug)]
pub struct LoopOutcome {
    /// Full history including every appended turn.
    pub messages: Vec<Message>,
    /// Text of the final assistant turn.
    pub final_text: String,
    pub iterations: u32,
    pub tool_call_count: u32,
    pub usage: Usage,
    pub stop: LoopStop,
}

/// A content block under construction while the stream is open.
enum PendingBlock {
    Text(String),
    Thinking(String),
    Tool(ToolBuffer),
}

/// Accumulates a fragmented tool call until its end event (or the stream's
/// end, whichever comes first).
struct ToolBuffer {
    id: String,
    name: String,
    arguments: String,
    ended: bool,
}

impl ToolBuffer {
    /// Parse the accumulated argument JSON. An empty buffer means the tool
    /// takes no arguments; unparseable JSON is passed through raw so the
    /// handler fails locally instead of the loop dying.
    fn parse_arguments(&self) -> serde_json::Value {
        let raw = self.arguments.trim();
        if raw.is_empty() {
            return serde_json::json!({});
        }
        serde_json::from_str(raw).unwrap_or_else(|e| {
            warn!(tool = %self.name, error = %e, "tool call arguments did not parse");
            serde_json::json!({ "raw": raw })
        })
    }
}

/// One agent loop instance.
pub struct AgentLoop {
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    approval: Arc<dyn ApprovalPolicy>,
    config: LoopConfig,
    status: Arc<parking_lot::RwLock<RunStatus>>,
    observer: Option<(EventBus, EventTag)>,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        approval: Arc<dyn ApprovalPolicy>,
        config: LoopConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            approval,
            config,
            status: Arc::new(parking_lot::RwLock::new(RunStatus::default())),
            observer: None,
        }
    }

    /// Publish correlated lifecycle events to a bus for UI/log consumers.
    pub fn with_observer(mut self, bus: EventBus, tag: EventTag) -> Self {
        self.observer = Some((bus, tag));
        self
    }

    /// Run-status query surface.
    pub fn status(&self) -> RunStatus {
        self.status.read().clone()
    }

    /// Spawn the loop and hand back the event sequence plus the join handle
    /// carrying the consolidated outcome. Dropping the receiver is fine —
    /// the loop keeps running and event sends become no-ops.
    pub fn spawn(
        self: Arc<Self>,
        history: Vec<Message>,
        ctx: ToolContext,
    ) -> (
        mpsc::Receiver<LoopEvent>,
        tokio::task::JoinHandle<Result<LoopOutcome>>,
    ) {
        let (tx, rx) = mpsc::channel(256);
        let handle = tokio::spawn(async move { self.run(history, ctx, tx).await });
        (rx, handle)
    }

    fn publish(&self, event: Event) {
        if let Some((bus, _)) = &self.observer {
            bus.publish(event);
        }
    }

    fn tag(&self) -> EventTag {
        self.observer
            .as_ref()
            .map(|(_, tag)| tag.clone())
            .unwrap_or_default()
    }

    fn set_progress(&self, f: impl FnOnce(&mut RunStatus)) {
        f(&mut self.status.write());
    }

    /// Drive the loop to rest, emitting events into `tx`.
    ///
    /// Tool errors are local: they come back to the model as error-tagged
    /// results. Provider errors are terminal for this instance: the loop
    /// emits an `Error` event and returns `Err` without retrying.
    pub async fn run(
        &self,
        mut history: Vec<Message>,
        ctx: ToolContext,
        tx: mpsc::Sender<LoopEvent>,
    ) -> Result<LoopOutcome> {
        let tools = Arc::new(self.registry.definitions());
        let mut total_usage = Usage::default();
        let mut tool_call_count: u32 = 0;
        let mut final_text = String::new();
        let mut iterations: u32 = 0;
        let mut stop = LoopStop::MaxIterations;

        self.set_progress(|s| {
            s.executing = true;
            s.progress = RunProgress::default();
        });

        for iteration in 1..=self.config.max_iterations {
            if ctx.cancel.is_cancelled() {
                stop = LoopStop::Cancelled;
                break;
            }
            iterations = iteration;
            self.set_progress(|s| {
                s.progress.iteration = iteration;
                s.progress.current_step = "streaming".into();
            });
            let _ = tx.send(LoopEvent::MessageStart { iteration }).await;

            let request = LlmRequest {
                model: self.config.model.clone(),
                messages: history.clone(),
                tools: Arc::clone(&tools),
                system: self.config.system_prompt.clone(),
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
            };

            let mut stream = match self.provider.stream(&request, &ctx.cancel).await {
                Ok(rx) => rx,
                Err(e) => {
                    let _ = tx
                        .send(LoopEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                    self.publish(Event::Error {
                        tag: self.tag(),
                        error: e.to_string(),
                    });
                    self.set_progress(|s| s.executing = false);
                    return Err(e);
                }
            };

            // ── Accumulate the stream into content blocks, arrival order ──
            let mut blocks: Vec<PendingBlock> = Vec::new();
            let mut iter_usage = Usage::default();
            let mut stop_reason = StopReason::EndTurn;
            let mut stream_error: Option<String> = None;
            let mut cancelled_mid_stream = false;

            while let Some(event) = stream.recv().await {
                // Cancellation is checked before each yield: stop emitting,
                // keep what was already appended.
                if ctx.cancel.is_cancelled() {
                    cancelled_mid_stream = true;
                    break;
                }
                match event {
                    StreamEvent::TextDelta(text) => {
                        match blocks.last_mut() {
                            Some(PendingBlock::Text(buf)) => buf.push_str(&text),
                            _ => blocks.push(PendingBlock::Text(text.clone())),
                        }
                        let _ = tx.send(LoopEvent::TextDelta { text }).await;
                    }
                    StreamEvent::ThinkingDelta(text) => {
                        match blocks.last_mut() {
                            Some(PendingBlock::Thinking(buf)) => buf.push_str(&text),
                            _ => blocks.push(PendingBlock::Thinking(text.clone())),
                        }
                        let _ = tx.send(LoopEvent::ThinkingDelta { text }).await;
                    }
                    StreamEvent::ToolCallStart { id, name } => {
                        blocks.push(PendingBlock::Tool(ToolBuffer {
                            id: id.clone(),
                            name: name.clone(),
                            arguments: String::new(),
                            ended: false,
                        }));
                        let _ = tx.send(LoopEvent::ToolCallStart { id, name }).await;
                    }
                    StreamEvent::ToolCallDelta { id, fragment } => {
                        if let Some(buf) = find_tool_buffer(&mut blocks, &id) {
                            buf.arguments.push_str(&fragment);
                        }
                        let _ = tx.send(LoopEvent::ToolCallDelta { id, fragment }).await;
                    }
                    StreamEvent::ToolCallEnd { id } => {
                        if let Some(buf) = find_tool_buffer(&mut blocks, &id) {
                            buf.ended = true;
                        }
                        let _ = tx.send(LoopEvent::ToolCallEnd { id }).await;
                    }
                    StreamEvent::Usage(usage) => iter_usage.merge(&usage),
                    StreamEvent::Done(reason) => {
                        stop_reason = reason;
                        break;
                    }
                    StreamEvent::Error(e) => {
                        stream_error = Some(e);
                        break;
                    }
                }
            }

            if let Some(e) = stream_error {
                let _ = tx.send(LoopEvent::Error { message: e.clone() }).await;
                self.publish(Event::Error {
                    tag: self.tag(),
                    error: e.clone(),
                });
                self.set_progress(|s| s.executing = false);
                return Err(ValetError::Provider(e));
            }

            // Defensive completion: close argument buffers that never got an
            // explicit end event before the stream finished.
            for block in blocks.iter_mut() {
                if let PendingBlock::Tool(buf) = block {
                    if !buf.ended {
                        debug!(tool = %buf.name, id = %buf.id, "finalizing unterminated tool call buffer");
                        buf.ended = true;
                        let _ = tx
                            .send(LoopEvent::ToolCallEnd {
                                id: buf.id.clone(),
                            })
                            .await;
                    }
                }
            }

            // ── Build and append the assistant message ─────────────────
            let mut pending_calls: Vec<ToolCall> = Vec::new();
            let mut turn_text = String::new();
            let content: Vec<ContentBlock> = blocks
                .into_iter()
                .map(|block| match block {
                    PendingBlock::Text(text) => {
                        if !turn_text.is_empty() {
                            turn_text.push('\n');
                        }
                        turn_text.push_str(&text);
                        ContentBlock::Text { text }
                    }
                    PendingBlock::Thinking(text) => ContentBlock::Thinking { text },
                    PendingBlock::Tool(buf) => {
                        let input = buf.parse_arguments();
                        pending_calls.push(ToolCall {
                            id: buf.id.clone(),
                            name: buf.name.clone(),
                            arguments: input.clone(),
                        });
                        ContentBlock::ToolUse {
                            id: buf.id,
                            name: buf.name,
                            input,
                        }
                    }
                })
                .collect();

            if !content.is_empty() {
                let mut msg = Message::with_blocks(Role::Assistant, content);
                msg.usage = Some(TokenUsage {
                    input_tokens: iter_usage.input_tokens,
                    output_tokens: iter_usage.output_tokens,
                });
                history.push(msg);
            }
            if !turn_text.is_empty() {
                final_text = turn_text;
            }
            total_usage.merge(&iter_usage);
            let _ = tx
                .send(LoopEvent::MessageEnd {
                    usage: iter_usage,
                    stop_reason,
                })
                .await;

            if cancelled_mid_stream && pending_calls.is_empty() {
                stop = LoopStop::Cancelled;
                break;
            }
            if pending_calls.is_empty() {
                stop = LoopStop::Completed;
                break;
            }

            // ── Execute this turn's tool calls ─────────────────────────
            // Each call resolves independently; a failed or denied call
            // still yields exactly one paired result and never blocks its
            // siblings.
            let mut results: Vec<ContentBlock> = Vec::with_capacity(pending_calls.len());
            for call in &pending_calls {
                if ctx.cancel.is_cancelled() {
                    // Keep the pairing invariant intact in the partial
                    // history: every tool_use gets its tool_result.
                    results.push(ContentBlock::ToolResult {
                        tool_use_id: call.id.clone(),
                        content: "Execution cancelled".into(),
                        is_error: true,
                    });
                    continue;
                }
                self.set_progress(|s| {
                    s.progress.current_step = format!("tool:{}", call.name);
                });
                self.publish(Event::ToolCall {
                    tag: self.tag(),
                    tool_name: call.name.clone(),
                    tool_call_id: call.id.clone(),
                });

                let result = self.execute_one(call, &ctx).await;
                tool_call_count += 1;
                self.set_progress(|s| s.progress.tool_calls = tool_call_count);

                let _ = tx
                    .send(LoopEvent::ToolCallResult {
                        id: call.id.clone(),
                        content: result.content.clone(),
                        is_error: result.is_error,
                    })
                    .await;
                self.publish(Event::ToolResult {
                    tag: self.tag(),
                    tool_call_id: call.id.clone(),
                    is_error: result.is_error,
                });
                results.push(ContentBlock::ToolResult {
                    tool_use_id: call.id.clone(),
                    content: result.content,
                    is_error: result.is_error,
                });
            }

            history.push(Message::tool_results(results));
            let _ = tx
                .send(LoopEvent::Iteration {
                    iteration,
                    tool_calls: pending_calls.len() as u32,
                })
                .await;
            self.publish(Event::Iteration {
                tag: self.tag(),
                iteration,
            });

            if ctx.cancel.is_cancelled() {
                stop = LoopStop::Cancelled;
                break;
            }
        }

        if stop == LoopStop::MaxIterations {
            warn!(max = self.config.max_iterations, "max loop iterations reached");
        }
        self.set_progress(|s| {
            s.executing = false;
            s.progress.current_step = "idle".into();
        });
        self.publish(Event::End {
            tag: self.tag(),
            iterations,
            tool_calls: tool_call_count,
        });

        Ok(LoopOutcome {
            messages: history,
            final_text,
            iterations,
            tool_call_count,
            usage: total_usage,
            stop,
        })
    }

    /// Resolve approval and execute one call. Never returns `Err`: tool
    /// failures become error-tagged results, denials become successful
    /// no-op results carrying the denial reason.
    async fn execute_one(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let Some(handler) = self.registry.get(&call.name) else {
            return ToolResult::error(&call.id, format!("tool not found: {}", call.name));
        };

        if handler.requires_approval(&call.arguments, ctx)
            && !self.approval.approve(call).await
        {
            info!(tool = %call.name, "tool call denied by approval policy");
            return ToolResult::ok(
                &call.id,
                format!("Denied: the approval policy rejected this {} call", call.name),
            );
        }

        match handler.execute(call, ctx).await {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = %call.name, error = %e, "tool execution failed");
                ToolResult::error(&call.id, e.to_string())
            }
        }
    }
}

fn find_tool_buffer<'a>(blocks: &'a mut [PendingBlock], id: &str) -> Option<&'a mut ToolBuffer> {
    blocks.iter_mut().rev().find_map(|b| match b {
        PendingBlock::Tool(buf) if buf.id == id => Some(buf),
        _ => None,
    })
}
