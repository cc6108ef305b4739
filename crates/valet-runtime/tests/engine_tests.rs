//! Behavior tests for the agent execution engine, driven end to end by the
//! mock provider and mock channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use valet_channels::{Channel, IncomingMessage, MockChannel};
use valet_config::AutoReplyConfig;
use valet_core::{ContentBlock, EventBus, Message, Role, Tool, ToolCall, ToolResult};
use valet_llm::{MockProvider, MockTurn};
use valet_runtime::*;

fn loop_config(max_iterations: u32) -> LoopConfig {
    LoopConfig {
        model: "mock/test-model".into(),
        system_prompt: None,
        max_iterations,
        max_tokens: 1024,
        temperature: 0.7,
    }
}

fn builtin_registry() -> Arc<ToolRegistry> {
    let registry = ToolRegistry::new();
    register_builtins(&registry);
    Arc::new(registry)
}

/// A tool that sleeps, honoring the run's cancellation token.
struct SlowTool {
    millis: u64,
}

#[async_trait]
impl ToolHandler for SlowTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "slow".into(),
            description: "Wait a while".into(),
            parameters: json!({ "type": "object", "properties": {} }),
            read_only: true,
        }
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> valet_core::Result<ToolResult> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(self.millis)) => {
                Ok(ToolResult::ok(&call.id, "waited"))
            }
            _ = ctx.cancel.cancelled() => {
                Ok(ToolResult::error(&call.id, "cancelled during execution"))
            }
        }
    }
}

async fn run_to_completion(
    agent: Arc<AgentLoop>,
    history: Vec<Message>,
    ctx: ToolContext,
) -> (Vec<LoopEvent>, valet_core::Result<LoopOutcome>) {
    let (mut rx, handle) = agent.spawn(history, ctx);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (events, handle.await.unwrap())
}

/// Every tool_use block must be answered by exactly one tool_result block in
/// the next user-role message.
fn assert_pairing(messages: &[Message]) {
    for (i, msg) in messages.iter().enumerate() {
        if msg.role == Role::Assistant && !msg.tool_uses().is_empty() {
            let next = messages
                .get(i + 1)
                .expect("assistant tool_use turn must be followed by a result turn");
            assert_eq!(next.role, Role::User);
            assert!(
                msg.unanswered_tool_uses(next).is_empty(),
                "unanswered tool_use blocks at message {i}"
            );
            let result_count = next
                .content
                .iter()
                .filter(|b| matches!(b, ContentBlock::ToolResult { .. }))
                .count();
            assert_eq!(result_count, msg.tool_uses().len());
        }
    }
}

// ── Agent loop ─────────────────────────────────────────────────

#[tokio::test]
async fn test_tool_use_and_results_pair_up() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "contents").unwrap();

    let provider = Arc::new(
        MockProvider::new()
            .with_tool_calls(vec![
                ("tc_1", "file_read", json!({"path": "a.txt"})),
                ("tc_2", "no_such_tool", json!({})),
            ])
            .with_response("done"),
    );
    let agent = Arc::new(AgentLoop::new(
        provider,
        builtin_registry(),
        Arc::new(AutoApprove),
        loop_config(5),
    ));
    let ctx = ToolContext::new(dir.path());
    let history = vec![Message::text(Role::User, "read the file")];

    let (events, outcome) = run_to_completion(agent, history, ctx).await;
    let outcome = outcome.unwrap();

    assert_eq!(outcome.stop, LoopStop::Completed);
    assert_eq!(outcome.tool_call_count, 2);
    assert_pairing(&outcome.messages);

    // The unknown tool failed locally without blocking its sibling.
    let results: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            LoopEvent::ToolCallResult { id, is_error, .. } => Some((id.clone(), *is_error)),
            _ => None,
        })
        .collect();
    assert_eq!(results.len(), 2);
    assert!(results.contains(&("tc_1".into(), false)));
    assert!(results.contains(&("tc_2".into(), true)));
    assert_eq!(outcome.final_text.trim(), "done");
}

#[tokio::test]
async fn test_denied_call_is_nonfatal_and_siblings_run() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "contents").unwrap();

    let provider = Arc::new(
        MockProvider::new()
            .with_tool_calls(vec![
                ("tc_w", "file_write", json!({"path": "/outside/x.txt", "content": "x"})),
                ("tc_r", "file_read", json!({"path": "a.txt"})),
            ])
            .with_response("finished"),
    );
    let agent = Arc::new(AgentLoop::new(
        provider,
        builtin_registry(),
        Arc::new(DenyAll),
        loop_config(5),
    ));
    let ctx = ToolContext::new(dir.path()).with_sandbox(dir.path());

    let (events, outcome) =
        run_to_completion(agent, vec![Message::text(Role::User, "go")], ctx).await;
    let outcome = outcome.unwrap();

    assert_eq!(outcome.stop, LoopStop::Completed);
    assert_pairing(&outcome.messages);
    assert!(!std::path::Path::new("/outside/x.txt").exists());

    // Denial is a successful no-op result carrying the reason, not an error.
    let denied = events
        .iter()
        .find_map(|e| match e {
            LoopEvent::ToolCallResult { id, content, is_error } if id == "tc_w" => {
                Some((content.clone(), *is_error))
            }
            _ => None,
        })
        .unwrap();
    assert!(denied.0.contains("Denied"));
    assert!(!denied.1);

    let read = events
        .iter()
        .find_map(|e| match e {
            LoopEvent::ToolCallResult { id, is_error, .. } if id == "tc_r" => Some(*is_error),
            _ => None,
        })
        .unwrap();
    assert!(!read);
}

#[tokio::test]
async fn test_unterminated_tool_buffer_is_defensively_completed() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "contents").unwrap();

    let provider = Arc::new(
        MockProvider::new()
            .with_unterminated_tool_call("tc_1", "file_read", json!({"path": "a.txt"}))
            .with_response("done"),
    );
    let agent = Arc::new(AgentLoop::new(
        provider,
        builtin_registry(),
        Arc::new(AutoApprove),
        loop_config(5),
    ));

    let (events, outcome) = run_to_completion(
        agent,
        vec![Message::text(Role::User, "go")],
        ToolContext::new(dir.path()),
    )
    .await;
    let outcome = outcome.unwrap();

    // The loop synthesized the missing end event and still executed the call.
    assert!(
        events
            .iter()
            .any(|e| matches!(e, LoopEvent::ToolCallEnd { id } if id == "tc_1"))
    );
    assert_eq!(outcome.tool_call_count, 1);
    assert_eq!(outcome.stop, LoopStop::Completed);
    assert_pairing(&outcome.messages);
}

#[tokio::test]
async fn test_provider_error_is_terminal_and_not_retried() {
    let provider = Arc::new(MockProvider::new().with_error("HTTP 529: overloaded"));
    let requests = Arc::clone(&provider.requests);
    let agent = Arc::new(AgentLoop::new(
        provider,
        builtin_registry(),
        Arc::new(AutoApprove),
        loop_config(5),
    ));

    let (events, outcome) = run_to_completion(
        agent,
        vec![Message::text(Role::User, "go")],
        ToolContext::new("/tmp"),
    )
    .await;

    assert!(outcome.is_err());
    assert!(events.iter().any(|e| matches!(e, LoopEvent::Error { .. })));
    // Exactly one provider call: the engine never self-retries.
    assert_eq!(requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_max_iterations_bounds_the_loop() {
    let provider = Arc::new(
        MockProvider::new()
            .with_tool_call("tc_1", "slow", json!({}))
            .with_tool_call("tc_2", "slow", json!({}))
            .with_tool_call("tc_3", "slow", json!({})),
    );
    let registry = ToolRegistry::new();
    registry.register(Arc::new(SlowTool { millis: 1 }));
    let agent = Arc::new(AgentLoop::new(
        provider,
        Arc::new(registry),
        Arc::new(AutoApprove),
        loop_config(2),
    ));

    let (_, outcome) = run_to_completion(
        agent,
        vec![Message::text(Role::User, "go")],
        ToolContext::new("/tmp"),
    )
    .await;
    let outcome = outcome.unwrap();
    assert_eq!(outcome.stop, LoopStop::MaxIterations);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.tool_call_count, 2);
    assert_pairing(&outcome.messages);
}

#[tokio::test]
async fn test_cancellation_halts_emission_and_leaves_valid_history() {
    let provider = Arc::new(
        MockProvider::new()
            .with_tool_call("tc_1", "slow", json!({}))
            .with_response("this text must never stream"),
    );
    let registry = ToolRegistry::new();
    registry.register(Arc::new(SlowTool { millis: 200 }));
    let agent = Arc::new(AgentLoop::new(
        provider,
        Arc::new(registry),
        Arc::new(AutoApprove),
        loop_config(5),
    ));

    let cancel = CancellationToken::new();
    let ctx = ToolContext::new("/tmp").with_cancel(cancel.clone());
    let (mut rx, handle) = agent.spawn(vec![Message::text(Role::User, "go")], ctx);

    // Cancel while the tool is executing.
    tokio::time::sleep(Duration::from_millis(40)).await;
    cancel.cancel();

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    let outcome = handle.await.unwrap().unwrap();

    assert_eq!(outcome.stop, LoopStop::Cancelled);
    // No text from the second turn was ever emitted.
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, LoopEvent::TextDelta { .. }))
    );
    // The cancelled tool call still got its paired result: partial history
    // is structurally valid, nothing was rolled back.
    assert_pairing(&outcome.messages);
    let last = outcome.messages.last().unwrap();
    assert!(matches!(
        last.content[0],
        ContentBlock::ToolResult { is_error: true, .. }
    ));
}

#[tokio::test]
async fn test_status_surface_reports_idle_after_run() {
    let provider = Arc::new(MockProvider::new().with_response("hi"));
    let agent = Arc::new(AgentLoop::new(
        provider,
        builtin_registry(),
        Arc::new(AutoApprove),
        loop_config(5),
    ));
    let (_, outcome) = run_to_completion(
        Arc::clone(&agent),
        vec![Message::text(Role::User, "hello")],
        ToolContext::new("/tmp"),
    )
    .await;
    outcome.unwrap();

    let status = agent.status();
    assert!(!status.executing);
    assert_eq!(status.progress.iteration, 1);
}

// ── Delivery guard ─────────────────────────────────────────────

#[tokio::test]
async fn test_exactly_one_delivery_within_one_iteration() {
    let channel = Arc::new(MockChannel::new("mock"));
    let provider = Arc::new(
        MockProvider::new()
            .with_tool_calls(vec![
                ("tc_1", "notify", json!({"body": "first"})),
                ("tc_2", "notify", json!({"body": "second"})),
                ("tc_3", "channel_send", json!({"text": "third"})),
            ])
            .with_response("delivered"),
    );
    let agent = Arc::new(AgentLoop::new(
        provider,
        builtin_registry(),
        Arc::new(AutoApprove),
        loop_config(5),
    ));
    let ctx = ToolContext::new("/tmp")
        .with_scope(ExecutionScope::Unattended)
        .with_channel(channel.clone(), "chat-1");

    let (events, outcome) =
        run_to_completion(agent, vec![Message::text(Role::User, "go")], ctx).await;
    outcome.unwrap();

    // One outbound message; the two later attempts were skipped no-ops.
    assert_eq!(channel.sent_count(), 1);
    assert_eq!(channel.sent()[0].text, "first");

    let skipped: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            LoopEvent::ToolCallResult { content, .. } if content.contains("skipped") => Some(()),
            _ => None,
        })
        .collect();
    assert_eq!(skipped.len(), 2);
}

// ── Sub-agents ─────────────────────────────────────────────────

#[tokio::test]
async fn test_code_search_sub_agent_never_prompts() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("auth.rs"), "fn check_auth() {}").unwrap();

    let provider = Arc::new(
        MockProvider::new()
            .with_tool_call("tc_1", "file_grep", json!({"pattern": "auth"}))
            .with_response("auth logic lives in auth.rs"),
    );
    let runner = SubAgentRunner::new(
        provider,
        builtin_registry(),
        Arc::new(SubAgentRegistry::with_default_profiles()),
        loop_config(10),
        2,
    );
    let host = Arc::new(RecordingPolicy::approving());
    let ctx = ToolContext::new(dir.path());

    let result = runner
        .run("CodeSearch", &json!({"query": "find auth logic"}), host.clone(), &ctx)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.tool_call_count, 1);
    assert_eq!(result.iterations, 2);
    assert!(result.output.contains("auth.rs"));
    // Read-only tools never reached the host's approval callback.
    assert!(host.seen_tools().is_empty());
}

#[tokio::test]
async fn test_sub_agent_write_bubbles_to_host() {
    let dir = tempfile::tempdir().unwrap();

    let provider = Arc::new(
        MockProvider::new()
            .with_tool_call(
                "tc_1",
                "file_write",
                json!({"path": "report.md", "content": "# findings"}),
            )
            .with_response("wrote the report"),
    );
    let profiles = SubAgentRegistry::with_default_profiles();
    profiles.register(SubAgentProfile {
        name: "Writer".into(),
        allowed_tools: vec!["file_read".into(), "file_write".into()],
        max_iterations: 5,
        system_prompt: "Write the requested file.".into(),
        model: None,
        temperature: None,
    });
    let runner = SubAgentRunner::new(
        provider,
        builtin_registry(),
        Arc::new(profiles),
        loop_config(10),
        2,
    );
    let host = Arc::new(RecordingPolicy::approving());
    // No sandbox: every write needs the gate, so the bubble is observable.
    let ctx = ToolContext::new(dir.path());

    let result = runner
        .run("Writer", &json!({"task": "write the report"}), host.clone(), &ctx)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(host.seen_tools(), vec!["file_write"]);
    assert!(dir.path().join("report.md").exists());
}

#[tokio::test]
async fn test_parent_loop_delegates_through_the_sub_agent_tool() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("auth.rs"), "fn check_auth() {}").unwrap();

    // Turn order across both loops: the parent requests the delegation, the
    // nested loop consumes the next two turns, then the parent wraps up.
    let provider = Arc::new(
        MockProvider::new()
            .with_tool_call(
                "tc_p",
                "sub_agent",
                json!({"profile": "CodeSearch", "query": "find auth logic"}),
            )
            .with_tool_call("tc_n", "file_grep", json!({"pattern": "auth"}))
            .with_response("auth logic lives in auth.rs")
            .with_response("delegation finished"),
    );
    let registry = builtin_registry();
    let runner = Arc::new(SubAgentRunner::new(
        Arc::clone(&provider) as Arc<dyn valet_llm::LlmProvider>,
        Arc::clone(&registry),
        Arc::new(SubAgentRegistry::with_default_profiles()),
        loop_config(10),
        2,
    ));
    let host = Arc::new(RecordingPolicy::approving());
    registry.register(Arc::new(SubAgentTool::new(runner, host.clone())));

    let agent = Arc::new(AgentLoop::new(
        provider,
        registry,
        Arc::new(AutoApprove),
        loop_config(10),
    ));
    let (_, outcome) = run_to_completion(
        agent,
        vec![Message::text(Role::User, "look into auth")],
        ToolContext::new(dir.path()),
    )
    .await;
    let outcome = outcome.unwrap();

    assert_eq!(outcome.final_text.trim(), "delegation finished");
    assert_pairing(&outcome.messages);
    // The nested run's consolidated result came back as the tool result.
    let result_turn = &outcome.messages[2];
    match &result_turn.content[0] {
        ContentBlock::ToolResult { content, is_error, .. } => {
            assert!(!is_error);
            assert!(content.contains("auth.rs"));
        }
        other => panic!("expected tool result, got {other:?}"),
    }
    // Read-only delegation never consulted the host policy.
    assert!(host.seen_tools().is_empty());
}

#[tokio::test]
async fn test_sub_agent_depth_guard() {
    let provider = Arc::new(MockProvider::new());
    let runner = SubAgentRunner::new(
        provider,
        builtin_registry(),
        Arc::new(SubAgentRegistry::with_default_profiles()),
        loop_config(10),
        2,
    );
    let ctx = ToolContext::new("/tmp").child().child();
    assert_eq!(ctx.depth, 2);

    let result = runner
        .run(
            "CodeSearch",
            &json!({"query": "anything"}),
            Arc::new(AutoApprove),
            &ctx,
        )
        .await;
    assert!(result.is_err());
}

// ── Teams ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_teammates_work_the_board_in_parallel() {
    let board = Arc::new(TaskBoard::new());
    let t1 = board.add_task("greet", "say hello", vec![]);
    let t2 = board.add_task("farewell", "say goodbye", vec![]);

    let provider = Arc::new(
        MockProvider::new()
            .with_response("hello")
            .with_response("goodbye"),
    );
    let runner = TeamRunner::new(
        Arc::clone(&board),
        provider,
        builtin_registry(),
        Arc::new(AutoApprove),
        loop_config(5),
        EventBus::default(),
    );
    let ctx = ToolContext::new("/tmp");
    let a = runner.spawn_teammate("alpha", &ctx);
    let b = runner.spawn_teammate("beta", &ctx);
    runner.join().await;

    for id in [t1, t2] {
        let task = board.task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.owner == Some(a) || task.owner == Some(b));
    }
    for id in [a, b] {
        assert_eq!(board.member(id).unwrap().status, TeammateStatus::Completed);
    }
}

#[tokio::test]
async fn test_failed_teammate_releases_its_task() {
    let board = Arc::new(TaskBoard::new());
    let task_id = board.add_task("doomed", "this will fail", vec![]);

    let provider = Arc::new(MockProvider::new().with_turn(MockTurn {
        connect_error: Some("provider down".into()),
        ..Default::default()
    }));
    let runner = TeamRunner::new(
        Arc::clone(&board),
        provider,
        builtin_registry(),
        Arc::new(AutoApprove),
        loop_config(5),
        EventBus::default(),
    );
    let member = runner.spawn_teammate("unlucky", &ToolContext::new("/tmp"));
    runner.join().await;

    let task = board.task(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.owner.is_none());
    assert_eq!(board.member(member).unwrap().status, TeammateStatus::Failed);
}

// ── Cron runner ────────────────────────────────────────────────

struct CronHarness {
    runner: Arc<CronAgentRunner>,
    store: Arc<CronStore>,
    channel: Arc<MockChannel>,
    notifier: Arc<RecordingNotifier>,
}

fn cron_harness(provider: Arc<MockProvider>) -> CronHarness {
    let store = Arc::new(CronStore::new());
    let registry = ToolRegistry::new();
    register_builtins(&registry);
    registry.register(Arc::new(SlowTool { millis: 150 }));
    let profiles = SubAgentRegistry::new();
    profiles.register(SubAgentProfile {
        name: "jobs".into(),
        allowed_tools: vec![
            "file_read".into(),
            "notify".into(),
            "channel_send".into(),
            "slow".into(),
        ],
        max_iterations: 8,
        system_prompt: "Do the scheduled task and deliver one result.".into(),
        model: None,
        temperature: None,
    });
    let channel = Arc::new(MockChannel::new("mock"));
    let notifier = Arc::new(RecordingNotifier::default());
    let runner = Arc::new(CronAgentRunner::new(
        Arc::clone(&store),
        provider,
        Arc::new(registry),
        Arc::new(profiles),
        "jobs",
        loop_config(8),
        std::env::temp_dir(),
        notifier.clone(),
        EventBus::default(),
    ));
    runner.register_channel(channel.clone());
    CronHarness {
        runner,
        store,
        channel,
        notifier,
    }
}

#[tokio::test]
async fn test_weather_job_delivers_once_with_correlated_events() {
    let provider = Arc::new(
        MockProvider::new()
            .with_tool_call("tc_1", "notify", json!({"body": "Sunny, 24°C"}))
            .with_response("Sent the weather."),
    );
    let h = cron_harness(provider);
    let job_id = h
        .store
        .add_job(
            "job-42",
            "0 0 8 * * *",
            "send today's weather",
            None,
            DeliveryTarget::Channel {
                channel_id: "mock".into(),
                chat_id: "chat-7".into(),
            },
        )
        .unwrap();

    let mut events = h.runner.subscribe();
    let run_id = h.runner.trigger(job_id).await.unwrap().unwrap();

    // Exactly one run, successful, with the delivery redirected to the channel.
    let runs = h.store.runs_for_job(job_id);
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, run_id);
    assert_eq!(runs[0].status, CronRunStatus::Success);
    assert_eq!(runs[0].tool_call_count, 1);
    assert!(runs[0].output_summary.contains("weather"));
    assert_eq!(h.channel.sent_count(), 1);
    assert_eq!(h.channel.sent()[0].text, "Sunny, 24°C");
    assert!(h.notifier.notifications.lock().is_empty());

    // Lifecycle events carry matching job/run ids.
    match events.try_recv().unwrap() {
        CronEvent::Started { job_id: j, run_id: r } => {
            assert_eq!((j, r), (job_id, run_id));
        }
        other => panic!("expected Started, got {other:?}"),
    }
    let mut finished = None;
    while let Ok(event) = events.try_recv() {
        if let CronEvent::Finished { job_id: j, run_id: r, status } = event {
            finished = Some((j, r, status));
        }
    }
    assert_eq!(finished, Some((job_id, run_id, CronRunStatus::Success)));
}

#[tokio::test]
async fn test_duplicate_trigger_is_dropped_without_a_run() {
    let provider = Arc::new(
        MockProvider::new()
            .with_tool_call("tc_1", "slow", json!({}))
            .with_response("done after waiting"),
    );
    let h = cron_harness(provider);
    let job_id = h
        .store
        .add_job(
            "job-42",
            "0 0 8 * * *",
            "long job",
            None,
            DeliveryTarget::Notify,
        )
        .unwrap();

    let runner = Arc::clone(&h.runner);
    let first = tokio::spawn(async move { runner.trigger(job_id).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Second trigger while the first run is mid-flight: dropped, no record.
    assert!(h.runner.is_running(job_id));
    let second = h.runner.trigger(job_id).await.unwrap();
    assert!(second.is_none());

    let first = first.await.unwrap().unwrap();
    assert!(first.is_some());
    assert_eq!(h.store.runs_for_job(job_id).len(), 1);
    assert!(!h.runner.is_running(job_id));
}

#[tokio::test]
async fn test_failed_run_still_ends_in_observable_delivery() {
    let provider = Arc::new(MockProvider::new().with_error("HTTP 500"));
    let h = cron_harness(provider);
    let job_id = h
        .store
        .add_job(
            "nightly",
            "0 0 3 * * *",
            "do things",
            None,
            DeliveryTarget::Notify,
        )
        .unwrap();

    let run_id = h.runner.trigger(job_id).await.unwrap().unwrap();
    let run = h.store.run(run_id).unwrap();
    assert_eq!(run.status, CronRunStatus::Error);
    assert!(run.error.as_deref().unwrap().contains("HTTP 500"));
    assert!(run.finished_at.is_some());

    let notifications = h.notifier.notifications.lock();
    assert_eq!(notifications.len(), 1);
    assert!(notifications[0].1.contains("failed"));
}

#[tokio::test]
async fn test_run_with_no_agent_delivery_gets_end_of_run_delivery() {
    let provider = Arc::new(MockProvider::new().with_response("quiet result"));
    let h = cron_harness(provider);
    let job_id = h
        .store
        .add_job("quiet", "0 0 8 * * *", "p", None, DeliveryTarget::Notify)
        .unwrap();

    h.runner.trigger(job_id).await.unwrap().unwrap();
    let notifications = h.notifier.notifications.lock();
    assert_eq!(notifications.len(), 1);
    assert!(notifications[0].1.contains("quiet result"));
}

#[tokio::test]
async fn test_scheduler_fires_due_jobs() {
    let provider = Arc::new(MockProvider::new().with_response("tick"));
    let h = cron_harness(provider);
    let job_id = h
        .store
        .add_job(
            "every-second",
            "* * * * * *",
            "do the rounds",
            None,
            DeliveryTarget::Notify,
        )
        .unwrap();

    let cancel = CancellationToken::new();
    let scheduler = tokio::spawn(run_scheduler(
        Arc::clone(&h.runner),
        Duration::from_millis(50),
        cancel.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(1500)).await;
    cancel.cancel();
    let _ = scheduler.await;

    assert!(!h.store.runs_for_job(job_id).is_empty());
}

// ── Auto-reply runner ──────────────────────────────────────────

fn incoming(channel: &str, chat: &str, text: &str) -> IncomingMessage {
    IncomingMessage {
        id: uuid::Uuid::new_v4().to_string(),
        channel: channel.to_string(),
        chat_id: chat.to_string(),
        sender: "user-1".to_string(),
        text: text.to_string(),
        received_at: chrono::Utc::now(),
    }
}

fn autoreply_runner(
    provider: Arc<MockProvider>,
    registry: Arc<ToolRegistry>,
    throttle_ms: u64,
) -> (AutoReplyRunner, Arc<SessionManager>) {
    let sessions = Arc::new(SessionManager::new());
    let config = AutoReplyConfig {
        throttle_ms,
        default_model: Some("mock/test-model".into()),
        model_bindings: Default::default(),
    };
    let runner = AutoReplyRunner::new(
        provider,
        registry,
        Arc::clone(&sessions),
        loop_config(5),
        &config,
        std::env::temp_dir(),
        EventBus::default(),
    );
    (runner, sessions)
}

#[tokio::test]
async fn test_streaming_reply_is_throttled_and_finalized_once() {
    let words = (0..30).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
    let provider = Arc::new(MockProvider::new().with_turn(MockTurn {
        word_delay_ms: 10,
        ..MockTurn::text(&words)
    }));
    let (runner, _) = autoreply_runner(provider, builtin_registry(), 50);
    let channel = Arc::new(MockChannel::new("mock").with_streaming());

    runner
        .handle(channel.clone(), incoming("mock", "chat-1", "talk to me"))
        .await
        .unwrap();

    let streams = channel.streams();
    assert_eq!(streams.len(), 1);
    let record = &streams[0];

    // Exactly one finalize, carrying the trailing flush of the full text.
    assert_eq!(record.finish_count, 1);
    let final_text = record.finished_with.as_deref().unwrap();
    assert!(final_text.contains("w0") && final_text.contains("w29"));

    // Updates never violate the throttle floor (first entry is the opening
    // placeholder written by start_stream).
    assert!(record.updates.len() >= 3);
    for pair in record.updates[1..].windows(2) {
        let gap = pair[1].0.duration_since(pair[0].0);
        assert!(
            gap >= Duration::from_millis(40),
            "updates {gap:?} apart violate the throttle"
        );
    }
}

#[tokio::test]
async fn test_non_streaming_channel_gets_single_send() {
    let provider = Arc::new(MockProvider::new().with_response("plain reply"));
    let (runner, sessions) = autoreply_runner(provider, builtin_registry(), 50);
    let channel = Arc::new(MockChannel::new("mock"));

    runner
        .handle(channel.clone(), incoming("mock", "chat-1", "hi"))
        .await
        .unwrap();

    assert_eq!(channel.sent_count(), 1);
    assert!(channel.sent()[0].text.contains("plain reply"));

    // The session was lazily materialized under (channel id, chat id) and
    // holds the appended turns.
    let session_id = sessions.find_or_create("mock", "chat-1").await;
    let history = sessions.history(session_id).await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].role, Role::Assistant);
}

#[tokio::test]
async fn test_queued_message_preempts_long_run() {
    let provider = Arc::new(
        MockProvider::new()
            // First run: a tool turn creates an iteration boundary where the
            // preemption check fires; the follow-up turn streams slowly and
            // gets cut short when the check cancels the run.
            .with_tool_call("tc_1", "slow", json!({}))
            .with_turn(MockTurn {
                word_delay_ms: 10,
                ..MockTurn::text("first reply that keeps going on and on and on and on")
            })
            .with_response("second reply"),
    );
    let registry = ToolRegistry::new();
    register_builtins(&registry);
    registry.register(Arc::new(SlowTool { millis: 120 }));
    let (runner, _) = autoreply_runner(provider, Arc::new(registry), 20);
    let runner = Arc::new(runner);
    let channel = Arc::new(MockChannel::new("mock"));

    let r = Arc::clone(&runner);
    let c = Arc::clone(&channel);
    let first = tokio::spawn(async move {
        r.handle(c, incoming("mock", "chat-1", "first")).await
    });
    tokio::time::sleep(Duration::from_millis(40)).await;
    // Arrives mid-run: queued, then picked up after the first run cancels
    // itself at the next iteration boundary.
    runner
        .handle(channel.clone(), incoming("mock", "chat-1", "second"))
        .await
        .unwrap();
    first.await.unwrap().unwrap();

    // Both messages produced a reply; nothing was starved.
    assert_eq!(channel.sent_count(), 2);
    assert!(channel.sent()[1].text.contains("second reply"));
}

#[tokio::test]
async fn test_unconfigured_channel_fails_fast_but_visibly() {
    let provider = Arc::new(MockProvider::new());
    let sessions = Arc::new(SessionManager::new());
    let config = AutoReplyConfig {
        throttle_ms: 50,
        default_model: None,
        model_bindings: Default::default(),
    };
    let mut base = loop_config(5);
    base.model = String::new();
    let runner = AutoReplyRunner::new(
        provider.clone(),
        builtin_registry(),
        sessions,
        base,
        &config,
        std::env::temp_dir(),
        EventBus::default(),
    );
    let channel = Arc::new(MockChannel::new("mock"));

    runner
        .handle(channel.clone(), incoming("mock", "chat-1", "hi"))
        .await
        .unwrap();

    // No loop ever started, but the sender still saw an outcome.
    assert!(provider.requests.lock().unwrap().is_empty());
    assert_eq!(channel.sent_count(), 1);
    assert!(channel.sent()[0].text.contains("not configured"));
}
