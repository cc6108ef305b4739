//! Teams: peer agent loops collaborating through a shared task board.
//!
//! Teammates are independent loop instances running concurrently — they may
//! all be mid-stream simultaneously. They never call into the loop that
//! spawned them: every task/status mutation goes through the board, whose
//! canonical state lives in one place regardless of which loop produced the
//! mutation, and is announced on a typed event channel.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent_loop::{AgentLoop, LoopConfig, LoopEvent};
use crate::approval::ApprovalPolicy;
use crate::context::ToolContext;
use crate::registry::ToolRegistry;
use valet_core::{EventBus, EventTag, Message, Role};
use valet_llm::LlmProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

/// One unit of work on the board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamTask {
    pub id: Uuid,
    pub subject: String,
    pub description: String,
    pub status: TaskStatus,
    /// The teammate working the task. Exactly one while in progress.
    pub owner: Option<Uuid>,
    pub depends_on: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeammateStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Teammate {
    pub id: Uuid,
    pub name: String,
    pub status: TeammateStatus,
    pub current_task: Option<Uuid>,
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Typed event channel announcing board mutations.
#[derive(Debug, Clone)]
pub enum TeamEvent {
    TaskAdded { task_id: Uuid },
    TaskClaimed { task_id: Uuid, member_id: Uuid },
    TaskCompleted { task_id: Uuid, member_id: Uuid },
    /// The defined way back from in-progress to pending: the owner aborted.
    TaskReleased { task_id: Uuid },
    MemberAdded { member_id: Uuid },
    MemberFinished { member_id: Uuid, success: bool },
}

#[derive(Default)]
struct BoardState {
    tasks: Vec<TeamTask>,
    members: HashMap<Uuid, Teammate>,
}

/// The canonical task/member store for one team.
pub struct TaskBoard {
    state: parking_lot::Mutex<BoardState>,
    events: broadcast::Sender<TeamEvent>,
}

impl Default for TaskBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskBoard {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: parking_lot::Mutex::new(BoardState::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TeamEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: TeamEvent) {
        let _ = self.events.send(event);
    }

    pub fn add_task(
        &self,
        subject: &str,
        description: &str,
        depends_on: Vec<Uuid>,
    ) -> Uuid {
        let task = TeamTask {
            id: Uuid::new_v4(),
            subject: subject.to_string(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            owner: None,
            depends_on,
            created_at: Utc::now(),
        };
        let id = task.id;
        self.state.lock().tasks.push(task);
        self.publish(TeamEvent::TaskAdded { task_id: id });
        id
    }

    /// Claim a specific task. Synchronous check-and-set under the board
    /// lock: only a pending task with satisfied dependencies can be claimed,
    /// and the claim installs exactly one owner.
    pub fn claim(&self, task_id: Uuid, member_id: Uuid) -> bool {
        let claimed = {
            let mut state = self.state.lock();
            let deps_done = |task: &TeamTask, all: &[TeamTask]| {
                task.depends_on.iter().all(|dep| {
                    all.iter()
                        .find(|t| t.id == *dep)
                        .is_none_or(|t| t.status == TaskStatus::Completed)
                })
            };
            let tasks_snapshot = state.tasks.clone();
            match state.tasks.iter_mut().find(|t| t.id == task_id) {
                Some(task)
                    if task.status == TaskStatus::Pending
                        && deps_done(task, &tasks_snapshot) =>
                {
                    task.status = TaskStatus::InProgress;
                    task.owner = Some(member_id);
                    true
                }
                _ => false,
            }
        };
        if claimed {
            self.publish(TeamEvent::TaskClaimed { task_id, member_id });
        }
        claimed
    }

    /// Claim the first available task in board order.
    pub fn claim_next(&self, member_id: Uuid) -> Option<TeamTask> {
        let candidate = {
            let state = self.state.lock();
            state
                .tasks
                .iter()
                .find(|t| {
                    t.status == TaskStatus::Pending
                        && t.depends_on.iter().all(|dep| {
                            state
                                .tasks
                                .iter()
                                .find(|d| d.id == *dep)
                                .is_none_or(|d| d.status == TaskStatus::Completed)
                        })
                })
                .map(|t| t.id)
        };
        // claim() re-checks under the lock, so a lost race just returns None.
        let task_id = candidate?;
        if self.claim(task_id, member_id) {
            self.task(task_id)
        } else {
            None
        }
    }

    pub fn complete(&self, task_id: Uuid, member_id: Uuid) -> bool {
        let completed = {
            let mut state = self.state.lock();
            match state.tasks.iter_mut().find(|t| t.id == task_id) {
                Some(task)
                    if task.status == TaskStatus::InProgress
                        && task.owner == Some(member_id) =>
                {
                    task.status = TaskStatus::Completed;
                    true
                }
                _ => false,
            }
        };
        if completed {
            self.publish(TeamEvent::TaskCompleted { task_id, member_id });
        }
        completed
    }

    /// Return an in-progress task to pending, clearing its owner. Used when
    /// the owning teammate aborts or fails.
    pub fn release(&self, task_id: Uuid) -> bool {
        let released = {
            let mut state = self.state.lock();
            match state.tasks.iter_mut().find(|t| t.id == task_id) {
                Some(task) if task.status == TaskStatus::InProgress => {
                    task.status = TaskStatus::Pending;
                    task.owner = None;
                    true
                }
                _ => false,
            }
        };
        if released {
            self.publish(TeamEvent::TaskReleased { task_id });
        }
        released
    }

    pub fn task(&self, task_id: Uuid) -> Option<TeamTask> {
        self.state.lock().tasks.iter().find(|t| t.id == task_id).cloned()
    }

    pub fn tasks(&self) -> Vec<TeamTask> {
        self.state.lock().tasks.clone()
    }

    pub fn add_member(&self, name: &str) -> Uuid {
        let member = Teammate {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: TeammateStatus::Running,
            current_task: None,
            iteration: 0,
            started_at: Utc::now(),
            completed_at: None,
        };
        let id = member.id;
        self.state.lock().members.insert(id, member);
        self.publish(TeamEvent::MemberAdded { member_id: id });
        id
    }

    pub fn member(&self, id: Uuid) -> Option<Teammate> {
        self.state.lock().members.get(&id).cloned()
    }

    pub fn members(&self) -> Vec<Teammate> {
        self.state.lock().members.values().cloned().collect()
    }

    pub fn set_member_progress(&self, id: Uuid, current_task: Option<Uuid>, iteration: u32) {
        if let Some(member) = self.state.lock().members.get_mut(&id) {
            member.current_task = current_task;
            member.iteration = iteration;
        }
    }

    pub fn finish_member(&self, id: Uuid, success: bool) {
        {
            let mut state = self.state.lock();
            if let Some(member) = state.members.get_mut(&id) {
                member.status = if success {
                    TeammateStatus::Completed
                } else {
                    TeammateStatus::Failed
                };
                member.current_task = None;
                member.completed_at = Some(Utc::now());
            }
        }
        self.publish(TeamEvent::MemberFinished {
            member_id: id,
            success,
        });
    }
}

/// Spawns teammates and tracks their join handles.
pub struct TeamRunner {
    board: Arc<TaskBoard>,
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    approval: Arc<dyn ApprovalPolicy>,
    base_config: LoopConfig,
    bus: EventBus,
    handles: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl TeamRunner {
    pub fn new(
        board: Arc<TaskBoard>,
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        approval: Arc<dyn ApprovalPolicy>,
        base_config: LoopConfig,
        bus: EventBus,
    ) -> Self {
        Self {
            board,
            provider,
            registry,
            approval,
            base_config,
            bus,
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Start an independent teammate loop. It runs concurrently with the
    /// caller and with every other teammate, working the board until no
    /// claimable task remains.
    pub fn spawn_teammate(&self, name: &str, ctx: &ToolContext) -> Uuid {
        let member_id = self.board.add_member(name);
        info!(member_id = %member_id, name, "spawned teammate");

        let board = Arc::clone(&self.board);
        let provider = Arc::clone(&self.provider);
        let registry = Arc::clone(&self.registry);
        let approval = Arc::clone(&self.approval);
        let config = self.base_config.clone();
        let bus = self.bus.clone();
        let ctx = ctx.child();

        let handle = tokio::spawn(async move {
            run_teammate(board, provider, registry, approval, config, bus, member_id, ctx).await;
        });
        self.handles.lock().push(handle);
        member_id
    }

    /// Wait for every spawned teammate to come to rest.
    pub async fn join(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    warn!(error = %e, "teammate task panicked");
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_teammate(
    board: Arc<TaskBoard>,
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    approval: Arc<dyn ApprovalPolicy>,
    config: LoopConfig,
    bus: EventBus,
    member_id: Uuid,
    ctx: ToolContext,
) {
    let mut success = true;

    while let Some(task) = board.claim_next(member_id) {
        if ctx.cancel.is_cancelled() {
            board.release(task.id);
            success = false;
            break;
        }
        board.set_member_progress(member_id, Some(task.id), 0);

        let prompt = format!(
            "You are working one task from a shared team board.\n\n\
             ## Task: {}\n{}\n\n\
             Complete the task with your tools, then summarize what you did.",
            task.subject, task.description
        );
        let agent = Arc::new(
            AgentLoop::new(
                Arc::clone(&provider),
                Arc::clone(&registry),
                Arc::clone(&approval),
                config.clone(),
            )
            .with_observer(bus.clone(), EventTag::teammate(member_id)),
        );

        let history = vec![Message::text(Role::User, prompt)];
        let (mut rx, handle) = agent.spawn(history, ctx.clone());

        // Track iteration boundaries so the board reflects live progress.
        while let Some(event) = rx.recv().await {
            if let LoopEvent::Iteration { iteration, .. } = event {
                board.set_member_progress(member_id, Some(task.id), iteration);
            }
        }

        match handle.await {
            Ok(Ok(_outcome)) => {
                board.complete(task.id, member_id);
            }
            Ok(Err(e)) => {
                warn!(member_id = %member_id, task_id = %task.id, error = %e, "teammate run failed — releasing task");
                board.release(task.id);
                success = false;
                break;
            }
            Err(e) => {
                warn!(member_id = %member_id, task_id = %task.id, error = %e, "teammate task join error");
                board.release(task.id);
                success = false;
                break;
            }
        }
    }

    board.finish_member(member_id, success);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_installs_single_owner() {
        let board = TaskBoard::new();
        let task_id = board.add_task("t", "do it", vec![]);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(board.claim(task_id, a));
        assert!(!board.claim(task_id, b));
        assert_eq!(board.task(task_id).unwrap().owner, Some(a));
    }

    #[test]
    fn test_dependencies_gate_claims() {
        let board = TaskBoard::new();
        let first = board.add_task("first", "", vec![]);
        let second = board.add_task("second", "", vec![first]);
        let member = Uuid::new_v4();

        let claimed = board.claim_next(member).unwrap();
        assert_eq!(claimed.id, first);
        // Dependency not completed — second is not claimable.
        assert!(board.claim_next(member).is_none());

        board.complete(first, member);
        let claimed = board.claim_next(member).unwrap();
        assert_eq!(claimed.id, second);
    }

    #[test]
    fn test_release_returns_task_to_pending() {
        let board = TaskBoard::new();
        let task_id = board.add_task("t", "", vec![]);
        let member = Uuid::new_v4();
        board.claim(task_id, member);
        assert!(board.release(task_id));

        let task = board.task(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.owner.is_none());
    }

    #[test]
    fn test_complete_requires_owner() {
        let board = TaskBoard::new();
        let task_id = board.add_task("t", "", vec![]);
        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        board.claim(task_id, owner);

        assert!(!board.complete(task_id, stranger));
        assert!(board.complete(task_id, owner));
    }

    #[test]
    fn test_events_announce_mutations() {
        let board = TaskBoard::new();
        let mut rx = board.subscribe();
        let task_id = board.add_task("t", "", vec![]);
        let member = board.add_member("worker");
        board.claim(task_id, member);

        assert!(matches!(rx.try_recv().unwrap(), TeamEvent::TaskAdded { .. }));
        assert!(matches!(rx.try_recv().unwrap(), TeamEvent::MemberAdded { .. }));
        assert!(matches!(
            rx.try_recv().unwrap(),
            TeamEvent::TaskClaimed { .. }
        ));
    }
}
