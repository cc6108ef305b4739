//! # valet-runtime
//!
//! The agent execution engine — the component that turns a streamed model
//! response into structured conversation state, executes requested tools
//! under an approval policy, and runs nested/parallel executions without
//! corrupting shared state or double-delivering results.
//!
//! ## Architecture
//!
//! ```text
//!   trigger (user turn / timer / inbound message)
//!        │
//!        ▼
//!   ┌─────────────┐     ┌──────────────────┐
//!   │  Runner      │ ──▶ │    Agent Loop    │ ◀─ one reusable mechanism
//!   │  (sub-agent, │     │ stream → tools → │
//!   │  teammate,   │     │ results → repeat │
//!   │  cron, reply)│     └────────┬─────────┘
//!   └─────────────┘              │
//!                  ┌─────────────┼─────────────┐
//!                  ▼             ▼             ▼
//!            ┌──────────┐ ┌────────────┐ ┌──────────┐
//!            │ Registry │ │  Approval  │ │ Channels │
//!            │ + tools  │ │    gate    │ │ / notify │
//!            └──────────┘ └────────────┘ └──────────┘
//! ```

pub mod agent_loop;
pub mod approval;
pub mod autoreply;
pub mod builtin;
pub mod context;
pub mod cron;
pub mod registry;
pub mod session;
pub mod sub_agent;
pub mod team;

pub use agent_loop::{
    AgentLoop, LoopConfig, LoopEvent, LoopOutcome, LoopStop, RunProgress, RunStatus,
};
pub use approval::{ApprovalPolicy, AutoApprove, DenyAll, RecordingPolicy};
pub use autoreply::AutoReplyRunner;
pub use builtin::register_builtins;
pub use context::{
    ChannelBinding, ExecutionScope, LogNotifier, Notifier, RecordingNotifier, RunState,
    ToolContext,
};
pub use cron::{
    CronAgentRunner, CronEvent, CronJob, CronRun, CronRunStatus, CronStore, DeliveryTarget,
    run_scheduler,
};
pub use registry::{ToolHandler, ToolRegistry};
pub use session::{Session, SessionManager};
pub use sub_agent::{
    READ_ONLY_TOOLS, SubAgentProfile, SubAgentRegistry, SubAgentResult, SubAgentRunner,
    SubAgentTool,
};
pub use team::{TaskBoard, TaskStatus, TeamEvent, TeamRunner, TeamTask, Teammate, TeammateStatus};
