use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use valet_channels::Channel;
use valet_core::Result;

/// Mutable state shared by every tool execution within one run.
/// Created at run start, discarded at run end.
#[derive(Debug, Default)]
pub struct RunState {
    /// Set once the run has performed its delivery. Checked-and-set
    /// synchronously (no await between check and set), so exactly one
    /// delivery succeeds even when several delivery-capable tool calls
    /// land in the same iteration.
    delivery_used: AtomicBool,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the run's single delivery slot. Returns `true` exactly once.
    pub fn try_claim_delivery(&self) -> bool {
        !self.delivery_used.swap(true, Ordering::SeqCst)
    }

    pub fn delivery_used(&self) -> bool {
        self.delivery_used.load(Ordering::SeqCst)
    }
}

/// Where a run's output ultimately goes when it is bound to an external
/// messaging channel.
#[derive(Clone)]
pub struct ChannelBinding {
    pub channel: Arc<dyn Channel>,
    pub chat_id: String,
}

/// How much latitude tool executions have in this run.
#[derive(Debug, Clone)]
pub enum ExecutionScope {
    /// A user is present; side effects go through the approval gate.
    Interactive,
    /// Triggered by an external channel message: writes are only permitted
    /// under these path prefixes.
    Plugin { allowed_prefixes: Vec<PathBuf> },
    /// Scheduled / unattended: no one is available to answer prompts.
    Unattended,
}

/// Sink for local desktop notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, body: &str) -> Result<()>;
}

/// Default notifier: a structured log line stands in for the desktop popup.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, title: &str, body: &str) -> Result<()> {
        info!(title, body, "notification");
        Ok(())
    }
}

/// Test notifier that records every notification.
#[derive(Default)]
pub struct RecordingNotifier {
    pub notifications: parking_lot::Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, title: &str, body: &str) -> Result<()> {
        self.notifications
            .lock()
            .push((title.to_string(), body.to_string()));
        Ok(())
    }
}

/// Everything a tool handler gets to see about the run it executes in.
/// One context per run; nested loops derive a child with `child()`.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: Option<Uuid>,
    pub working_dir: PathBuf,
    /// Writes inside this root are auto-approved; outside, the gate decides.
    pub sandbox_root: Option<PathBuf>,
    pub scope: ExecutionScope,
    pub run_state: Arc<RunState>,
    pub channel: Option<ChannelBinding>,
    pub notifier: Arc<dyn Notifier>,
    pub cancel: CancellationToken,
    /// Nesting depth: 0 for a top-level loop, +1 per sub-agent.
    pub depth: u32,
}

impl ToolContext {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_id: None,
            working_dir: working_dir.into(),
            sandbox_root: None,
            scope: ExecutionScope::Interactive,
            run_state: Arc::new(RunState::new()),
            channel: None,
            notifier: Arc::new(LogNotifier),
            cancel: CancellationToken::new(),
            depth: 0,
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_sandbox(mut self, root: impl Into<PathBuf>) -> Self {
        self.sandbox_root = Some(root.into());
        self
    }

    pub fn with_scope(mut self, scope: ExecutionScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_channel(mut self, channel: Arc<dyn Channel>, chat_id: &str) -> Self {
        self.channel = Some(ChannelBinding {
            channel,
            chat_id: chat_id.to_string(),
        });
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Derive a context for a nested loop: one level deeper, with a child
    /// cancellation token so cancelling the parent cancels the child, and
    /// the same run state so the delivery guard spans the whole run.
    pub fn child(&self) -> Self {
        let mut child = self.clone();
        child.cancel = self.cancel.child_token();
        child.depth = self.depth + 1;
        child
    }

    /// Resolve a (possibly relative) tool path argument against the working
    /// directory.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.working_dir.join(p)
        }
    }

    /// Whether a write to `path` falls inside the sandbox root.
    pub fn inside_sandbox(&self, path: &Path) -> bool {
        match &self.sandbox_root {
            Some(root) => path.starts_with(root),
            None => false,
        }
    }

    /// Whether a write to `path` is permitted by a plugin scope's prefixes.
    /// Non-plugin scopes place no prefix restriction.
    pub fn allowed_by_scope(&self, path: &Path) -> bool {
        match &self.scope {
            ExecutionScope::Plugin { allowed_prefixes } => {
                allowed_prefixes.iter().any(|p| path.starts_with(p))
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_claimed_exactly_once() {
        let state = RunState::new();
        assert!(state.try_claim_delivery());
        assert!(!state.try_claim_delivery());
        assert!(!state.try_claim_delivery());
        assert!(state.delivery_used());
    }

    #[test]
    fn test_child_context_depth_and_cancel() {
        let ctx = ToolContext::new("/tmp");
        let child = ctx.child();
        assert_eq!(child.depth, 1);
        assert!(!child.cancel.is_cancelled());
        ctx.cancel.cancel();
        assert!(child.cancel.is_cancelled());
    }

    #[test]
    fn test_scope_prefix_check() {
        let ctx = ToolContext::new("/work").with_scope(ExecutionScope::Plugin {
            allowed_prefixes: vec![PathBuf::from("/work/out")],
        });
        assert!(ctx.allowed_by_scope(Path::new("/work/out/report.md")));
        assert!(!ctx.allowed_by_scope(Path::new("/etc/passwd")));
    }

    #[test]
    fn test_resolve_path() {
        let ctx = ToolContext::new("/work");
        assert_eq!(ctx.resolve_path("notes.txt"), PathBuf::from("/work/notes.txt"));
        assert_eq!(ctx.resolve_path("/abs/notes.txt"), PathBuf::from("/abs/notes.txt"));
    }
}
