use async_trait::async_trait;

use valet_core::ToolCall;

/// The policy deciding whether a tool call that asked for approval may
/// execute. Injectable per host context: an interactive host prompts the
/// user, an unattended host auto-approves or denies, and a sub-agent
/// bubbles the decision to whoever spawned it.
#[async_trait]
pub trait ApprovalPolicy: Send + Sync {
    async fn approve(&self, call: &ToolCall) -> bool;
}

/// Approves everything. Used by unattended runs where the gate's
/// context-dependent checks (sandbox, scope prefixes) do the real work.
pub struct AutoApprove;

#[async_trait]
impl ApprovalPolicy for AutoApprove {
    async fn approve(&self, _call: &ToolCall) -> bool {
        true
    }
}

/// Denies everything.
pub struct DenyAll;

#[async_trait]
impl ApprovalPolicy for DenyAll {
    async fn approve(&self, _call: &ToolCall) -> bool {
        false
    }
}

/// Records every call it is consulted about and answers with a fixed
/// verdict. The assertion surface for approval-routing tests.
pub struct RecordingPolicy {
    pub seen: parking_lot::Mutex<Vec<String>>,
    verdict: bool,
}

impl RecordingPolicy {
    pub fn approving() -> Self {
        Self {
            seen: parking_lot::Mutex::new(vec![]),
            verdict: true,
        }
    }

    pub fn denying() -> Self {
        Self {
            seen: parking_lot::Mutex::new(vec![]),
            verdict: false,
        }
    }

    pub fn seen_tools(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl ApprovalPolicy for RecordingPolicy {
    async fn approve(&self, call: &ToolCall) -> bool {
        self.seen.lock().push(call.name.clone());
        self.verdict
    }
}
