//! Sub-agents: nested agent loops under a restricted capability profile.
//!
//! One reusable execution path parameterized by profile. Read-only tools
//! are always auto-approved inside the nested loop; write-capable calls
//! bubble to the host's approval callback, so a sub-agent can never grant
//! itself more privilege than its host allows.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::info;

use crate::agent_loop::{AgentLoop, LoopConfig, LoopStop};
use crate::approval::ApprovalPolicy;
use crate::context::ToolContext;
use crate::registry::{ToolHandler, ToolRegistry};
use valet_core::{Message, Result, Role, Tool, ToolCall, ToolResult, ValetError};
use valet_llm::{LlmProvider, Usage};

/// Tools a sub-agent may always run without consulting anyone.
pub const READ_ONLY_TOOLS: &[&str] = &["file_read", "file_list", "file_grep"];

/// A named capability profile for nested loops. Static, registered at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentProfile {
    pub name: String,
    pub allowed_tools: Vec<String>,
    pub max_iterations: u32,
    pub system_prompt: String,
    /// Model override; `None` inherits the host's model.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// Explicit profile registry — constructed once at startup and passed by
/// reference, so tests get isolated registries.
#[derive(Default)]
pub struct SubAgentRegistry {
    profiles: RwLock<HashMap<String, Arc<SubAgentProfile>>>,
}

impl SubAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the standard profiles.
    pub fn with_default_profiles() -> Self {
        let registry = Self::new();
        registry.register(SubAgentProfile {
            name: "CodeSearch".into(),
            allowed_tools: READ_ONLY_TOOLS.iter().map(|s| s.to_string()).collect(),
            max_iterations: 10,
            system_prompt: "You are a focused code-search agent. Locate the code relevant to \
                            the request, read enough of it to be precise, and report file \
                            paths with short explanations. Do not modify anything."
                .into(),
            model: None,
            temperature: Some(0.2),
        });
        registry.register(SubAgentProfile {
            name: "Reviewer".into(),
            allowed_tools: READ_ONLY_TOOLS.iter().map(|s| s.to_string()).collect(),
            max_iterations: 12,
            system_prompt: "You are a review agent. Examine the target material, check for \
                            defects and inconsistencies, and report findings with locations \
                            and concrete suggestions."
                .into(),
            model: None,
            temperature: None,
        });
        registry.register(SubAgentProfile {
            name: "Planner".into(),
            allowed_tools: READ_ONLY_TOOLS.iter().map(|s| s.to_string()).collect(),
            max_iterations: 8,
            system_prompt: "You are a planning agent. Break the task into ordered, concrete \
                            steps with the files and commands involved. Do not execute the \
                            plan — only produce it."
                .into(),
            model: None,
            temperature: None,
        });
        registry
    }

    pub fn register(&self, profile: SubAgentProfile) {
        self.profiles
            .write()
            .insert(profile.name.clone(), Arc::new(profile));
    }

    pub fn get(&self, name: &str) -> Option<Arc<SubAgentProfile>> {
        self.profiles.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Consolidated result of one sub-agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentResult {
    pub success: bool,
    pub output: String,
    pub tool_call_count: u32,
    pub iterations: u32,
    pub usage: Usage,
    pub error: Option<String>,
}

/// Wraps the host policy: whitelisted read-only tools are approved without
/// ever reaching the host; everything else bubbles up.
struct BubbledApproval {
    host: Arc<dyn ApprovalPolicy>,
}

#[async_trait]
impl ApprovalPolicy for BubbledApproval {
    async fn approve(&self, call: &ToolCall) -> bool {
        if READ_ONLY_TOOLS.contains(&call.name.as_str()) {
            return true;
        }
        self.host.approve(call).await
    }
}

/// Convert a sub-agent input object into a synthetic first user turn.
/// Field-specific formatting: a "query"/"task"/"target"+"focus" field
/// becomes natural-language instructions; "scope" and "constraints" are
/// appended when present.
fn format_task(input: &Value) -> String {
    let mut text = if let Some(query) = input.get("query").and_then(|v| v.as_str()) {
        format!("Find and report on the following: {query}")
    } else if let Some(task) = input.get("task").and_then(|v| v.as_str()) {
        task.to_string()
    } else if let Some(target) = input.get("target").and_then(|v| v.as_str()) {
        match input.get("focus").and_then(|v| v.as_str()) {
            Some(focus) => format!("Examine {target}, focusing on {focus}."),
            None => format!("Examine {target}."),
        }
    } else {
        serde_json::to_string_pretty(input).unwrap_or_else(|_| input.to_string())
    };

    if let Some(scope) = input.get("scope").and_then(|v| v.as_str()) {
        text.push_str(&format!("\n\nLimit your work to this scope: {scope}"));
    }
    match input.get("constraints") {
        Some(Value::String(c)) => text.push_str(&format!("\n\nConstraints: {c}")),
        Some(Value::Array(items)) => {
            text.push_str("\n\nConstraints:");
            for item in items {
                if let Some(s) = item.as_str() {
                    text.push_str(&format!("\n- {s}"));
                }
            }
        }
        _ => {}
    }
    text
}

/// Runs nested agent loops scoped to registered profiles.
pub struct SubAgentRunner {
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    profiles: Arc<SubAgentRegistry>,
    base_config: LoopConfig,
    max_depth: u32,
}

impl SubAgentRunner {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        profiles: Arc<SubAgentRegistry>,
        base_config: LoopConfig,
        max_depth: u32,
    ) -> Self {
        Self {
            provider,
            registry,
            profiles,
            base_config,
            max_depth,
        }
    }

    /// Run the named profile against a structured input, bubbling write
    /// approvals to `host_approval`. The nested loop runs one level deeper
    /// than `parent_ctx` with a reduced iteration budget.
    pub async fn run(
        &self,
        profile_name: &str,
        input: &Value,
        host_approval: Arc<dyn ApprovalPolicy>,
        parent_ctx: &ToolContext,
    ) -> Result<SubAgentResult> {
        if parent_ctx.depth >= self.max_depth {
            return Err(ValetError::ToolExecution {
                tool: "sub_agent".into(),
                reason: format!(
                    "sub-agent recursion depth limit reached ({})",
                    self.max_depth
                ),
            });
        }
        let profile = self
            .profiles
            .get(profile_name)
            .ok_or_else(|| ValetError::Agent(format!("unknown sub-agent profile: {profile_name}")))?;

        info!(profile = %profile.name, depth = parent_ctx.depth + 1, "starting sub-agent");

        let config = LoopConfig {
            model: profile
                .model
                .clone()
                .unwrap_or_else(|| self.base_config.model.clone()),
            system_prompt: Some(profile.system_prompt.clone()),
            max_iterations: profile.max_iterations.min(self.base_config.max_iterations),
            max_tokens: self.base_config.max_tokens,
            temperature: profile.temperature.unwrap_or(self.base_config.temperature),
        };

        let scoped = Arc::new(self.registry.subset(&profile.allowed_tools));
        let approval = Arc::new(BubbledApproval {
            host: host_approval,
        });
        let agent = AgentLoop::new(Arc::clone(&self.provider), scoped, approval, config);

        let history = vec![Message::text(Role::User, format_task(input))];
        let ctx = parent_ctx.child();

        // The consolidated result is all callers need — sink the events.
        let (tx, rx) = mpsc::channel(64);
        drop(rx);
        match agent.run(history, ctx, tx).await {
            Ok(outcome) => Ok(SubAgentResult {
                success: outcome.stop != LoopStop::Cancelled,
                output: outcome.final_text,
                tool_call_count: outcome.tool_call_count,
                iterations: outcome.iterations,
                usage: outcome.usage,
                error: None,
            }),
            Err(e) => Ok(SubAgentResult {
                success: false,
                output: String::new(),
                tool_call_count: 0,
                iterations: 0,
                usage: Usage::default(),
                error: Some(e.to_string()),
            }),
        }
    }
}

/// The tool surface over the runner, so a parent loop can spawn sub-agents.
pub struct SubAgentTool {
    runner: Arc<SubAgentRunner>,
    host_approval: Arc<dyn ApprovalPolicy>,
}

impl SubAgentTool {
    pub fn new(runner: Arc<SubAgentRunner>, host_approval: Arc<dyn ApprovalPolicy>) -> Self {
        Self {
            runner,
            host_approval,
        }
    }
}

#[async_trait]
impl ToolHandler for SubAgentTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "sub_agent".into(),
            description: "Delegate a scoped task to a named sub-agent profile and wait for \
                          its consolidated result"
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "profile": { "type": "string", "description": "Profile name, e.g. CodeSearch" },
                    "query": { "type": "string", "description": "What to find (search profiles)" },
                    "task": { "type": "string", "description": "What to do (task profiles)" },
                    "target": { "type": "string", "description": "What to examine (review profiles)" },
                    "focus": { "type": "string", "description": "Aspect to focus on" },
                    "scope": { "type": "string", "description": "Optional scope restriction" },
                    "constraints": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["profile"]
            }),
            // Approval is resolved per nested call, not for the spawn itself.
            read_only: true,
        }
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolResult> {
        let profile = call
            .arguments
            .get("profile")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ValetError::ToolExecution {
                tool: call.name.clone(),
                reason: "missing 'profile' argument".into(),
            })?;

        let result = self
            .runner
            .run(profile, &call.arguments, Arc::clone(&self.host_approval), ctx)
            .await?;

        let content = if result.success {
            result.output.clone()
        } else {
            format!(
                "sub-agent failed: {}",
                result.error.as_deref().unwrap_or("unknown error")
            )
        };
        Ok(ToolResult {
            tool_call_id: call.id.clone(),
            content,
            is_error: !result.success,
            data: Some(serde_json::to_value(&result)?),
        })
    }
}
