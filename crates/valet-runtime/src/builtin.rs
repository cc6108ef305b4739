//! Built-in tools that ship with the Valet runtime.
//!
//! The filesystem tools enforce the sandbox/scope rules through
//! `requires_approval` and at execution time; the delivery tools go through
//! the per-run delivery guard so one run delivers at most once.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::context::{ExecutionScope, ToolContext};
use crate::registry::{ToolHandler, ToolRegistry};
use valet_core::{Result, Tool, ToolCall, ToolResult, ValetError};

fn arg_str<'a>(call: &'a ToolCall, key: &str) -> Result<&'a str> {
    call.arguments
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ValetError::ToolExecution {
            tool: call.name.clone(),
            reason: format!("missing '{key}' argument"),
        })
}

/// Register the full built-in set on a registry.
pub fn register_builtins(registry: &ToolRegistry) {
    registry.register(Arc::new(FileReadTool));
    registry.register(Arc::new(FileListTool));
    registry.register(Arc::new(FileGrepTool));
    registry.register(Arc::new(FileWriteTool));
    registry.register(Arc::new(NotifyTool));
    registry.register(Arc::new(ChannelSendTool));
}

// ── Read-only filesystem tools ─────────────────────────────────

pub struct FileReadTool;

#[async_trait]
impl ToolHandler for FileReadTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "file_read".into(),
            description: "Read the contents of a file".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Path to the file to read" }
                },
                "required": ["path"]
            }),
            read_only: true,
        }
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolResult> {
        let path = ctx.resolve_path(arg_str(call, "path")?);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ValetError::ToolExecution {
                tool: call.name.clone(),
                reason: format!("{}: {e}", path.display()),
            })?;
        Ok(ToolResult::ok(&call.id, content))
    }
}

pub struct FileListTool;

#[async_trait]
impl ToolHandler for FileListTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "file_list".into(),
            description: "List files and directories at a path".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Directory to list (default: working dir)" }
                }
            }),
            read_only: true,
        }
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolResult> {
        let path = call
            .arguments
            .get("path")
            .and_then(|v| v.as_str())
            .map(|p| ctx.resolve_path(p))
            .unwrap_or_else(|| ctx.working_dir.clone());

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| ValetError::ToolExecution {
                tool: call.name.clone(),
                reason: format!("{}: {e}", path.display()),
            })?;
        while let Ok(Some(entry)) = dir.next_entry().await {
            let kind = if entry.path().is_dir() { "dir" } else { "file" };
            entries.push(format!("{kind}  {}", entry.file_name().to_string_lossy()));
        }
        entries.sort();
        Ok(ToolResult::ok(&call.id, entries.join("\n")))
    }
}

pub struct FileGrepTool;

/// Recursively collect regex matches under `dir` as "path:line: text" lines.
fn grep_dir(
    dir: &Path,
    re: &regex::Regex,
    matches: &mut Vec<String>,
    limit: usize,
) -> std::io::Result<()> {
    if matches.len() >= limit {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            // Skip hidden directories (.git and friends)
            if path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with('.'))
            {
                continue;
            }
            grep_dir(&path, re, matches, limit)?;
        } else if let Ok(content) = std::fs::read_to_string(&path) {
            for (lineno, line) in content.lines().enumerate() {
                if re.is_match(line) {
                    matches.push(format!("{}:{}: {}", path.display(), lineno + 1, line.trim()));
                    if matches.len() >= limit {
                        return Ok(());
                    }
                }
            }
        }
    }
    Ok(())
}

#[async_trait]
impl ToolHandler for FileGrepTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "file_grep".into(),
            description: "Search file contents under a directory with a regular expression"
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string", "description": "Regular expression to search for" },
                    "path": { "type": "string", "description": "Directory to search (default: working dir)" }
                },
                "required": ["pattern"]
            }),
            read_only: true,
        }
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolResult> {
        let pattern = arg_str(call, "pattern")?;
        let re = regex::Regex::new(pattern).map_err(|e| ValetError::ToolExecution {
            tool: call.name.clone(),
            reason: format!("invalid pattern: {e}"),
        })?;
        let dir = call
            .arguments
            .get("path")
            .and_then(|v| v.as_str())
            .map(|p| ctx.resolve_path(p))
            .unwrap_or_else(|| ctx.working_dir.clone());

        let mut matches = Vec::new();
        grep_dir(&dir, &re, &mut matches, 100).map_err(|e| ValetError::ToolExecution {
            tool: call.name.clone(),
            reason: e.to_string(),
        })?;

        let content = if matches.is_empty() {
            "no matches".to_string()
        } else {
            matches.join("\n")
        };
        Ok(ToolResult::ok(&call.id, content).with_data(json!({ "count": matches.len() })))
    }
}

// ── Write tools ────────────────────────────────────────────────

pub struct FileWriteTool;

#[async_trait]
impl ToolHandler for FileWriteTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "file_write".into(),
            description: "Write content to a file (creates or overwrites)".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Path to the file to write" },
                    "content": { "type": "string", "description": "Content to write" }
                },
                "required": ["path", "content"]
            }),
            read_only: false,
        }
    }

    fn requires_approval(&self, input: &serde_json::Value, ctx: &ToolContext) -> bool {
        let Some(path) = input.get("path").and_then(|v| v.as_str()) else {
            return true;
        };
        let path = ctx.resolve_path(path);
        // Plugin-scoped runs are prefix-restricted; everything else hinges
        // on the sandbox root.
        if !ctx.allowed_by_scope(&path) {
            return true;
        }
        !ctx.inside_sandbox(&path)
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolResult> {
        let path = ctx.resolve_path(arg_str(call, "path")?);
        let content = arg_str(call, "content")?;

        // The scope restriction is enforced here too — approval cannot
        // widen a plugin run's permitted prefixes.
        if !ctx.allowed_by_scope(&path) {
            return Err(ValetError::ToolExecution {
                tool: call.name.clone(),
                reason: format!("write target {} is outside the permitted paths", path.display()),
            });
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ValetError::ToolExecution {
                    tool: call.name.clone(),
                    reason: e.to_string(),
                })?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| ValetError::ToolExecution {
                tool: call.name.clone(),
                reason: format!("{}: {e}", path.display()),
            })?;
        Ok(ToolResult::ok(
            &call.id,
            format!("wrote {} bytes to {}", content.len(), path.display()),
        ))
    }
}

// ── Delivery tools ─────────────────────────────────────────────

/// Surface a run's result to the user. In a channel-bound run the call is
/// transparently redirected to that channel's send primitive — the agent
/// does not need to know which delivery mechanism is ultimately used.
pub struct NotifyTool;

#[async_trait]
impl ToolHandler for NotifyTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "notify".into(),
            description: "Deliver a message to the user (desktop notification or bound channel)"
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string", "description": "Short headline" },
                    "body": { "type": "string", "description": "Message body" }
                },
                "required": ["body"]
            }),
            read_only: false,
        }
    }

    fn requires_approval(&self, _input: &serde_json::Value, ctx: &ToolContext) -> bool {
        // Unattended runs exist to deliver; prompting would deadlock them.
        !matches!(ctx.scope, ExecutionScope::Unattended)
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolResult> {
        // Claim the delivery slot before any I/O.
        if !ctx.run_state.try_claim_delivery() {
            debug!(tool = %call.name, "delivery already performed this run — skipping");
            return Ok(ToolResult::ok(
                &call.id,
                "Delivery already performed for this run — skipped",
            )
            .with_data(json!({ "skipped": true })));
        }

        let title = call
            .arguments
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("Valet");
        let body = arg_str(call, "body")?;

        match &ctx.channel {
            Some(binding) => {
                let message_id = binding.channel.send(&binding.chat_id, body).await?;
                Ok(ToolResult::ok(&call.id, "delivered to channel")
                    .with_data(json!({ "skipped": false, "message_id": message_id })))
            }
            None => {
                ctx.notifier.notify(title, body).await?;
                Ok(ToolResult::ok(&call.id, "notification shown")
                    .with_data(json!({ "skipped": false })))
            }
        }
    }
}

/// Send a message over the run's bound channel.
pub struct ChannelSendTool;

#[async_trait]
impl ToolHandler for ChannelSendTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "channel_send".into(),
            description: "Send a message to the conversation's external channel".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "description": "Message text" }
                },
                "required": ["text"]
            }),
            read_only: false,
        }
    }

    fn requires_approval(&self, _input: &serde_json::Value, ctx: &ToolContext) -> bool {
        !matches!(ctx.scope, ExecutionScope::Unattended)
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolResult> {
        if !ctx.run_state.try_claim_delivery() {
            debug!(tool = %call.name, "delivery already performed this run — skipping");
            return Ok(ToolResult::ok(
                &call.id,
                "Delivery already performed for this run — skipped",
            )
            .with_data(json!({ "skipped": true })));
        }

        let text = arg_str(call, "text")?;
        let Some(binding) = &ctx.channel else {
            return Err(ValetError::ToolExecution {
                tool: call.name.clone(),
                reason: "no channel bound to this run".into(),
            });
        };
        let message_id = binding.channel.send(&binding.chat_id, text).await?;
        Ok(ToolResult::ok(&call.id, "sent")
            .with_data(json!({ "skipped": false, "message_id": message_id })))
    }
}
