use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Root configuration — maps to `valet.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValetConfig {
    pub agent: AgentConfig,
    pub workspace: WorkspaceConfig,
    pub cron: CronConfig,
    pub autoreply: AutoReplyConfig,
    pub channels: HashMap<String, ChannelConfig>,
    pub logging: LoggingConfig,
}

// ── Agent ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Primary model identifier, e.g. "anthropic/claude-sonnet-4".
    pub model: String,
    /// System prompt injected at the start of every conversation.
    pub system_prompt: Option<String>,
    /// Maximum tokens per response.
    pub max_tokens: u32,
    /// Temperature (0.0 - 2.0).
    pub temperature: f32,
    /// Maximum agent loop iterations before forcing a stop.
    pub max_iterations: u32,
    /// Maximum nested sub-agent depth.
    pub max_sub_agent_depth: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "anthropic/claude-sonnet-4".into(),
            system_prompt: None,
            max_tokens: 8192,
            temperature: 0.7,
            max_iterations: 25,
            max_sub_agent_depth: 2,
        }
    }
}

// ── Workspace ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Working directory handed to tool executions.
    pub working_dir: PathBuf,
    /// Writes inside this root are auto-approved; anything outside needs the gate.
    pub sandbox_root: Option<PathBuf>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            sandbox_root: None,
        }
    }
}

// ── Cron ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    /// Scheduler tick interval in seconds.
    pub tick_secs: u64,
    /// Name of the agent profile used when a job names none.
    pub default_profile: String,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            tick_secs: 10,
            default_profile: "default".into(),
        }
    }
}

// ── Auto-reply ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoReplyConfig {
    /// Minimum interval between streaming updates, in milliseconds.
    pub throttle_ms: u64,
    /// Model used for channels with no explicit binding.
    pub default_model: Option<String>,
    /// Per-channel model bindings: channel id → model identifier.
    pub model_bindings: HashMap<String, String>,
}

impl Default for AutoReplyConfig {
    fn default() -> Self {
        Self {
            throttle_ms: 500,
            default_model: None,
            model_bindings: HashMap::new(),
        }
    }
}

// ── Channels ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub enabled: bool,
    /// Adapter kind, e.g. "telegram", "slack".
    pub kind: String,
    /// Adapter credential (bot token, webhook secret, ...).
    pub token: Option<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: String::new(),
            token: None,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter, e.g. "info" or "valet_runtime=debug".
    pub level: String,
    /// Emit JSON-formatted log lines.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

impl ValetConfig {
    /// Validate the config. Returns warnings for suspicious-but-usable
    /// values; errors for values no run should ever start with.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        if self.agent.model.trim().is_empty() {
            return Err("agent.model must not be empty".into());
        }
        if self.agent.max_iterations == 0 {
            return Err("agent.max_iterations must be at least 1".into());
        }
        if !(0.0..=2.0).contains(&self.agent.temperature) {
            return Err(format!(
                "agent.temperature {} is outside 0.0..=2.0",
                self.agent.temperature
            ));
        }
        if self.cron.tick_secs == 0 {
            return Err("cron.tick_secs must be at least 1".into());
        }

        if self.agent.max_iterations > 200 {
            warnings.push(format!(
                "agent.max_iterations = {} is unusually high",
                self.agent.max_iterations
            ));
        }
        if self.autoreply.throttle_ms < 100 {
            warnings.push(format!(
                "autoreply.throttle_ms = {} may flood channel rate limits",
                self.autoreply.throttle_ms
            ));
        }
        for (id, ch) in &self.channels {
            if ch.enabled && ch.kind.is_empty() {
                return Err(format!("channels.{id}.kind must be set when enabled"));
            }
            if ch.enabled && ch.token.is_none() {
                warnings.push(format!("channels.{id} is enabled but has no token"));
            }
        }

        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ValetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cron.default_profile, "default");
        assert_eq!(config.autoreply.throttle_ms, 500);
    }

    #[test]
    fn test_empty_model_rejected() {
        let mut config = ValetConfig::default();
        config.agent.model = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let mut config = ValetConfig::default();
        config.agent.max_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_enabled_channel_without_token_warns() {
        let mut config = ValetConfig::default();
        config.channels.insert(
            "telegram".into(),
            ChannelConfig {
                enabled: true,
                kind: "telegram".into(),
                token: None,
            },
        );
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.contains("telegram")));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let raw = r#"
            [agent]
            model = "mock/test-model"
            max_iterations = 5
        "#;
        let config: ValetConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.agent.model, "mock/test-model");
        assert_eq!(config.agent.max_iterations, 5);
        assert_eq!(config.agent.max_tokens, 8192);
        assert_eq!(config.cron.tick_secs, 10);
    }
}
