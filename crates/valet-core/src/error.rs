use thiserror::Error;

/// Unified error type for the entire Valet runtime.
#[derive(Error, Debug)]
pub enum ValetError {
    // ── Provider errors — terminal for the loop that hit them ──
    #[error("provider error: {0}")]
    Provider(String),

    #[error("provider rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("model not found: {0}")]
    ModelNotFound(String),

    // ── Tool errors — local to one call, recoverable ───────────
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool execution failed: {tool}: {reason}")]
    ToolExecution { tool: String, reason: String },

    // ── Configuration errors — fail fast, no run is started ────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Channel errors ─────────────────────────────────────────
    #[error("channel error: {channel}: {reason}")]
    Channel { channel: String, reason: String },

    #[error("channel not connected: {0}")]
    ChannelNotConnected(String),

    // ── Runner errors ──────────────────────────────────────────
    #[error("agent error: {0}")]
    Agent(String),

    #[error("session not found: {0}")]
    SessionNotFound(uuid::Uuid),

    #[error("cron job not found: {0}")]
    JobNotFound(uuid::Uuid),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ValetError>;
