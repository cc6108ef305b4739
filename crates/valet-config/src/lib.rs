//! # valet-config
//!
//! Configuration loading and validation. Maps `valet.toml` into typed
//! structs with sensible defaults, applies environment overrides, and
//! fails fast on invalid values so no run is ever started from a broken
//! configuration.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    AgentConfig, AutoReplyConfig, ChannelConfig, CronConfig, LoggingConfig, ValetConfig,
    WorkspaceConfig,
};
