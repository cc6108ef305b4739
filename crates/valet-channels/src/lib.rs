//! # valet-channels
//!
//! The contract between the engine and external messaging platforms.
//! Concrete platform adapters (Telegram, Slack, ...) live outside this
//! workspace; the engine only depends on the `Channel` trait, and tests
//! run against `MockChannel`.

pub mod adapter;
pub mod mock;

pub use adapter::{Channel, IncomingMessage, StreamingReply};
pub use mock::MockChannel;
