//! # valet-llm
//!
//! Abstraction layer over LLM providers. The engine is protocol-agnostic:
//! each provider adapter normalizes its wire format into the `StreamEvent`
//! sequence defined here, and the agent loop owns all accumulation.

pub mod mock;
pub mod provider;

pub use mock::{MockProvider, MockTurn};
pub use provider::{LlmProvider, LlmRequest, StopReason, StreamEvent, Usage};
