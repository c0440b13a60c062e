//! Error types for agents, tools and the runner.

use reef_backend::{BackendError, HandlerError};
use reef_core::ReefError;
use reef_llm::LlmError;
use reef_memory::MemoryError;
use reef_trace::TraceError;

/// Errors raised by agent definitions and [`crate::AgentContext`] calls.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("invalid agent config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Reef(#[from] ReefError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("agent {0} has no memory")]
    MemoryDisabled(String),

    #[error("no llm registry available to agent {0}")]
    LlmUnavailable(String),

    #[error("no storage registry available to agent {0}")]
    StorageUnavailable(String),

    #[error("handler of agent {agent} failed: {source}")]
    Handler {
        agent: String,
        #[source]
        source: HandlerError,
    },

    #[error("handler of agent {agent} panicked: {message}")]
    Panicked { agent: String, message: String },
}

/// Errors raised by tool lookup and invocation.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("invalid arguments for tool {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("tool {tool} failed: {message}")]
    Failed { tool: String, message: String },
}

/// Errors raised while starting or stopping an [`crate::AgentRunner`].
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("tracing error: {0}")]
    Trace(#[from] TraceError),

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("reef error: {0}")]
    Reef(#[from] ReefError),
}
