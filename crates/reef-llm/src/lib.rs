//! Language model access for agents.
//!
//! Vendor adapters implement [`LlmProvider`]; agents reach them through a
//! [`ProviderRegistry`], whose `chat` call is traced as an `llm.chat` span.

mod error;
mod provider;
mod registry;
mod static_provider;

pub use error::LlmError;
pub use provider::{ChatMessage, Generation, LlmProvider, Role, ToolCall, ToolSpec};
pub use registry::ProviderRegistry;
pub use static_provider::StaticProvider;
