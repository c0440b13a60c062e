//! Agents on top of the Reef dispatch core.
//!
//! An [`Agent`] wraps a handler so that it receives spores from a
//! [`reef_core::Reef`], runs inside a traced `agent.<name>.execute` span and
//! broadcasts whatever mapping it returns. Handlers reach the reef, memory,
//! language models, tools and storage through an [`AgentContext`].
//!
//! [`AgentRunner`] owns a set of agents for the lifetime of a process: it
//! loads a [`RunnerConfig`], connects the backend, registers the agents and
//! shuts everything down on SIGINT, SIGTERM or a [`ShutdownHandle`].

pub mod agent;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod registry;
pub mod runner;
pub mod tools;

pub use agent::{Agent, AgentBuilder, AgentConfig, Handler, HandlerResult};
pub use config::{load_config, ConfigError, LoggingConfig, RunnerConfig};
pub use context::{AgentContext, Services};
pub use error::{AgentError, RunnerError, ToolError};
pub use logging::init_logging;
pub use registry::AgentRegistry;
pub use runner::{AgentRunner, RunnerStats, ShutdownHandle};
pub use tools::{ParamKind, Tool, ToolParameter, ToolRegistry};
