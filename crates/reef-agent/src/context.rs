//! What a handler sees while it processes one spore.

use std::sync::Arc;
use std::time::Duration;

use reef_core::{OutgoingSpore, Reef};
use reef_llm::{ChatMessage, Generation, ProviderRegistry, ToolSpec};
use reef_memory::{Memory, MemoryEntry, MemoryType};
use reef_storage::{StorageRegistry, StorageResult};
use reef_trace::SpanContext;
use reef_types::{Knowledge, Spore};
use serde_json::Value;

use crate::agent::Agent;
use crate::error::{AgentError, ToolError};
use crate::tools::{Tool, ToolRegistry};

/// Shared collaborators handed to every agent a runner registers.
#[derive(Clone, Default)]
pub struct Services {
    pub llm: Option<Arc<ProviderRegistry>>,
    pub tools: Option<Arc<ToolRegistry>>,
    pub storage: Option<Arc<StorageRegistry>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_llm(mut self, llm: Arc<ProviderRegistry>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_storage(mut self, storage: Arc<StorageRegistry>) -> Self {
        self.storage = Some(storage);
        self
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("llm", &self.llm.is_some())
            .field("tools", &self.tools.is_some())
            .field("storage", &self.storage.is_some())
            .finish()
    }
}

/// Handle passed to a handler for the spore it is processing.
///
/// Everything published through the context joins the trace of the
/// handler's `agent.<name>.execute` span.
#[derive(Clone)]
pub struct AgentContext {
    agent: Arc<Agent>,
    spore_id: String,
    trace: Option<SpanContext>,
    reef: Reef,
    services: Services,
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("agent", &self.agent.name())
            .field("spore_id", &self.spore_id)
            .field("trace", &self.trace)
            .finish_non_exhaustive()
    }
}

impl AgentContext {
    pub(crate) fn new(
        agent: Arc<Agent>,
        spore: &Spore,
        trace: Option<SpanContext>,
        reef: Reef,
        services: Services,
    ) -> Self {
        Self {
            agent,
            spore_id: spore.id().to_string(),
            trace,
            reef,
            services,
        }
    }

    pub fn name(&self) -> &str {
        self.agent.name()
    }

    /// Id of the spore being handled.
    pub fn spore_id(&self) -> &str {
        &self.spore_id
    }

    /// Context of the running execute span, if traced.
    pub fn trace_context(&self) -> Option<&SpanContext> {
        self.trace.as_ref()
    }

    pub fn reef(&self) -> &Reef {
        &self.reef
    }

    // ── messaging ────────────────────────────────────────────────────

    fn publish(&self, outgoing: OutgoingSpore) -> Result<String, AgentError> {
        Ok(self.reef.publish(outgoing.parent(self.trace.clone()))?)
    }

    /// # Errors
    ///
    /// See [`Reef::publish`].
    pub fn send(&self, to: &str, knowledge: Knowledge) -> Result<String, AgentError> {
        self.publish(OutgoingSpore::direct(self.name(), to, knowledge))
    }

    /// # Errors
    ///
    /// See [`Reef::publish`].
    pub fn broadcast(&self, knowledge: Knowledge) -> Result<String, AgentError> {
        self.publish(OutgoingSpore::broadcast(self.name(), knowledge))
    }

    /// # Errors
    ///
    /// See [`Reef::publish`].
    pub fn broadcast_on(&self, knowledge: Knowledge, channel: &str) -> Result<String, AgentError> {
        self.publish(OutgoingSpore::broadcast(self.name(), knowledge).channel(channel))
    }

    /// Answers `spore` with a response addressed to its sender.
    ///
    /// # Errors
    ///
    /// See [`Reef::publish`].
    pub fn reply(&self, spore: &Spore, knowledge: Knowledge) -> Result<String, AgentError> {
        self.publish(OutgoingSpore::response(
            self.name(),
            &spore.from_agent,
            knowledge,
            spore.id(),
        ))
    }

    /// Sends a request to `to` and waits up to `timeout` for its response.
    ///
    /// # Errors
    ///
    /// See [`Reef::request`].
    pub async fn request(
        &self,
        to: &str,
        knowledge: Knowledge,
        timeout: Duration,
    ) -> Result<Option<Spore>, AgentError> {
        let outgoing = OutgoingSpore::request(self.name(), to, knowledge).parent(self.trace.clone());
        Ok(self.reef.request_with(outgoing, timeout).await?)
    }

    // ── memory ───────────────────────────────────────────────────────

    pub fn memory(&self) -> Option<&Arc<dyn Memory>> {
        self.agent.memory()
    }

    fn require_memory(&self) -> Result<&Arc<dyn Memory>, AgentError> {
        self.memory()
            .ok_or_else(|| AgentError::MemoryDisabled(self.name().to_string()))
    }

    /// Stores a short-term memory.
    ///
    /// # Errors
    ///
    /// `MemoryDisabled` when the agent has no memory, otherwise see
    /// [`Memory::remember`].
    pub fn remember(&self, content: &str, importance: f64) -> Result<String, AgentError> {
        self.remember_as(content, importance, MemoryType::ShortTerm)
    }

    /// # Errors
    ///
    /// See [`AgentContext::remember`].
    pub fn remember_as(
        &self,
        content: &str,
        importance: f64,
        memory_type: MemoryType,
    ) -> Result<String, AgentError> {
        Ok(self
            .require_memory()?
            .remember(content, importance, memory_type)?)
    }

    /// # Errors
    ///
    /// `MemoryDisabled` when the agent has no memory.
    pub fn recall(&self, query: &str, limit: usize) -> Result<Vec<MemoryEntry>, AgentError> {
        Ok(self.require_memory()?.recall(query, limit)?)
    }

    // ── llm and tools ────────────────────────────────────────────────

    /// Tools this agent may call: its own and shared ones, narrowed to the
    /// configured list when it has one.
    pub fn tools(&self) -> Vec<Tool> {
        let Some(registry) = &self.services.tools else {
            return Vec::new();
        };
        registry
            .tools_for_agent(self.name())
            .into_iter()
            .filter(|tool| self.agent.allows_tool(&tool.name))
            .collect()
    }

    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.tools().iter().map(Tool::spec).collect()
    }

    /// # Errors
    ///
    /// `Tool(NotFound)` for a tool this agent cannot see, otherwise see
    /// [`Tool::invoke`].
    pub fn invoke_tool(&self, name: &str, args: &Value) -> Result<Value, AgentError> {
        let tool = self
            .tools()
            .into_iter()
            .find(|tool| tool.name == name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        Ok(tool.invoke(args)?)
    }

    /// Runs a chat completion on the default provider, offering this
    /// agent's tools.
    ///
    /// # Errors
    ///
    /// `LlmUnavailable` without an LLM registry, otherwise see
    /// [`ProviderRegistry::chat`].
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<Generation, AgentError> {
        let llm = self
            .services
            .llm
            .as_ref()
            .ok_or_else(|| AgentError::LlmUnavailable(self.name().to_string()))?;
        let specs = self.tool_specs();
        let tools = (!specs.is_empty()).then_some(specs.as_slice());
        Ok(llm.chat(None, messages, tools, self.trace.as_ref()).await?)
    }

    // ── storage ──────────────────────────────────────────────────────

    /// # Errors
    ///
    /// `StorageUnavailable` without a storage registry.
    pub fn storage(&self) -> Result<&Arc<StorageRegistry>, AgentError> {
        self.services
            .storage
            .as_ref()
            .ok_or_else(|| AgentError::StorageUnavailable(self.name().to_string()))
    }

    /// Stores `data` under `resource` on `provider`, traced under this
    /// handler's span.
    ///
    /// # Errors
    ///
    /// `StorageUnavailable` without a storage registry. Provider failures
    /// are reported inside the result.
    pub async fn store(
        &self,
        provider: &str,
        resource: &str,
        data: Value,
    ) -> Result<StorageResult, AgentError> {
        Ok(self
            .storage()?
            .store(provider, resource, data, self.trace.as_ref())
            .await)
    }

    /// # Errors
    ///
    /// See [`AgentContext::store`].
    pub async fn retrieve(&self, provider: &str, resource: &str) -> Result<StorageResult, AgentError> {
        Ok(self
            .storage()?
            .retrieve(provider, resource, self.trace.as_ref())
            .await)
    }
}
