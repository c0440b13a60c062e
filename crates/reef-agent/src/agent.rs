//! Agent definitions and the adapter that runs them on a [`Reef`].
//!
//! An [`Agent`] pairs an [`AgentConfig`] with a [`Handler`]. Registering it
//! subscribes one dispatch function on the agent's own channel, the reef's
//! default channel and the declared channel. Each delivery runs inside an
//! `agent.<name>.execute` span; a non-empty mapping returned by the handler
//! is broadcast back onto the default channel as this agent.

use std::any::Any;
use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use reef_backend::{agent_channel, handler_fn, HandlerError, SporeHandler};
use reef_core::{OutgoingSpore, Reef, SubscribeOptions};
use reef_memory::{InMemoryMemory, Memory};
use reef_trace::{SpanContext, SpanKind, SpanStatus};
use reef_types::{Knowledge, Spore};
use serde::{Deserialize, Serialize};

use crate::context::{AgentContext, Services};
use crate::error::AgentError;

/// What a handler returns: a mapping to broadcast, or nothing.
pub type HandlerResult = Result<Option<Knowledge>, HandlerError>;

type SyncFn = dyn Fn(&Spore, &AgentContext) -> HandlerResult + Send + Sync;
type AsyncFn = dyn Fn(Spore, AgentContext) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// The code an agent runs per spore.
///
/// Synchronous handlers run on the blocking pool so they may call blocking
/// collaborators freely.
#[derive(Clone)]
pub enum Handler {
    Sync(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
}

impl Handler {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&Spore, &AgentContext) -> HandlerResult + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    pub fn async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Spore, AgentContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self::Async(Arc::new(move |spore, ctx| f(spore, ctx).boxed()))
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Handler::Sync"),
            Self::Async(_) => f.write_str("Handler::Async"),
        }
    }
}

fn default_channel() -> String {
    "main".into()
}

/// Declarative part of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub name: String,

    /// Extra channel to listen on besides the agent's own and the default.
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Accepted `knowledge.type` values; absent accepts everything.
    #[serde(default)]
    pub responds_to: Option<BTreeSet<String>>,

    /// Give the agent an in-process memory.
    #[serde(default)]
    pub memory: bool,

    /// Tool names the agent may call; empty allows every visible tool.
    #[serde(default)]
    pub tools: Vec<String>,

    #[serde(default)]
    pub description: Option<String>,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channel: default_channel(),
            responds_to: None,
            memory: false,
            tools: Vec::new(),
            description: None,
        }
    }

    /// Names become routing keys and channel names, so they may not carry
    /// separators, wildcards or whitespace.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` describing the first problem found.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.name.is_empty() {
            return Err(AgentError::InvalidConfig("agent name is empty".into()));
        }
        if self
            .name
            .chars()
            .any(|c| matches!(c, '.' | '*' | '#') || c.is_whitespace())
        {
            return Err(AgentError::InvalidConfig(format!(
                "agent name {:?} may not contain '.', '*', '#' or whitespace",
                self.name
            )));
        }
        if self.channel.trim().is_empty() {
            return Err(AgentError::InvalidConfig(format!(
                "agent {} has an empty channel",
                self.name
            )));
        }
        Ok(())
    }
}

/// A named handler with its configuration and optional memory.
pub struct Agent {
    config: AgentConfig,
    handler: Handler,
    memory: Option<Arc<dyn Memory>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("config", &self.config)
            .field("handler", &self.handler)
            .field("memory", &self.memory.is_some())
            .finish()
    }
}

impl Agent {
    /// # Errors
    ///
    /// Returns `InvalidConfig` when the config fails validation.
    pub fn new(config: AgentConfig, handler: Handler) -> Result<Self, AgentError> {
        Self::with_memory(config, handler, None)
    }

    fn with_memory(
        mut config: AgentConfig,
        handler: Handler,
        memory: Option<Arc<dyn Memory>>,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        if config.responds_to.as_ref().is_some_and(BTreeSet::is_empty) {
            config.responds_to = None;
        }
        let memory = memory.or_else(|| {
            config
                .memory
                .then(|| Arc::new(InMemoryMemory::new()) as Arc<dyn Memory>)
        });
        Ok(Self {
            config,
            handler,
            memory,
        })
    }

    pub fn builder(name: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn memory(&self) -> Option<&Arc<dyn Memory>> {
        self.memory.as_ref()
    }

    pub(crate) fn allows_tool(&self, tool: &str) -> bool {
        self.config.tools.is_empty() || self.config.tools.iter().any(|t| t == tool)
    }

    /// Channels the agent listens on: its own, `default_channel`, then the
    /// declared one, without duplicates.
    pub fn channels(&self, default_channel: &str) -> Vec<String> {
        let mut channels: Vec<String> = Vec::with_capacity(3);
        for channel in [
            agent_channel(self.name()),
            default_channel.to_string(),
            self.config.channel.clone(),
        ] {
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }
        channels
    }

    /// Subscribes the agent on `reef` without shared services.
    ///
    /// # Errors
    ///
    /// See [`Agent::register_with`].
    pub async fn register(self: &Arc<Self>, reef: &Reef) -> Result<(), AgentError> {
        self.register_with(reef, Services::default()).await
    }

    /// Subscribes the agent on every channel it listens on, replacing any
    /// earlier registration under the same name.
    ///
    /// # Errors
    ///
    /// Returns `Reef` when the backend refuses a subscription.
    pub async fn register_with(
        self: &Arc<Self>,
        reef: &Reef,
        services: Services,
    ) -> Result<(), AgentError> {
        let channels = self.channels(&reef.config().default_channel);
        for channel in &channels {
            let options = SubscribeOptions {
                responds_to: self.config.responds_to.clone(),
                ..SubscribeOptions::default()
            };
            reef.subscribe(
                channel,
                self.name(),
                self.spore_handler(reef, services.clone()),
                options,
            )
            .await?;
        }
        tracing::info!(agent = %self.name(), channels = ?channels, "agent registered");
        Ok(())
    }

    /// Removes the agent's subscriptions from `reef`.
    ///
    /// # Errors
    ///
    /// Returns `Reef` when the backend fails to cancel a subscription.
    pub async fn unregister(&self, reef: &Reef) -> Result<(), AgentError> {
        for channel in self.channels(&reef.config().default_channel) {
            reef.unsubscribe(&channel, self.name()).await?;
        }
        Ok(())
    }

    fn spore_handler(self: &Arc<Self>, reef: &Reef, services: Services) -> SporeHandler {
        let agent = Arc::clone(self);
        // The backend holding this handler is owned by the reef.
        let reef = reef.downgrade();
        handler_fn(move |spore| {
            let agent = Arc::clone(&agent);
            let reef = reef.upgrade();
            let services = services.clone();
            async move {
                let Some(reef) = reef else {
                    return Ok(());
                };
                agent
                    .dispatch(spore, reef, services)
                    .await
                    .map_err(|e| Box::new(e) as HandlerError)
            }
        })
    }

    /// Runs the handler for one delivered spore inside its execute span and
    /// broadcasts a non-empty result.
    ///
    /// # Errors
    ///
    /// `Handler` when the handler fails, `Panicked` when it panics.
    pub async fn dispatch(
        self: Arc<Self>,
        spore: Spore,
        reef: Reef,
        services: Services,
    ) -> Result<(), AgentError> {
        let parent = SpanContext::extract(&spore.metadata);
        let mut span = reef.tracer().start_span(
            &format!("agent.{}.execute", self.name()),
            SpanKind::Server,
            parent.as_ref(),
        );
        span.set_attribute("agent.name", self.name());
        span.set_attribute("spore.id", spore.id());
        span.set_attribute("spore.type", spore.spore_type.as_str());
        span.set_attribute("spore.from", spore.from_agent.as_str());
        if let Some(channel) = spore.channel() {
            span.set_attribute("reef.channel", channel);
        }

        let trace = span.context().or(parent);
        let ctx = AgentContext::new(
            Arc::clone(&self),
            &spore,
            trace.clone(),
            reef.clone(),
            services,
        );
        tracing::debug!(agent = %self.name(), spore_id = %spore.id(), from = %spore.from_agent, "handling spore");

        match self.invoke(spore, ctx).await {
            Ok(Some(knowledge)) if !knowledge.is_empty() => {
                let outgoing = OutgoingSpore::broadcast(self.name(), knowledge).parent(trace);
                if let Err(e) = reef.publish(outgoing) {
                    tracing::warn!(agent = %self.name(), error = %e, "failed to broadcast handler result");
                }
                span.set_status(SpanStatus::Ok);
                Ok(())
            }
            Ok(_) => {
                span.set_status(SpanStatus::Ok);
                Ok(())
            }
            Err(e) => {
                span.record_exception(&e);
                span.set_status(SpanStatus::Error);
                tracing::warn!(agent = %self.name(), error = %e, "handler failed");
                Err(e)
            }
        }
    }

    async fn invoke(&self, spore: Spore, ctx: AgentContext) -> Result<Option<Knowledge>, AgentError> {
        let agent = self.name().to_string();
        match &self.handler {
            Handler::Sync(f) => {
                let f = Arc::clone(f);
                match tokio::task::spawn_blocking(move || f(&spore, &ctx)).await {
                    Ok(result) => result.map_err(|source| AgentError::Handler { agent, source }),
                    Err(join) if join.is_panic() => Err(AgentError::Panicked {
                        agent,
                        message: panic_message(join.into_panic()),
                    }),
                    Err(_) => Err(AgentError::Panicked {
                        agent,
                        message: "handler task was cancelled".into(),
                    }),
                }
            }
            Handler::Async(f) => {
                let f = Arc::clone(f);
                match AssertUnwindSafe(async move { f(spore, ctx).await })
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result.map_err(|source| AgentError::Handler { agent, source }),
                    Err(payload) => Err(AgentError::Panicked {
                        agent,
                        message: panic_message(payload),
                    }),
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".into()
    }
}

/// Builder returned by [`Agent::builder`].
pub struct AgentBuilder {
    config: AgentConfig,
    handler: Option<Handler>,
    memory: Option<Arc<dyn Memory>>,
}

impl std::fmt::Debug for AgentBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBuilder")
            .field("config", &self.config)
            .field("handler", &self.handler)
            .field("memory", &self.memory.is_some())
            .finish()
    }
}

impl AgentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: AgentConfig::new(name),
            handler: None,
            memory: None,
        }
    }

    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.config.channel = channel.into();
        self
    }

    pub fn responds_to<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.responds_to = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Gives the agent its own in-process memory.
    pub fn memory(mut self, enabled: bool) -> Self {
        self.config.memory = enabled;
        self
    }

    /// Gives the agent `memory` instead of an in-process one.
    pub fn with_memory(mut self, memory: Arc<dyn Memory>) -> Self {
        self.config.memory = true;
        self.memory = Some(memory);
        self
    }

    pub fn tool(mut self, name: impl Into<String>) -> Self {
        self.config.tools.push(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.config.description = Some(description.into());
        self
    }

    pub fn handler(mut self, handler: Handler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// # Errors
    ///
    /// Returns `InvalidConfig` without a handler or for an invalid config.
    pub fn build(self) -> Result<Agent, AgentError> {
        let handler = self.handler.ok_or_else(|| {
            AgentError::InvalidConfig(format!("agent {} has no handler", self.config.name))
        })?;
        Agent::with_memory(self.config, handler, self.memory)
    }
}
