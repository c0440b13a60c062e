//! Named providers with a default and a traced `chat` entry point.

use std::sync::{Arc, PoisonError, RwLock};

use reef_trace::{SpanContext, SpanKind, SpanStatus, Tracer};

use crate::error::LlmError;
use crate::provider::{ChatMessage, Generation, LlmProvider, ToolSpec};

#[derive(Default)]
struct Providers {
    entries: Vec<Arc<dyn LlmProvider>>,
    default: Option<String>,
}

/// Selects a provider by name, falling back to the default, which is the
/// first one registered unless changed.
pub struct ProviderRegistry {
    providers: RwLock<Providers>,
    tracer: Tracer,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .field("default", &self.default_name())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new(tracer: Tracer) -> Self {
        Self {
            providers: RwLock::new(Providers::default()),
            tracer,
        }
    }

    /// Adds or replaces a provider by name.
    pub fn register(&self, provider: Arc<dyn LlmProvider>) {
        let mut providers = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let name = provider.name().to_string();
        providers.entries.retain(|p| p.name() != name);
        providers.entries.push(provider);
        if providers.default.is_none() {
            providers.default = Some(name.clone());
        }
        tracing::info!(provider = %name, "llm provider registered");
    }

    /// # Errors
    ///
    /// `UnknownProvider` when no provider has that name.
    pub fn set_default(&self, name: &str) -> Result<(), LlmError> {
        let mut providers = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !providers.entries.iter().any(|p| p.name() == name) {
            return Err(LlmError::UnknownProvider(name.to_string()));
        }
        providers.default = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<String> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .default
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .is_empty()
    }

    /// The named provider, or the default when `name` is `None`.
    ///
    /// # Errors
    ///
    /// `NoProvider` on an empty registry, `UnknownProvider` for a bad name.
    pub fn get(&self, name: Option<&str>) -> Result<Arc<dyn LlmProvider>, LlmError> {
        let providers = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let wanted = match name {
            Some(name) => name,
            None => providers.default.as_deref().ok_or(LlmError::NoProvider)?,
        };
        providers
            .entries
            .iter()
            .find(|p| p.name() == wanted)
            .cloned()
            .ok_or_else(|| LlmError::UnknownProvider(wanted.to_string()))
    }

    /// Runs one chat completion inside an `llm.chat` span.
    ///
    /// # Errors
    ///
    /// Provider selection errors from [`ProviderRegistry::get`] and whatever
    /// the provider returns.
    pub async fn chat(
        &self,
        provider: Option<&str>,
        messages: &[ChatMessage],
        tools: Option<&[ToolSpec]>,
        parent: Option<&SpanContext>,
    ) -> Result<Generation, LlmError> {
        let target = self.get(provider)?;

        let mut span = self.tracer.start_span("llm.chat", SpanKind::Client, parent);
        span.set_attribute("llm.provider", target.name());
        span.set_attribute("llm.model", target.model());
        span.set_attribute("llm.message_count", messages.len());
        span.set_attribute("llm.tool_count", tools.map_or(0, <[ToolSpec]>::len));

        match target.generate(messages, tools).await {
            Ok(generation) => {
                span.set_attribute("llm.prompt_tokens", generation.prompt_tokens);
                span.set_attribute("llm.completion_tokens", generation.completion_tokens);
                span.set_status(SpanStatus::Ok);
                Ok(generation)
            }
            Err(e) => {
                span.record_exception(&e);
                span.set_status(SpanStatus::Error);
                tracing::warn!(provider = %target.name(), error = %e, "llm chat failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::static_provider::StaticProvider;
    use reef_trace::{EnableMode, ObservabilityConfig, TraceStore};
    use serde_json::json;

    fn traced() -> (ProviderRegistry, TraceStore) {
        let store = TraceStore::in_memory().expect("should open in-memory store");
        let config = ObservabilityConfig {
            enabled: EnableMode::On,
            ..ObservabilityConfig::default()
        };
        let tracer = Tracer::with_store(&config, store.clone()).expect("should build tracer");
        (ProviderRegistry::new(tracer), store)
    }

    #[tokio::test]
    async fn empty_registry_has_no_provider() {
        let registry = ProviderRegistry::new(Tracer::disabled());
        let err = registry
            .chat(None, &[ChatMessage::user("hi")], None, None)
            .await
            .expect_err("chat should fail");
        assert!(matches!(err, LlmError::NoProvider));
    }

    #[tokio::test]
    async fn first_registered_is_default() {
        let registry = ProviderRegistry::new(Tracer::disabled());
        registry.register(Arc::new(StaticProvider::new("one").with_replies(["from one"])));
        registry.register(Arc::new(StaticProvider::new("two").with_replies(["from two"])));
        assert_eq!(registry.default_name().as_deref(), Some("one"));

        let reply = registry
            .chat(None, &[ChatMessage::user("hi")], None, None)
            .await
            .expect("chat should succeed");
        assert_eq!(reply.content, "from one");

        let reply = registry
            .chat(Some("two"), &[ChatMessage::user("hi")], None, None)
            .await
            .expect("chat should succeed");
        assert_eq!(reply.provider, "two");

        registry.set_default("two").expect("two should exist");
        assert_eq!(registry.default_name().as_deref(), Some("two"));
        assert!(matches!(
            registry.set_default("three"),
            Err(LlmError::UnknownProvider(_))
        ));
        assert!(matches!(
            registry.get(Some("three")),
            Err(LlmError::UnknownProvider(_))
        ));
    }

    #[tokio::test]
    async fn chat_records_token_usage() {
        let (registry, store) = traced();
        let provider = Arc::new(
            StaticProvider::new("scripted")
                .with_model("tiny")
                .with_replies(["three word reply"]),
        );
        registry.register(provider.clone());
        let parent = SpanContext::new_root();
        let tools = [ToolSpec {
            name: "search".into(),
            description: "web search".into(),
            parameters: json!({"type": "object"}),
        }];

        let reply = registry
            .chat(
                None,
                &[ChatMessage::system("be brief"), ChatMessage::user("what is a reef")],
                Some(&tools),
                Some(&parent),
            )
            .await
            .expect("chat should succeed");
        assert_eq!(reply.prompt_tokens, 6);
        assert_eq!(reply.completion_tokens, 3);
        assert_eq!(provider.last_tools(), vec!["search".to_string()]);

        let spans = store.get_trace(&parent.trace_id).expect("should load trace");
        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        assert_eq!(span.name, "llm.chat");
        assert_eq!(span.kind, SpanKind::Client);
        assert_eq!(span.attribute_str("llm.provider"), Some("scripted"));
        assert_eq!(span.attribute_str("llm.model"), Some("tiny"));
        assert_eq!(span.attribute("llm.prompt_tokens"), Some(&json!(6)));
        assert_eq!(span.attribute("llm.completion_tokens"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn provider_errors_mark_span() {
        let (registry, store) = traced();
        registry.register(Arc::new(StaticProvider::new("s")));
        let parent = SpanContext::new_root();

        let err = registry
            .chat(None, &[], None, Some(&parent))
            .await
            .expect_err("empty input should fail");
        assert!(matches!(err, LlmError::InvalidInput(_)));

        let spans = store.get_trace(&parent.trace_id).expect("should load trace");
        assert_eq!(spans[0].status, SpanStatus::Error);
        assert_eq!(spans[0].events[0].name, "exception");
    }

    #[tokio::test]
    async fn static_provider_echoes_without_script() {
        let provider = StaticProvider::new("echo");
        let reply = provider
            .generate(&[ChatMessage::user("ping"), ChatMessage::assistant("x")], None)
            .await
            .expect("should generate");
        assert_eq!(reply.content, "ping");
        assert_eq!(provider.calls(), 1);
    }
}
