//! Provider registry with traced operations.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use reef_trace::{SpanContext, SpanKind, SpanStatus, Tracer};
use serde::Serialize;
use serde_json::Value;

use crate::provider::{QueryKind, StorageProvider, StorageResult};
use crate::reference::DataReference;

/// Counters for [`StorageRegistry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub providers: usize,
    pub operations: u64,
    pub errors: u64,
}

/// Routes storage operations to providers by name.
///
/// Every operation opens a `storage.<op>` client span, parented on the
/// caller's trace context when one is given.
pub struct StorageRegistry {
    providers: RwLock<BTreeMap<String, Arc<dyn StorageProvider>>>,
    tracer: Tracer,
    operations: AtomicU64,
    errors: AtomicU64,
}

impl std::fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageRegistry")
            .field("providers", &self.names())
            .finish_non_exhaustive()
    }
}

impl StorageRegistry {
    pub fn new(tracer: Tracer) -> Self {
        Self {
            providers: RwLock::new(BTreeMap::new()),
            tracer,
            operations: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Adds a provider, returning the one it replaced.
    pub fn register(
        &self,
        provider: Arc<dyn StorageProvider>,
    ) -> Option<Arc<dyn StorageProvider>> {
        let name = provider.metadata().name.clone();
        tracing::info!(provider = %name, storage_type = %provider.metadata().storage_type, "storage provider registered");
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, provider)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StorageProvider>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn StorageProvider>> {
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Connects every provider; returns the names that failed.
    pub async fn connect_all(&self) -> Vec<String> {
        let providers: Vec<Arc<dyn StorageProvider>> = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut failed = Vec::new();
        for provider in providers {
            let result = provider.connect().await;
            if !result.success {
                let name = provider.metadata().name.clone();
                tracing::warn!(provider = %name, error = ?result.error, "storage provider failed to connect");
                self.errors.fetch_add(1, Ordering::Relaxed);
                failed.push(name);
            }
        }
        failed
    }

    pub async fn store(
        &self,
        provider: &str,
        resource: &str,
        data: Value,
        parent: Option<&SpanContext>,
    ) -> StorageResult {
        let Some(target) = self.get(provider) else {
            return self.unknown("store", provider, resource, parent);
        };
        let mut span = self.start("store", &target, resource, parent);
        let result = target.store(resource, data).await;
        self.finish(&mut span, "store", provider, resource, result)
    }

    pub async fn retrieve(
        &self,
        provider: &str,
        resource: &str,
        parent: Option<&SpanContext>,
    ) -> StorageResult {
        let Some(target) = self.get(provider) else {
            return self.unknown("retrieve", provider, resource, parent);
        };
        let mut span = self.start("retrieve", &target, resource, parent);
        let result = target.retrieve(resource).await;
        self.finish(&mut span, "retrieve", provider, resource, result)
    }

    pub async fn query(
        &self,
        provider: &str,
        resource: &str,
        kind: QueryKind,
        params: Value,
        parent: Option<&SpanContext>,
    ) -> StorageResult {
        let Some(target) = self.get(provider) else {
            return self.unknown("query", provider, resource, parent);
        };
        let mut span = self.start("query", &target, resource, parent);
        span.set_attribute("storage.query", kind.as_str());
        let result = target.query(resource, kind, params).await;
        self.finish(&mut span, "query", provider, resource, result)
    }

    pub async fn delete(
        &self,
        provider: &str,
        resource: &str,
        parent: Option<&SpanContext>,
    ) -> StorageResult {
        let Some(target) = self.get(provider) else {
            return self.unknown("delete", provider, resource, parent);
        };
        let mut span = self.start("delete", &target, resource, parent);
        let result = target.delete(resource).await;
        self.finish(&mut span, "delete", provider, resource, result)
    }

    pub async fn list(
        &self,
        provider: &str,
        prefix: &str,
        parent: Option<&SpanContext>,
    ) -> StorageResult {
        let Some(target) = self.get(provider) else {
            return self.unknown("list", provider, prefix, parent);
        };
        let mut span = self.start("list", &target, prefix, parent);
        let result = target.list(prefix).await;
        self.finish(&mut span, "list", provider, prefix, result)
    }

    /// Fetches the data a reference points to.
    pub async fn resolve(
        &self,
        reference: &DataReference,
        parent: Option<&SpanContext>,
    ) -> StorageResult {
        self.retrieve(&reference.provider, &reference.resource_id, parent)
            .await
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            providers: self
                .providers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            operations: self.operations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn start(
        &self,
        op: &str,
        target: &Arc<dyn StorageProvider>,
        resource: &str,
        parent: Option<&SpanContext>,
    ) -> reef_trace::Span {
        self.operations.fetch_add(1, Ordering::Relaxed);
        let meta = target.metadata();
        let mut span = self
            .tracer
            .start_span(&format!("storage.{op}"), SpanKind::Client, parent);
        span.set_attribute("storage.provider", meta.name.as_str());
        span.set_attribute("storage.type", meta.storage_type.as_str());
        span.set_attribute("storage.resource", resource);
        span
    }

    fn finish(
        &self,
        span: &mut reef_trace::Span,
        op: &str,
        provider: &str,
        resource: &str,
        result: StorageResult,
    ) -> StorageResult {
        if result.success {
            span.set_status(SpanStatus::Ok);
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
            let message = result.error.as_deref().unwrap_or("unknown storage error");
            span.set_attribute("error.message", message);
            span.set_status(SpanStatus::Error);
            tracing::debug!(op, provider, resource, error = message, "storage operation failed");
        }
        span.end();
        result
    }

    fn unknown(
        &self,
        op: &str,
        provider: &str,
        resource: &str,
        parent: Option<&SpanContext>,
    ) -> StorageResult {
        self.operations.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
        let mut span = self
            .tracer
            .start_span(&format!("storage.{op}"), SpanKind::Client, parent);
        span.set_attribute("storage.provider", provider);
        span.set_attribute("storage.resource", resource);
        span.set_status(SpanStatus::Error);
        StorageResult::failure(format!("unknown storage provider: {provider}"))
    }
}
