//! Process-local key-value provider.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::provider::{ProviderMetadata, QueryKind, StorageProvider, StorageResult, StorageType};
use crate::reference::DataReference;

/// Keeps JSON values in a map keyed by resource id.
#[derive(Debug)]
pub struct MemoryStorageProvider {
    metadata: ProviderMetadata,
    data: RwLock<BTreeMap<String, Value>>,
    connected: AtomicBool,
}

impl MemoryStorageProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), false, BTreeMap::new())
    }

    /// A provider serving `seed` that refuses writes and deletes.
    pub fn read_only(name: impl Into<String>, seed: BTreeMap<String, Value>) -> Self {
        Self::build(name.into(), true, seed)
    }

    fn build(name: String, read_only: bool, seed: BTreeMap<String, Value>) -> Self {
        Self {
            metadata: ProviderMetadata {
                description: format!("in-memory key-value store {name}"),
                name,
                storage_type: StorageType::KeyValue,
                read_only,
            },
            data: RwLock::new(seed),
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn reference(&self, resource: &str) -> DataReference {
        DataReference::new(&self.metadata.name, StorageType::KeyValue, resource)
    }

    fn refuse_write(&self) -> StorageResult {
        StorageResult::failure(format!(
            "provider {} is read-only",
            self.metadata.name
        ))
    }
}

#[async_trait]
impl StorageProvider for MemoryStorageProvider {
    fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    async fn connect(&self) -> StorageResult {
        self.connected.store(true, Ordering::SeqCst);
        StorageResult::ok(None)
    }

    async fn disconnect(&self) -> StorageResult {
        self.connected.store(false, Ordering::SeqCst);
        StorageResult::ok(None)
    }

    async fn store(&self, resource: &str, data: Value) -> StorageResult {
        if self.metadata.read_only {
            return self.refuse_write();
        }
        let replaced = self
            .data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resource.to_string(), data)
            .is_some();
        StorageResult::ok(None)
            .with_reference(self.reference(resource))
            .with_metadata("replaced", replaced)
    }

    async fn retrieve(&self, resource: &str) -> StorageResult {
        let found = self
            .data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource)
            .cloned();
        match found {
            Some(value) => StorageResult::ok(Some(value)).with_reference(self.reference(resource)),
            None => StorageResult::failure(format!("resource not found: {resource}")),
        }
    }

    async fn query(&self, resource: &str, kind: QueryKind, params: Value) -> StorageResult {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        match kind {
            QueryKind::Exists => StorageResult::ok(Some(json!(data.contains_key(resource)))),
            QueryKind::Count => {
                let count = data.keys().filter(|k| k.starts_with(resource)).count();
                StorageResult::ok(Some(json!(count)))
            }
            QueryKind::Search => {
                let Some(text) = params.get("text").and_then(Value::as_str) else {
                    return StorageResult::failure("search requires a string `text` parameter");
                };
                let hits: Vec<&String> = data
                    .iter()
                    .filter(|(k, v)| k.starts_with(resource) && v.to_string().contains(text))
                    .map(|(k, _)| k)
                    .collect();
                StorageResult::ok(Some(json!(hits)))
            }
        }
    }

    async fn delete(&self, resource: &str) -> StorageResult {
        if self.metadata.read_only {
            return self.refuse_write();
        }
        let removed = self
            .data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(resource)
            .is_some();
        if removed {
            StorageResult::ok(None)
        } else {
            StorageResult::failure(format!("resource not found: {resource}"))
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult {
        let keys: Vec<String> = self
            .data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        StorageResult::ok(Some(json!(keys)))
    }
}
