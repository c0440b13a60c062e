//! The provider contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::reference::DataReference;

/// The family of store a provider fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    Relational,
    KeyValue,
    Object,
    Vector,
    Filesystem,
    Search,
}

impl StorageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::KeyValue => "key_value",
            Self::Object => "object",
            Self::Vector => "vector",
            Self::Filesystem => "filesystem",
            Self::Search => "search",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "relational" => Some(Self::Relational),
            "key_value" => Some(Self::KeyValue),
            "object" => Some(Self::Object),
            "vector" => Some(Self::Vector),
            "filesystem" => Some(Self::Filesystem),
            "search" => Some(Self::Search),
            _ => None,
        }
    }
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub name: String,
    pub description: String,
    pub storage_type: StorageType,
    /// Writes and deletes are refused.
    pub read_only: bool,
}

/// Query shapes a provider may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    /// Does the resource exist.
    Exists,
    /// How many resources match the resource prefix.
    Count,
    /// Resources whose value contains `params.text`.
    Search,
}

impl QueryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exists => "exists",
            Self::Count => "count",
            Self::Search => "search",
        }
    }
}

/// The outcome of every provider operation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StorageResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub data_reference: Option<DataReference>,
    pub metadata: Map<String, Value>,
}

impl StorageResult {
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_reference(mut self, reference: DataReference) -> Self {
        self.data_reference = Some(reference);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// One store behind the uniform operation set.
///
/// Failures are reported inside the returned [`StorageResult`], never as a
/// panic or a separate error channel.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn metadata(&self) -> &ProviderMetadata;

    async fn connect(&self) -> StorageResult;

    async fn disconnect(&self) -> StorageResult;

    /// Writes `data` under `resource`; the result carries a reference to it.
    async fn store(&self, resource: &str, data: Value) -> StorageResult;

    async fn retrieve(&self, resource: &str) -> StorageResult;

    async fn query(&self, resource: &str, kind: QueryKind, params: Value) -> StorageResult;

    async fn delete(&self, resource: &str) -> StorageResult;

    /// Resource ids starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> StorageResult;
}
