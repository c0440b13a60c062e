//! Storage providers reachable from agents.
//!
//! A [`StorageProvider`] wraps one store (key-value, object, relational and
//! so on) behind a uniform set of operations that always return a
//! [`StorageResult`]. The [`StorageRegistry`] routes calls by provider name,
//! opens a `storage.<op>` span per call and resolves [`DataReference`]s
//! handed between agents.

mod memory;
mod provider;
mod reference;
mod registry;

pub use memory::MemoryStorageProvider;
pub use provider::{ProviderMetadata, QueryKind, StorageProvider, StorageResult, StorageType};
pub use reference::{DataReference, ParseReferenceError};
pub use registry::{RegistryStats, StorageRegistry};
