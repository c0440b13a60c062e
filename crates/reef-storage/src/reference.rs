//! Pointers to stored data that agents pass around instead of the data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::provider::StorageType;

/// Where a piece of data lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataReference {
    pub provider: String,
    pub storage_type: StorageType,
    pub resource_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl DataReference {
    pub fn new(
        provider: impl Into<String>,
        storage_type: StorageType,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            storage_type,
            resource_id: resource_id.into(),
            created_at: Utc::now(),
            metadata: Map::new(),
        }
    }

    /// `<storage_type>://<provider>/<resource_id>`
    pub fn to_uri(&self) -> String {
        format!(
            "{}://{}/{}",
            self.storage_type, self.provider, self.resource_id
        )
    }

    /// Parses a URI produced by [`DataReference::to_uri`].
    ///
    /// The creation time of the parsed reference is the parse time.
    ///
    /// # Errors
    ///
    /// Returns `ParseReferenceError` for a missing scheme, an unknown
    /// storage type or an empty provider or resource id.
    pub fn parse_uri(uri: &str) -> Result<Self, ParseReferenceError> {
        let invalid = || ParseReferenceError(uri.to_string());
        let (scheme, rest) = uri.split_once("://").ok_or_else(invalid)?;
        let storage_type = StorageType::from_label(scheme).ok_or_else(invalid)?;
        let (provider, resource_id) = rest.split_once('/').ok_or_else(invalid)?;
        if provider.is_empty() || resource_id.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(provider, storage_type, resource_id))
    }
}

/// Error returned for a malformed data reference URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseReferenceError(pub String);

impl std::fmt::Display for ParseReferenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid data reference: {}", self.0)
    }
}

impl std::error::Error for ParseReferenceError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_round_trip() {
        let reference = DataReference::new("cache", StorageType::KeyValue, "reports/2024/q1");
        let uri = reference.to_uri();
        assert_eq!(uri, "key_value://cache/reports/2024/q1");

        let parsed = DataReference::parse_uri(&uri).expect("should parse");
        assert_eq!(parsed.provider, "cache");
        assert_eq!(parsed.storage_type, StorageType::KeyValue);
        assert_eq!(parsed.resource_id, "reports/2024/q1");
    }

    #[test]
    fn malformed_uris_are_rejected() {
        for uri in [
            "cache/reports",
            "tape://cache/reports",
            "object://cache",
            "object:///reports",
            "object://cache/",
        ] {
            assert!(DataReference::parse_uri(uri).is_err(), "{uri} should fail");
        }
    }
}
