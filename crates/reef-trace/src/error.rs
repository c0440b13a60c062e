//! Error types for the tracing layer.

/// Errors raised while configuring the tracer or using the span store.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// Invalid observability configuration.
    #[error("invalid observability configuration: {0}")]
    Config(String),

    /// A database operation failed.
    #[error("trace store database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No pooled connection became available.
    #[error("trace store connection error: {0}")]
    Connection(#[from] r2d2::Error),

    /// The store file, its directory or the pool could not be opened.
    #[error("trace store pool error: {0}")]
    Pool(#[from] reef_db::PoolError),

    /// The span schema could not be created.
    #[error("trace store migration error: {0}")]
    Migration(#[from] reef_db::MigrationError),

    /// Attribute or event JSON could not be (de)serialised.
    #[error("trace store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
