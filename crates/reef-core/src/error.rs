//! Error types for the dispatch core.

use reef_backend::BackendError;
use reef_types::SporeError;

/// Errors returned by [`crate::Reef`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ReefError {
    /// The spore violates an envelope invariant.
    #[error("invalid spore: {0}")]
    Validation(#[from] SporeError),

    /// The reef no longer accepts new spores.
    #[error("reef {0} is shutting down")]
    ShuttingDown(String),

    /// The backend refused the operation.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}
