/// Errors returned by [`crate::Memory`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("importance {0} is outside [0, 1]")]
    InvalidImportance(f64),

    #[error("memory content is empty")]
    EmptyContent,

    #[error("memory backend error: {0}")]
    Backend(String),
}
