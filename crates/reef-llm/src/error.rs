/// Errors from model providers and the registry.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("no llm provider registered")]
    NoProvider,

    #[error("unknown llm provider: {0}")]
    UnknownProvider(String),

    #[error("invalid chat input: {0}")]
    InvalidInput(String),

    #[error("provider error: {0}")]
    Provider(String),
}
