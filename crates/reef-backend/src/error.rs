//! Error types for message backends.

/// Errors a backend reports synchronously to its caller.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// `send` or `subscribe` was called before `initialize` or after `shutdown`.
    #[error("backend is not connected")]
    NotConnected,

    /// The broker could not be reached.
    #[error("backend connection failed: {0}")]
    Connection(String),

    /// The spore expired before it could be published.
    #[error("spore {0} expired before publish")]
    Expired(String),

    /// The spore could not be encoded for the wire.
    #[error("spore encoding failed: {0}")]
    Encode(#[from] reef_types::WireError),

    /// An AMQP operation failed.
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
}
