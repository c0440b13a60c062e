//! Error types for spore validation and wire encoding.

/// A spore violates one of the envelope invariants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SporeError {
    /// A `response` spore must name the spore it answers.
    #[error("response spore {0} has no reply_to")]
    MissingReplyTo(String),

    /// A `broadcast` spore must not target a single agent.
    #[error("broadcast spore {id} targets agent {to_agent}")]
    BroadcastWithTarget {
        /// The offending spore.
        id: String,
        /// The agent it was addressed to.
        to_agent: String,
    },

    /// Every spore needs a producing agent.
    #[error("spore {0} has an empty from_agent")]
    MissingSender(String),
}

/// Errors raised while turning a spore into a broker frame.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The spore expired before it could be published.
    #[error("spore {spore_id} expired at {expired_at}")]
    Expired {
        /// The expired spore.
        spore_id: String,
        /// RFC 3339 expiry timestamp.
        expired_at: String,
    },

    /// The knowledge payload could not be serialised.
    #[error("spore body serialization error: {0}")]
    Body(#[from] serde_json::Error),
}
