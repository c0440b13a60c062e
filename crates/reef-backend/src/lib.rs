//! Message transports for Reef.
//!
//! A [`Backend`] moves spores between agents. [`LocalBackend`] delivers
//! in-process through per-subscriber tokio tasks; [`AmqpBackend`] publishes
//! to a durable topic exchange and consumes from per-agent queues.
//!
//! Both report in-flight work through the [`ActivityGuard`] handed to
//! [`Backend::send`], which is how the dispatch core detects quiescence.

pub mod activity;
pub mod amqp;
pub mod backend;
pub mod config;
pub mod error;
pub mod local;
pub mod routing;
pub mod subscription;

use std::sync::Arc;

pub use activity::{ActivityGuard, InFlight};
pub use amqp::AmqpBackend;
pub use backend::{Backend, BackendStats};
pub use config::{BackendConfig, BackendKind, ParseBackendKindError};
pub use error::BackendError;
pub use local::LocalBackend;
pub use routing::{agent_channel, is_agent_channel, routing_key, AGENT_CHANNEL_PREFIX};
pub use subscription::{
    accepts, handler_fn, HandlerError, ReceiveHook, SporeHandler, Subscription,
};

/// A fresh, uninitialised backend of the given kind.
pub fn backend_for(kind: BackendKind) -> Arc<dyn Backend> {
    match kind {
        BackendKind::Local => Arc::new(LocalBackend::new()),
        BackendKind::Amqp => Arc::new(AmqpBackend::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_for_picks_transport() {
        assert_eq!(backend_for(BackendKind::Local).kind(), BackendKind::Local);
        assert_eq!(backend_for(BackendKind::Amqp).kind(), BackendKind::Amqp);
    }
}
