//! Subscriptions and the delivery filter shared by every backend.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use reef_types::Spore;

/// Error type returned by spore handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked once per delivered spore.
pub type SporeHandler =
    Arc<dyn Fn(Spore) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Callback run on every spore a backend takes off the wire, before the
/// spore waits behind earlier deliveries to the same handlers.
pub type ReceiveHook = Arc<dyn Fn(&Spore) + Send + Sync>;

/// Wraps an async closure as a [`SporeHandler`].
pub fn handler_fn<F, Fut>(f: F) -> SporeHandler
where
    F: Fn(Spore) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |spore| f(spore).boxed())
}

/// An agent's handler bound to one channel.
#[derive(Clone)]
pub struct Subscription {
    /// Subscribing agent.
    pub agent: String,
    /// Callback.
    pub handler: SporeHandler,
    /// Accepted `knowledge.type` values; `None` accepts everything.
    pub responds_to: Option<BTreeSet<String>>,
    /// Evict earlier subscriptions of the same agent on the same channel.
    pub replace: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("agent", &self.agent)
            .field("responds_to", &self.responds_to)
            .field("replace", &self.replace)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// A replacing subscription with no type filter.
    pub fn new(agent: impl Into<String>, handler: SporeHandler) -> Self {
        Self {
            agent: agent.into(),
            handler,
            responds_to: None,
            replace: true,
        }
    }

    /// Restricts delivery to the given `knowledge.type` values.
    pub fn responds_to<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.responds_to = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Keeps earlier subscriptions of the same agent alongside this one.
    pub fn append(mut self) -> Self {
        self.replace = false;
        self
    }

    /// Whether this subscription should receive `spore`.
    pub fn accepts(&self, spore: &Spore) -> bool {
        accepts(&self.agent, self.responds_to.as_ref(), spore)
    }
}

/// The delivery decision for one subscriber.
///
/// An addressed spore reaches only its `to_agent`, whatever channel it was
/// published on, and a broadcast never reaches its own sender. Otherwise an
/// unset filter accepts everything and a set filter accepts spores whose
/// `knowledge.type` is one of its entries.
pub fn accepts(agent: &str, responds_to: Option<&BTreeSet<String>>, spore: &Spore) -> bool {
    match spore.to_agent.as_deref() {
        Some(to) if to != agent => return false,
        None if spore.from_agent == agent => return false,
        _ => {}
    }
    match responds_to {
        None => true,
        Some(types) => spore
            .knowledge_type()
            .is_some_and(|ty| types.contains(ty)),
    }
}
