//! In-process backend.
//!
//! Every subscription owns an unbounded queue drained by one tokio task, so
//! `send` never waits on a handler and each subscriber sees spores in
//! publish order.

use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures_util::FutureExt;
use reef_types::Spore;
use tokio::sync::mpsc;

use crate::activity::ActivityGuard;
use crate::backend::{Backend, BackendStats, Counters};
use crate::config::{BackendConfig, BackendKind};
use crate::error::BackendError;
use crate::subscription::{accepts, SporeHandler, Subscription};

struct Delivery {
    spore: Spore,
    _guard: ActivityGuard,
}

struct LocalSubscriber {
    agent: String,
    responds_to: Option<BTreeSet<String>>,
    tx: mpsc::UnboundedSender<Delivery>,
}

/// Delivers spores to handlers in the same process.
pub struct LocalBackend {
    channels: RwLock<HashMap<String, Vec<LocalSubscriber>>>,
    counters: Arc<Counters>,
    connected: AtomicBool,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl LocalBackend {
    /// A connected backend with no channels.
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
            connected: AtomicBool::new(true),
        }
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, Vec::len)
    }
}

async fn run_worker(
    channel: String,
    agent: String,
    handler: SporeHandler,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    counters: Arc<Counters>,
) {
    while let Some(delivery) = rx.recv().await {
        let Delivery { spore, _guard } = delivery;

        if spore.is_expired(chrono::Utc::now()) {
            counters.dropped();
            tracing::debug!(agent = %agent, channel = %channel, spore_id = %spore.id(), "dropped expired spore");
            continue;
        }
        counters.received();

        let spore_id = spore.id().to_string();
        let outcome = AssertUnwindSafe(async { handler(spore).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                counters.error();
                tracing::warn!(agent = %agent, channel = %channel, spore_id = %spore_id, error = %e, "handler failed");
            }
            Err(_) => {
                counters.error();
                tracing::error!(agent = %agent, channel = %channel, spore_id = %spore_id, "handler panicked");
            }
        }
    }
    tracing::debug!(agent = %agent, channel = %channel, "subscription worker stopped");
}

#[async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn initialize(&self, _config: &BackendConfig) -> Result<(), BackendError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        // Dropping the senders lets each worker finish its queue and exit.
        let removed: usize = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, subscribers)| subscribers.len())
            .sum();
        tracing::info!(subscriptions = removed, "local backend shut down");
        Ok(())
    }

    fn send(
        &self,
        spore: Spore,
        channel: &str,
        guard: ActivityGuard,
    ) -> Result<usize, BackendError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BackendError::NotConnected);
        }
        if spore.is_expired(chrono::Utc::now()) {
            self.counters.dropped();
            return Ok(0);
        }

        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        let mut queued = 0;
        if let Some(subscribers) = channels.get(channel) {
            for subscriber in subscribers {
                if !accepts(&subscriber.agent, subscriber.responds_to.as_ref(), &spore) {
                    continue;
                }
                let delivery = Delivery {
                    spore: spore.clone(),
                    _guard: guard.clone(),
                };
                if subscriber.tx.send(delivery).is_ok() {
                    queued += 1;
                }
            }
        }
        self.counters.sent();
        tracing::trace!(channel, spore_id = %spore.id(), queued, "spore queued");
        Ok(queued)
    }

    async fn subscribe(
        &self,
        channel: &str,
        subscription: Subscription,
    ) -> Result<(), BackendError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BackendError::NotConnected);
        }
        let Subscription {
            agent,
            handler,
            responds_to,
            replace,
        } = subscription;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(
            channel.to_string(),
            agent.clone(),
            handler,
            rx,
            Arc::clone(&self.counters),
        ));

        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let subscribers = channels.entry(channel.to_string()).or_default();
        if replace {
            let before = subscribers.len();
            subscribers.retain(|s| s.agent != agent);
            if subscribers.len() < before {
                tracing::debug!(agent = %agent, channel, "replaced existing subscription");
            }
        }
        subscribers.push(LocalSubscriber {
            agent,
            responds_to,
            tx,
        });
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, agent: &str) -> Result<(), BackendError> {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|s| s.agent != agent);
            if subscribers.is_empty() {
                channels.remove(channel);
            }
        }
        Ok(())
    }

    fn stats(&self) -> BackendStats {
        self.counters
            .snapshot(self.connected.load(Ordering::SeqCst))
    }
}
