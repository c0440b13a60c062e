//! The transport contract the dispatch core depends on.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use reef_types::Spore;
use serde::Serialize;

use crate::activity::ActivityGuard;
use crate::config::{BackendConfig, BackendKind};
use crate::error::BackendError;
use crate::subscription::{ReceiveHook, Subscription};

/// Counter snapshot reported by [`Backend::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    /// Spores accepted by `send`.
    pub spores_sent: u64,
    /// Spores taken off a queue for delivery.
    pub spores_received: u64,
    /// Spores dropped because they expired.
    pub spores_dropped: u64,
    /// Handler failures and background transport errors.
    pub errors: u64,
    /// Whether the backend is currently usable.
    pub connected: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    pub(crate) fn sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, connected: bool) -> BackendStats {
        BackendStats {
            spores_sent: self.sent.load(Ordering::Relaxed),
            spores_received: self.received.load(Ordering::Relaxed),
            spores_dropped: self.dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            connected,
        }
    }
}

/// A spore transport.
///
/// `send` is synchronous so that publishing never suspends the caller;
/// anything the backend cannot decide immediately happens in background
/// tasks, whose failures are logged and counted in [`BackendStats::errors`].
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Which transport this is.
    fn kind(&self) -> BackendKind;

    /// Opens connections and binds every subscription recorded so far.
    async fn initialize(&self, config: &BackendConfig) -> Result<(), BackendError>;

    /// Closes consumers, then connections. Safe to call more than once.
    async fn shutdown(&self) -> Result<(), BackendError>;

    /// Publishes one spore on `channel`.
    ///
    /// `guard` keeps the spore counted as in flight until the backend is done
    /// with it. Returns the number of deliveries queued (in-process) or
    /// publishes queued (broker).
    fn send(&self, spore: Spore, channel: &str, guard: ActivityGuard)
        -> Result<usize, BackendError>;

    /// Adds a subscription on `channel`.
    async fn subscribe(&self, channel: &str, subscription: Subscription)
        -> Result<(), BackendError>;

    /// Removes every subscription of `agent` on `channel`.
    async fn unsubscribe(&self, channel: &str, agent: &str) -> Result<(), BackendError>;

    /// Counter snapshot.
    fn stats(&self) -> BackendStats;

    /// Installs `hook`, replacing any earlier one. Backends whose deliveries
    /// never queue behind a running handler of the same subscriber may
    /// ignore it.
    fn set_receive_hook(&self, _hook: ReceiveHook) {}
}
