//! The dispatch core.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use reef_backend::{
    Backend, BackendError, BackendStats, InFlight, LocalBackend, SporeHandler, Subscription,
};
use reef_trace::{SpanKind, SpanStatus, Tracer};
use reef_types::{metadata_keys, Knowledge, Spore, SporeType};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::channel::{Channel, SubscriberInfo};
use crate::config::ReefConfig;
use crate::error::ReefError;
use crate::outgoing::OutgoingSpore;

const QUIESCENCE_POLL: Duration = Duration::from_millis(10);

/// How a handler is attached to a channel.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Accepted `knowledge.type` values; `None` accepts everything.
    pub responds_to: Option<BTreeSet<String>>,
    /// Evict earlier handlers of the same agent on the same channel.
    pub replace: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            responds_to: None,
            replace: true,
        }
    }
}

impl SubscribeOptions {
    /// Accept only spores whose `knowledge.type` is one of `types`.
    pub fn responds_to<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.responds_to = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Keep earlier handlers of the same agent alongside this one.
    pub fn append(mut self) -> Self {
        self.replace = false;
        self
    }
}

/// Counter snapshot reported by [`Reef::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReefStats {
    pub name: String,
    pub backend: BackendStats,
    pub channel_count: usize,
    /// Publishes refused by envelope validation.
    pub validation_errors: u64,
    /// Spores that had expired by the time they were published.
    pub spores_dropped: u64,
    /// Deliveries queued or running.
    pub in_flight: usize,
    /// `request` calls still waiting for a response.
    pub pending_requests: usize,
    pub accepting: bool,
}

struct Inner {
    config: ReefConfig,
    backend: Arc<dyn Backend>,
    tracer: Tracer,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    in_flight: InFlight,
    pending: Mutex<HashMap<String, oneshot::Sender<Spore>>>,
    accepting: AtomicBool,
    shut_down: AtomicBool,
    validation_errors: AtomicU64,
    dropped: AtomicU64,
}

impl Inner {
    fn channel_or_create(&self, name: &str) -> Arc<Channel> {
        if let Some(channel) = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Arc::clone(channel);
        }
        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(channels.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!(reef = %self.config.name, channel = name, "channel created");
            Arc::new(Channel::new(name, self.config.channel_buffer))
        }))
    }

    /// Hands a live response to the local `request` waiting on it, if any.
    fn resolve_pending(&self, spore: &Spore) -> bool {
        if spore.spore_type != SporeType::Response || spore.is_expired(chrono::Utc::now()) {
            return false;
        }
        let Some(reply_to) = spore.reply_to.as_deref() else {
            return false;
        };
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(reply_to);
        match waiter {
            Some(tx) => tx.send(spore.clone()).is_ok(),
            None => false,
        }
    }

    fn forget_pending(&self, id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

/// Routes spores between agents.
///
/// `Reef` is a handle; clones share channels, counters and the backend.
/// Publishing never suspends: the spore is validated, traced, stamped with
/// its channel and handed to the backend, which queues it.
#[derive(Clone)]
pub struct Reef {
    inner: Arc<Inner>,
}

/// A non-owning [`Reef`] handle, for callbacks the reef itself keeps alive.
#[derive(Clone, Debug)]
pub struct WeakReef {
    inner: Weak<Inner>,
}

impl WeakReef {
    /// The reef, unless every strong handle is gone.
    pub fn upgrade(&self) -> Option<Reef> {
        self.inner.upgrade().map(|inner| Reef { inner })
    }
}

impl std::fmt::Debug for Reef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reef")
            .field("name", &self.inner.config.name)
            .field("backend", &self.inner.backend.kind())
            .field("accepting", &self.inner.accepting.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Reef {
    /// Builds a reef over an initialized backend.
    pub fn new(backend: Arc<dyn Backend>, tracer: Tracer, config: ReefConfig) -> Self {
        tracing::info!(reef = %config.name, backend = %backend.kind(), "reef created");
        let inner = Arc::new(Inner {
            config,
            backend,
            tracer,
            channels: RwLock::new(HashMap::new()),
            in_flight: InFlight::new(),
            pending: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            shut_down: AtomicBool::new(false),
            validation_errors: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        // Responses resolve on receipt, even while the requester's own
        // handler still occupies its delivery queue.
        let weak = Arc::downgrade(&inner);
        inner.backend.set_receive_hook(Arc::new(move |spore: &Spore| {
            if let Some(inner) = weak.upgrade() {
                inner.resolve_pending(spore);
            }
        }));
        Self { inner }
    }

    /// A reef on the in-process backend with default settings.
    pub fn local(tracer: Tracer) -> Self {
        Self::new(Arc::new(LocalBackend::new()), tracer, ReefConfig::default())
    }

    /// The configured reef name, used in logs and errors.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Settings this reef was built with.
    pub fn config(&self) -> &ReefConfig {
        &self.inner.config
    }

    /// The tracer opening producer spans. Agents parent their execute spans
    /// through it as well.
    pub fn tracer(&self) -> &Tracer {
        &self.inner.tracer
    }

    /// The transport spores are handed to.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    /// `false` once [`Reef::shutdown`] has started.
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// A handle that does not keep the reef alive.
    pub fn downgrade(&self) -> WeakReef {
        WeakReef {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ── publishing ───────────────────────────────────────────────────

    /// Sends `knowledge` to one agent on its `agent.<to>` channel.
    ///
    /// # Errors
    ///
    /// See [`Reef::publish`].
    pub fn send(
        &self,
        from: &str,
        to: &str,
        knowledge: Knowledge,
    ) -> Result<String, ReefError> {
        self.publish(OutgoingSpore::direct(from, to, knowledge))
    }

    /// Broadcasts `knowledge` on the default channel.
    ///
    /// # Errors
    ///
    /// See [`Reef::publish`].
    pub fn broadcast(&self, from: &str, knowledge: Knowledge) -> Result<String, ReefError> {
        self.publish(OutgoingSpore::broadcast(from, knowledge))
    }

    /// Broadcasts `knowledge` on `channel`.
    ///
    /// # Errors
    ///
    /// See [`Reef::publish`].
    pub fn broadcast_on(
        &self,
        from: &str,
        knowledge: Knowledge,
        channel: &str,
    ) -> Result<String, ReefError> {
        self.publish(OutgoingSpore::broadcast(from, knowledge).channel(channel))
    }

    /// Answers the spore `reply_to` with a `response` addressed to `to`.
    ///
    /// # Errors
    ///
    /// See [`Reef::publish`].
    pub fn reply(
        &self,
        from: &str,
        to: &str,
        knowledge: Knowledge,
        reply_to: &str,
    ) -> Result<String, ReefError> {
        self.publish(OutgoingSpore::response(from, to, knowledge, reply_to))
    }

    /// Publishes a spore and returns its id.
    ///
    /// An already expired spore is dropped and its id returned without
    /// reaching the backend.
    ///
    /// # Errors
    ///
    /// `ShuttingDown` after [`Reef::shutdown`], `Validation` when the spore
    /// breaks an envelope invariant, `Backend` when the transport refuses it.
    pub fn publish(&self, outgoing: OutgoingSpore) -> Result<String, ReefError> {
        let inner = &self.inner;
        if !inner.accepting.load(Ordering::SeqCst) {
            return Err(ReefError::ShuttingDown(inner.config.name.clone()));
        }

        let channel = outgoing.resolve_channel(&inner.config.default_channel);
        let (mut spore, parent) = outgoing.build();
        if let Err(e) = spore.validate() {
            inner.validation_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(spore_id = %spore.id(), channel = %channel, error = %e, "rejected invalid spore");
            return Err(e.into());
        }

        let span_name = if spore.spore_type == SporeType::Broadcast {
            "reef.broadcast"
        } else {
            "reef.send"
        };
        let mut span = inner
            .tracer
            .start_span(span_name, SpanKind::Producer, parent.as_ref());
        span.set_attribute("spore.id", spore.id());
        span.set_attribute("spore.from", spore.from_agent.as_str());
        if let Some(to) = &spore.to_agent {
            span.set_attribute("spore.to", to.as_str());
        }
        span.set_attribute("spore.type", spore.spore_type.as_str());
        span.set_attribute("reef.channel", channel.as_str());

        if let Some(context) = span.context().or(parent) {
            context.inject(&mut spore.metadata);
        }
        spore
            .metadata
            .insert(metadata_keys::CHANNEL.to_string(), channel.clone());
        let id = spore.id().to_string();

        if spore.is_expired(chrono::Utc::now()) {
            span.set_attribute("dropped.reason", "expired");
            span.set_status(SpanStatus::Ok);
            inner.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(spore_id = %id, channel = %channel, "dropped expired spore");
            return Ok(id);
        }

        inner.resolve_pending(&spore);

        let target = inner.channel_or_create(&channel);
        let sent = spore.clone();
        match inner.backend.send(spore, &channel, inner.in_flight.begin()) {
            Ok(queued) => {
                target.record_published(&sent);
                span.set_attribute("reef.queued", queued);
                span.set_status(SpanStatus::Ok);
                tracing::trace!(spore_id = %id, channel = %channel, queued, "spore published");
                Ok(id)
            }
            Err(BackendError::Expired(_)) => {
                span.set_attribute("dropped.reason", "expired");
                span.set_status(SpanStatus::Ok);
                inner.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(id)
            }
            Err(e) => {
                span.record_exception(&e);
                span.set_status(SpanStatus::Error);
                tracing::warn!(spore_id = %id, channel = %channel, error = %e, "publish failed");
                Err(e.into())
            }
        }
    }

    /// Sends a `request` to `to` and waits up to `timeout` for the
    /// `response` whose `reply_to` is the request's id.
    ///
    /// A zero timeout publishes and returns `None` at once. An elapsed
    /// deadline returns `None`; the target handler is not interrupted.
    ///
    /// # Errors
    ///
    /// See [`Reef::publish`].
    pub async fn request(
        &self,
        from: &str,
        to: &str,
        knowledge: Knowledge,
        timeout: Duration,
    ) -> Result<Option<Spore>, ReefError> {
        self.request_with(OutgoingSpore::request(from, to, knowledge), timeout)
            .await
    }

    /// [`Reef::request`] for a prepared spore.
    ///
    /// # Errors
    ///
    /// See [`Reef::publish`].
    pub async fn request_with(
        &self,
        outgoing: OutgoingSpore,
        timeout: Duration,
    ) -> Result<Option<Spore>, ReefError> {
        let id = outgoing
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let outgoing = outgoing.id(id.clone());

        if timeout.is_zero() {
            self.publish(outgoing)?;
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), tx);

        if let Err(e) = self.publish(outgoing) {
            self.inner.forget_pending(&id);
            return Err(e);
        }

        let outcome = tokio::time::timeout(timeout, rx).await;
        self.inner.forget_pending(&id);
        match outcome {
            Ok(Ok(response)) => Ok(Some(response)),
            Ok(Err(_)) => Ok(None),
            Err(_) => {
                tracing::debug!(spore_id = %id, timeout_ms = timeout.as_millis() as u64, "request timed out");
                Ok(None)
            }
        }
    }

    // ── channels and subscriptions ───────────────────────────────────

    /// Returns the channel called `name`, creating it if needed.
    pub fn create_channel(&self, name: &str) -> Arc<Channel> {
        self.inner.channel_or_create(name)
    }

    /// The channel called `name`, if anything has published or subscribed
    /// on it.
    pub fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.inner
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Channel names, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Attaches `handler` for `agent` on `channel`.
    ///
    /// Each invocation counts as in flight until the handler returns, and a
    /// delivered `response` also resolves a local pending request.
    ///
    /// # Errors
    ///
    /// Returns `Backend` when the transport cannot bind the subscription.
    pub async fn subscribe(
        &self,
        channel: &str,
        agent: &str,
        handler: SporeHandler,
        options: SubscribeOptions,
    ) -> Result<(), ReefError> {
        let target = self.inner.channel_or_create(channel);
        // Weak, since the backend owning this closure is owned by `inner`.
        let weak = Arc::downgrade(&self.inner);
        let delivered_on = Arc::clone(&target);

        let wrapped: SporeHandler = Arc::new(move |spore: Spore| {
            let guard = weak.upgrade().map(|inner| {
                inner.resolve_pending(&spore);
                inner.in_flight.begin()
            });
            delivered_on.record_delivered();
            let invocation = handler(spore);
            async move {
                let _guard = guard;
                invocation.await
            }
            .boxed()
        });

        let subscription = Subscription {
            agent: agent.to_string(),
            handler: wrapped,
            responds_to: options.responds_to.clone(),
            replace: options.replace,
        };
        self.inner.backend.subscribe(channel, subscription).await?;
        target.add_subscriber(
            SubscriberInfo {
                agent: agent.to_string(),
                responds_to: options.responds_to,
            },
            options.replace,
        );
        tracing::debug!(reef = %self.inner.config.name, channel, agent, replace = options.replace, "subscribed");
        Ok(())
    }

    /// Detaches every handler of `agent` on `channel`.
    ///
    /// # Errors
    ///
    /// Returns `Backend` when the transport fails to cancel the consumer.
    pub async fn unsubscribe(&self, channel: &str, agent: &str) -> Result<(), ReefError> {
        self.inner.backend.unsubscribe(channel, agent).await?;
        if let Some(target) = self.channel(channel) {
            target.remove_subscriber(agent);
        }
        Ok(())
    }

    // ── lifecycle ────────────────────────────────────────────────────

    /// Waits until nothing has been in flight for the quiescence grace
    /// period. Returns `false` if `timeout` elapses first.
    pub async fn wait_for_completion(&self, timeout: Option<Duration>) -> bool {
        let grace = self.inner.config.quiescence_grace();
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            if self
                .inner
                .in_flight
                .idle_for()
                .is_some_and(|idle| idle >= grace)
            {
                return true;
            }
            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                return false;
            }
            tokio::time::sleep(QUIESCENCE_POLL).await;
        }
    }

    /// Stops accepting spores, optionally drains, then closes the backend
    /// and drops pending requests. Later calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns `Backend` when the transport fails to close cleanly.
    pub async fn shutdown(&self, wait: bool) -> Result<(), ReefError> {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        inner.accepting.store(false, Ordering::SeqCst);

        if wait
            && !self
                .wait_for_completion(Some(inner.config.shutdown_timeout()))
                .await
        {
            tracing::warn!(
                reef = %inner.config.name,
                in_flight = inner.in_flight.count(),
                "shutdown timeout reached before quiescence"
            );
        }

        let closed = inner.backend.shutdown().await;
        let abandoned = inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .count();
        tracing::info!(reef = %inner.config.name, abandoned_requests = abandoned, "reef shut down");
        closed.map_err(Into::into)
    }

    pub fn stats(&self) -> ReefStats {
        let inner = &self.inner;
        ReefStats {
            name: inner.config.name.clone(),
            backend: inner.backend.stats(),
            channel_count: inner
                .channels
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            validation_errors: inner.validation_errors.load(Ordering::Relaxed),
            spores_dropped: inner.dropped.load(Ordering::Relaxed),
            in_flight: inner.in_flight.count(),
            pending_requests: inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            accepting: inner.accepting.load(Ordering::SeqCst),
        }
    }
}
