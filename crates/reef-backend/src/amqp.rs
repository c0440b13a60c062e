//! AMQP backend over a durable topic exchange.
//!
//! Publishing goes through a single publisher task per connection, which
//! keeps publish order and awaits broker confirms. Each bound queue has a
//! consumer task that decodes deliveries and runs the receive hook, and a
//! handler task that resolves the target subscription with
//! [`delivery_channel`], runs handlers in delivery order and acks only after
//! they succeed. The consumer keeps pulling while a handler runs, so a
//! handler waiting on a response does not block the delivery carrying it,
//! as long as `prefetch` leaves room for it.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use reef_types::wire::{self, BrokerMessage, CONTENT_TYPE_JSON, DELIVERY_MODE_PERSISTENT};
use reef_types::{Spore, WireError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::activity::ActivityGuard;
use crate::backend::{Backend, BackendStats, Counters};
use crate::config::{BackendConfig, BackendKind};
use crate::error::BackendError;
use crate::routing::{agent_channel, binding_patterns, delivery_channel, queue_name, routing_key};
use crate::subscription::{ReceiveHook, Subscription};

const PUBLISHER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_REPLY_SUCCESS: u16 = 200;

struct PublishJob {
    routing_key: String,
    message: BrokerMessage,
    _guard: ActivityGuard,
}

struct ConsumerHandle {
    tag: String,
    task: JoinHandle<()>,
}

struct Session {
    connection: Connection,
    consume_channel: Channel,
    publisher_task: JoinHandle<()>,
    consumers: HashMap<String, ConsumerHandle>,
}

type SubscriptionTable = HashMap<(String, String), Vec<Subscription>>;

struct Shared {
    config: Mutex<BackendConfig>,
    counters: Counters,
    connected: AtomicBool,
    subscriptions: RwLock<SubscriptionTable>,
    publisher: Mutex<Option<mpsc::UnboundedSender<PublishJob>>>,
    session: tokio::sync::Mutex<Option<Session>>,
    receive_hook: RwLock<Option<ReceiveHook>>,
}

impl Shared {
    fn handlers_for(&self, channel: &str, agent: &str) -> Vec<Subscription> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(channel.to_string(), agent.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn on_receive(&self, spore: &Spore) {
        let hook = self
            .receive_hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(spore);
        }
    }

    fn config(&self) -> BackendConfig {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Carries spores over an AMQP 0-9-1 broker.
#[derive(Clone)]
pub struct AmqpBackend {
    shared: Arc<Shared>,
}

impl Default for AmqpBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AmqpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpBackend")
            .field("connected", &self.shared.connected.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl AmqpBackend {
    /// A disconnected backend. Subscriptions made before
    /// [`Backend::initialize`] are bound when it runs.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                config: Mutex::new(BackendConfig::default()),
                counters: Counters::default(),
                connected: AtomicBool::new(false),
                subscriptions: RwLock::new(HashMap::new()),
                publisher: Mutex::new(None),
                session: tokio::sync::Mutex::new(None),
                receive_hook: RwLock::new(None),
            }),
        }
    }

    async fn bind_and_consume(
        &self,
        session: &mut Session,
        config: &BackendConfig,
        channel: &str,
        agent: &str,
    ) -> Result<(), BackendError> {
        let queue = queue_name(config.queue_prefix(), channel, agent);
        if session.consumers.contains_key(&queue) {
            return Ok(());
        }

        session
            .consume_channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        for pattern in binding_patterns(channel) {
            session
                .consume_channel
                .queue_bind(
                    &queue,
                    &config.exchange,
                    &pattern,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        let tag = format!("reef.{agent}.{}", uuid::Uuid::new_v4().simple());
        let consumer = session
            .consume_channel
            .basic_consume(
                &queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let task = tokio::spawn(consume_loop(
            Arc::clone(&self.shared),
            channel.to_string(),
            agent.to_string(),
            consumer,
        ));
        tracing::info!(queue = %queue, channel, agent, "consumer bound");
        session.consumers.insert(queue, ConsumerHandle { tag, task });
        Ok(())
    }

    async fn bind_subscription(
        &self,
        session: &mut Session,
        config: &BackendConfig,
        channel: &str,
        agent: &str,
    ) -> Result<(), BackendError> {
        // Broadcasts and direct spores arrive on the agent's own queue.
        self.bind_and_consume(session, config, &agent_channel(agent), agent)
            .await?;
        self.bind_and_consume(session, config, channel, agent).await
    }
}

fn header_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::Boolean(b) => Some(b.to_string()),
        AMQPValue::ShortShortInt(n) => Some(n.to_string()),
        AMQPValue::ShortShortUInt(n) => Some(n.to_string()),
        AMQPValue::ShortInt(n) => Some(n.to_string()),
        AMQPValue::ShortUInt(n) => Some(n.to_string()),
        AMQPValue::LongInt(n) => Some(n.to_string()),
        AMQPValue::LongUInt(n) => Some(n.to_string()),
        AMQPValue::LongLongInt(n) => Some(n.to_string()),
        _ => None,
    }
}

fn broker_message(delivery: &Delivery) -> BrokerMessage {
    let props = &delivery.properties;
    let headers: BTreeMap<String, String> = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| {
                    header_string(value).map(|v| (key.as_str().to_string(), v))
                })
                .collect()
        })
        .unwrap_or_default();

    BrokerMessage {
        body: delivery.data.clone(),
        content_type: props
            .content_type()
            .as_ref()
            .map_or_else(|| CONTENT_TYPE_JSON.to_string(), |c| c.as_str().to_string()),
        delivery_mode: props.delivery_mode().unwrap_or(DELIVERY_MODE_PERSISTENT),
        message_id: props.message_id().as_ref().map(|id| id.as_str().to_string()),
        priority: *props.priority(),
        expiration_ms: props
            .expiration()
            .as_ref()
            .and_then(|e| e.as_str().parse().ok()),
        headers,
    }
}

fn properties(message: &BrokerMessage) -> BasicProperties {
    let mut headers = FieldTable::default();
    for (key, value) in &message.headers {
        headers.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }

    let mut props = BasicProperties::default()
        .with_content_type(ShortString::from(message.content_type.clone()))
        .with_delivery_mode(message.delivery_mode)
        .with_headers(headers);
    if let Some(id) = &message.message_id {
        props = props.with_message_id(ShortString::from(id.clone()));
    }
    if let Some(priority) = message.priority {
        props = props.with_priority(priority);
    }
    if let Some(ms) = message.expiration_ms {
        props = props.with_expiration(ShortString::from(ms.to_string()));
    }
    props
}

async fn publish_one(
    channel: &Channel,
    exchange: &str,
    job: &PublishJob,
) -> Result<Confirmation, lapin::Error> {
    channel
        .basic_publish(
            exchange,
            &job.routing_key,
            BasicPublishOptions::default(),
            &job.message.body,
            properties(&job.message),
        )
        .await?
        .await
}

async fn publish_loop(
    shared: Arc<Shared>,
    channel: Channel,
    exchange: String,
    mut rx: mpsc::UnboundedReceiver<PublishJob>,
) {
    while let Some(job) = rx.recv().await {
        match publish_one(&channel, &exchange, &job).await {
            Ok(confirmation) if confirmation.is_nack() => {
                shared.counters.error();
                tracing::warn!(routing_key = %job.routing_key, "broker nacked publish");
            }
            Ok(_) => {}
            Err(e) => {
                shared.counters.error();
                tracing::error!(routing_key = %job.routing_key, error = %e, "publish failed");
            }
        }
    }
    tracing::debug!("publisher stopped");
}

async fn run_handlers(subscriptions: &[Subscription], spore: &Spore) -> bool {
    let mut ok = true;
    for subscription in subscriptions {
        let outcome = AssertUnwindSafe((subscription.handler)(spore.clone()))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                ok = false;
                tracing::warn!(agent = %subscription.agent, spore_id = %spore.id(), error = %e, "handler failed");
            }
            Err(_) => {
                ok = false;
                tracing::error!(agent = %subscription.agent, spore_id = %spore.id(), "handler panicked");
            }
        }
    }
    ok
}

struct Inbound {
    delivery: Delivery,
    spore: Spore,
}

async fn consume_loop(
    shared: Arc<Shared>,
    queue_channel: String,
    agent: String,
    mut consumer: Consumer,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handling = tokio::spawn(handle_loop(
        Arc::clone(&shared),
        queue_channel.clone(),
        agent.clone(),
        rx,
    ));

    while let Some(next) = consumer.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(e) => {
                shared.counters.error();
                tracing::error!(agent = %agent, channel = %queue_channel, error = %e, "consumer failed");
                break;
            }
        };

        let spore = wire::decode(&broker_message(&delivery));
        shared.counters.received();
        shared.on_receive(&spore);
        if tx.send(Inbound { delivery, spore }).is_err() {
            break;
        }
    }

    drop(tx);
    if let Err(e) = handling.await {
        tracing::error!(agent = %agent, channel = %queue_channel, error = %e, "handler task failed");
    }
    tracing::debug!(agent = %agent, channel = %queue_channel, "consumer stopped");
}

async fn handle_loop(
    shared: Arc<Shared>,
    queue_channel: String,
    agent: String,
    mut rx: mpsc::UnboundedReceiver<Inbound>,
) {
    while let Some(Inbound { delivery, spore }) = rx.recv().await {
        let subscriptions: Vec<Subscription> =
            delivery_channel(&queue_channel, &agent, &spore, delivery.routing_key.as_str())
                .map(|channel| shared.handlers_for(&channel, &agent))
                .unwrap_or_default()
                .into_iter()
                .filter(|s| s.accepts(&spore))
                .collect();

        let expired = spore.is_expired(chrono::Utc::now());
        let settle = if expired {
            shared.counters.dropped();
            delivery.acker.ack(BasicAckOptions::default()).await
        } else if subscriptions.is_empty() {
            delivery.acker.ack(BasicAckOptions::default()).await
        } else if run_handlers(&subscriptions, &spore).await {
            delivery.acker.ack(BasicAckOptions::default()).await
        } else {
            shared.counters.error();
            delivery
                .acker
                .reject(BasicRejectOptions { requeue: false })
                .await
        };

        if let Err(e) = settle {
            shared.counters.error();
            tracing::warn!(agent = %agent, spore_id = %spore.id(), error = %e, "failed to settle delivery");
        }
    }
}

#[async_trait]
impl Backend for AmqpBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Amqp
    }

    async fn initialize(&self, config: &BackendConfig) -> Result<(), BackendError> {
        let mut session_slot = self.shared.session.lock().await;
        if session_slot.is_some() {
            return Ok(());
        }
        *self
            .shared
            .config
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = config.clone();

        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        let publish_channel = connection.create_channel().await?;
        publish_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        publish_channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let consume_channel = connection.create_channel().await?;
        consume_channel
            .basic_qos(config.prefetch, BasicQosOptions::default())
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let publisher_task = tokio::spawn(publish_loop(
            Arc::clone(&self.shared),
            publish_channel,
            config.exchange.clone(),
            rx,
        ));
        *self
            .shared
            .publisher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);

        let mut session = Session {
            connection,
            consume_channel,
            publisher_task,
            consumers: HashMap::new(),
        };

        let pending: Vec<(String, String)> = self
            .shared
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for (channel, agent) in pending {
            self.bind_subscription(&mut session, config, &channel, &agent)
                .await?;
        }

        *session_slot = Some(session);
        self.shared.connected.store(true, Ordering::SeqCst);
        tracing::info!(exchange = %config.exchange, "amqp backend connected");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        self.shared.connected.store(false, Ordering::SeqCst);
        let Some(session) = self.shared.session.lock().await.take() else {
            return Ok(());
        };

        for (queue, consumer) in &session.consumers {
            if let Err(e) = session
                .consume_channel
                .basic_cancel(&consumer.tag, BasicCancelOptions::default())
                .await
            {
                tracing::warn!(queue = %queue, error = %e, "failed to cancel consumer");
            }
            consumer.task.abort();
        }

        // Dropping the sender lets the publisher drain queued jobs and stop.
        self.shared
            .publisher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if tokio::time::timeout(PUBLISHER_DRAIN_TIMEOUT, session.publisher_task)
            .await
            .is_err()
        {
            tracing::warn!("publisher did not drain before shutdown timeout");
        }

        if let Err(e) = session
            .consume_channel
            .close(CLOSE_REPLY_SUCCESS, "reef shutdown")
            .await
        {
            tracing::debug!(error = %e, "consumer channel already closed");
        }
        session
            .connection
            .close(CLOSE_REPLY_SUCCESS, "reef shutdown")
            .await?;
        tracing::info!("amqp backend shut down");
        Ok(())
    }

    fn send(
        &self,
        spore: Spore,
        channel: &str,
        guard: ActivityGuard,
    ) -> Result<usize, BackendError> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(BackendError::NotConnected);
        }

        let message = match wire::encode(&spore, chrono::Utc::now()) {
            Ok(message) => message,
            Err(WireError::Expired { spore_id, .. }) => {
                self.shared.counters.dropped();
                return Err(BackendError::Expired(spore_id));
            }
            Err(e) => return Err(e.into()),
        };

        let job = PublishJob {
            routing_key: routing_key(&spore, channel),
            message,
            _guard: guard,
        };
        let publisher = self
            .shared
            .publisher
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let tx = publisher.as_ref().ok_or(BackendError::NotConnected)?;
        tx.send(job).map_err(|_| BackendError::NotConnected)?;

        self.shared.counters.sent();
        Ok(1)
    }

    async fn subscribe(
        &self,
        channel: &str,
        subscription: Subscription,
    ) -> Result<(), BackendError> {
        let agent = subscription.agent.clone();
        {
            let mut table = self
                .shared
                .subscriptions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let entry = table
                .entry((channel.to_string(), agent.clone()))
                .or_default();
            if subscription.replace {
                entry.clear();
            }
            entry.push(subscription);
        }

        let mut session_slot = self.shared.session.lock().await;
        if let Some(session) = session_slot.as_mut() {
            let config = self.shared.config();
            self.bind_subscription(session, &config, channel, &agent)
                .await?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, agent: &str) -> Result<(), BackendError> {
        self.shared
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(channel.to_string(), agent.to_string()));

        let mut session_slot = self.shared.session.lock().await;
        if let Some(session) = session_slot.as_mut() {
            let queue = queue_name(self.shared.config().queue_prefix(), channel, agent);
            if let Some(consumer) = session.consumers.remove(&queue) {
                session
                    .consume_channel
                    .basic_cancel(&consumer.tag, BasicCancelOptions::default())
                    .await?;
                consumer.task.abort();
            }
        }
        Ok(())
    }

    fn stats(&self) -> BackendStats {
        self.shared
            .counters
            .snapshot(self.shared.connected.load(Ordering::SeqCst))
    }

    fn set_receive_hook(&self, hook: ReceiveHook) {
        *self
            .shared
            .receive_hook
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }
}
