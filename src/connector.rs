//! The connector: connection lifecycle plus the public publish and
//! subscribe surface.
//!
//! ```rust,no_run
//! use sentinel_bus::{Config, Connector, PublishOptions};
//! use serde_json::json;
//!
//! # async fn run() -> sentinel_bus::Result<()> {
//! let connector = Connector::new(Config::local(&["localhost:9092"]))?;
//! connector.connect().await?;
//! connector
//!     .publish("events.security.alerts", &json!({"id": "a-1"}), &PublishOptions::new())
//!     .await?;
//! connector.disconnect().await;
//! # Ok(())
//! # }
//! ```

use crate::broker::{Broker, KafkaBroker};
use crate::config::{Config, ProducerOptions, PublishOptions, SubscribeOptions, DEFAULT_PRODUCER};
use crate::events::{ConnectorEvent, EventBus};
use crate::health::{self, HealthReport};
use crate::kafka::consumer::{ConsumerGroupManager, GroupStatus, MessageHandler};
use crate::kafka::key_strategy::KeyStrategy;
use crate::kafka::producer::{BatchReceipt, ProducerPool, PublishReceipt, Publisher};
use crate::kafka::schema::SchemaRegistry;
use crate::kafka::topic_manager::TopicManager;
use crate::resilience::CircuitState;
use crate::{Error, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectorState::Disconnected => "DISCONNECTED",
            ConnectorState::Connecting => "CONNECTING",
            ConnectorState::Connected => "CONNECTED",
            ConnectorState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Shared view of the connector state. Only the connector writes it.
#[derive(Debug, Clone)]
pub(crate) struct StateCell(Arc<RwLock<ConnectorState>>);

impl Default for StateCell {
    fn default() -> Self {
        Self(Arc::new(RwLock::new(ConnectorState::Disconnected)))
    }
}

impl StateCell {
    pub(crate) fn get(&self) -> ConnectorState {
        *self.0.read()
    }

    /// Stores `state` and returns the previous one.
    pub(crate) fn set(&self, state: ConnectorState) -> ConnectorState {
        std::mem::replace(&mut *self.0.write(), state)
    }

    pub(crate) fn require_connected(&self) -> Result<()> {
        match self.get() {
            ConnectorState::Connected => Ok(()),
            state => Err(Error::NotConnected { state }),
        }
    }
}

pub struct ConnectorBuilder {
    config: Config,
    broker: Option<Arc<dyn Broker>>,
    key_strategy: KeyStrategy,
    source: Option<String>,
}

impl ConnectorBuilder {
    /// Uses `broker` instead of connecting to Kafka.
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn key_strategy(mut self, key_strategy: KeyStrategy) -> Self {
        self.key_strategy = key_strategy;
        self
    }

    /// Default `x-message-source` header; the client id when unset.
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn build(self) -> Result<Connector> {
        self.config.validate()?;
        let config = self.config;

        let broker = match self.broker {
            Some(broker) => broker,
            None => Arc::new(KafkaBroker::new(config.clone())),
        };
        let state = StateCell::default();
        let events = EventBus::new();
        let schemas = Arc::new(SchemaRegistry::new());
        let source = self.source.unwrap_or_else(|| config.kafka.client_id.clone());

        let pool = ProducerPool::new(broker.clone(), ProducerOptions::from(&config.producer));
        let publisher = Arc::new(
            Publisher::new(
                pool,
                &config.resilience,
                schemas.clone(),
                source,
                state.clone(),
                events.clone(),
            )
            .with_key_strategy(self.key_strategy),
        );
        let consumers = ConsumerGroupManager::new(
            broker.clone(),
            publisher.clone(),
            events.clone(),
            config.consumer.clone(),
        );
        let topics = TopicManager::new(broker.clone(), config.kafka.replication_factor);

        Ok(Connector {
            config,
            broker,
            state,
            events,
            topics,
            publisher,
            consumers,
            schemas,
            lifecycle: Mutex::new(()),
        })
    }
}

pub struct Connector {
    config: Config,
    broker: Arc<dyn Broker>,
    state: StateCell,
    events: EventBus,
    topics: TopicManager,
    publisher: Arc<Publisher>,
    consumers: ConsumerGroupManager,
    schemas: Arc<SchemaRegistry>,
    lifecycle: Mutex<()>,
}

impl Connector {
    pub fn builder(config: Config) -> ConnectorBuilder {
        ConnectorBuilder {
            config,
            broker: None,
            key_strategy: KeyStrategy::default(),
            source: None,
        }
    }

    /// Connector for the Kafka cluster named in `config`.
    pub fn new(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn with_broker(config: Config, broker: Arc<dyn Broker>) -> Result<Self> {
        Self::builder(config).broker(broker).build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> ConnectorState {
        self.state.get()
    }

    fn transition(&self, to: ConnectorState) {
        let from = self.state.set(to);
        if from != to {
            info!(%from, %to, "Connector state changed");
            self.events.emit(ConnectorEvent::StateChanged {
                from,
                to,
                timestamp: Utc::now(),
            });
        }
    }

    /// Connects the admin client, provisions the known topics and opens the
    /// default producer. Any failure leaves the connector in `Error` and is
    /// returned unchanged. There is no automatic reconnect.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state.get() == ConnectorState::Connected {
            debug!("Already connected");
            return Ok(());
        }

        self.transition(ConnectorState::Connecting);
        match self.establish().await {
            Ok(()) => {
                self.transition(ConnectorState::Connected);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to connect");
                self.transition(ConnectorState::Error);
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<()> {
        self.broker.connect().await?;
        self.publisher.pool().reopen();
        self.consumers.reopen();

        let created = self.topics.provision(&self.config.topics.known).await?;
        if !created.is_empty() {
            info!(topics = ?created, "Provisioned missing topics");
        }

        self.publisher
            .pool()
            .get_or_create(DEFAULT_PRODUCER, None)
            .await?;
        Ok(())
    }

    /// Releases consumers, then producers, then the admin connection.
    /// Release failures are logged per handle and never stop the rest.
    /// Each stage refuses new handles once drained, so nothing created by a
    /// concurrent publish or subscribe outlives the disconnect.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state.get() == ConnectorState::Disconnected {
            debug!("Already disconnected");
            return;
        }

        self.consumers.disconnect_all().await;
        self.publisher.close().await;
        if let Err(e) = self.broker.close().await {
            error!(error = %e, "Failed to close admin connection");
        }
        self.topics.clear();

        self.transition(ConnectorState::Disconnected);
    }

    pub async fn publish<T>(&self, topic: &str, message: &T, options: &PublishOptions) -> Result<PublishReceipt>
    where
        T: Serialize + ?Sized,
    {
        self.publisher.publish(topic, message, options).await
    }

    pub async fn publish_batch<T>(&self, topic: &str, messages: &[T], options: &PublishOptions) -> Result<BatchReceipt>
    where
        T: Serialize,
    {
        self.publisher.publish_batch(topic, messages, options).await
    }

    /// Starts a processing loop for `group_id`. The dead-letter topic, if
    /// any, is created up front so the first failure can be routed.
    pub async fn subscribe<H>(
        &self,
        group_id: &str,
        topics: &[&str],
        handler: H,
        options: SubscribeOptions,
    ) -> Result<()>
    where
        H: MessageHandler,
    {
        self.state.require_connected()?;
        if let Some(dlq_topic) = &options.dlq_topic {
            self.topics.ensure_topic_exists(dlq_topic).await?;
        }

        let topics = topics.iter().map(|t| t.to_string()).collect();
        self.consumers
            .subscribe(group_id, topics, Arc::new(handler), options)
            .await
    }

    /// Pauses `topics` for the group; an empty slice pauses all of them.
    pub async fn pause(&self, group_id: &str, topics: &[&str]) -> Result<()> {
        let topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        self.consumers.pause(group_id, &topics).await
    }

    pub async fn resume(&self, group_id: &str, topics: &[&str]) -> Result<()> {
        let topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        self.consumers.resume(group_id, &topics).await
    }

    pub async fn seek(&self, group_id: &str, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.consumers.seek(group_id, topic, partition, offset).await
    }

    pub async fn unsubscribe(&self, group_id: &str) -> Result<()> {
        self.consumers.unsubscribe(group_id).await
    }

    /// Waits for the group's processing loop to end and returns the error
    /// that stopped it, if any.
    pub async fn wait_for_consumer(&self, group_id: &str) -> Result<()> {
        self.consumers.wait(group_id).await
    }

    pub async fn group_status(&self, group_id: &str) -> Option<GroupStatus> {
        self.consumers.status(group_id).await
    }

    pub async fn consumer_groups(&self) -> Vec<String> {
        self.consumers.group_ids().await
    }

    pub async fn producer_names(&self) -> Vec<String> {
        self.publisher.pool().names().await
    }

    pub fn register_schema(&self, schema_id: &str, schema: &Value) -> Result<()> {
        self.schemas.register(schema_id, schema)
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.publisher.circuit_state()
    }

    pub async fn health_check(&self) -> HealthReport {
        health::probe(self.broker.as_ref()).await
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.events.subscribe()
    }

    pub fn event_stream(&self) -> BroadcastStream<ConnectorEvent> {
        self.events.stream()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::kafka::consumer::ConsumedMessage;

    fn connector(broker: &MemoryBroker, known: &[&str]) -> Connector {
        let mut config = Config::local(&["memory:9092"]);
        config.topics.known = known.iter().map(|t| t.to_string()).collect();
        Connector::with_broker(config, Arc::new(broker.clone())).unwrap()
    }

    #[tokio::test]
    async fn test_connect_provisions_and_opens_default_producer() {
        let broker = MemoryBroker::new();
        let connector = connector(&broker, &["events.security.alerts", "events.dlq.security"]);
        let mut events = connector.events();

        connector.connect().await.unwrap();

        assert_eq!(connector.state(), ConnectorState::Connected);
        assert_eq!(broker.topic_spec("events.dlq.security").unwrap().partitions, 3);
        assert_eq!(connector.producer_names().await, vec!["default"]);

        let mut transitions = Vec::new();
        while let Ok(ConnectorEvent::StateChanged { to, .. }) = events.try_recv() {
            transitions.push(to);
        }
        assert_eq!(
            transitions,
            vec![ConnectorState::Connecting, ConnectorState::Connected]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_enters_error_state() {
        let broker = MemoryBroker::new();
        broker.set_unavailable(true);
        let connector = connector(&broker, &["events.security.alerts"]);

        let err = connector.connect().await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(connector.state(), ConnectorState::Error);

        broker.set_unavailable(false);
        connector.connect().await.unwrap();
        assert_eq!(connector.state(), ConnectorState::Connected);
    }

    #[tokio::test]
    async fn test_operations_rejected_before_connect() {
        let broker = MemoryBroker::new();
        let connector = connector(&broker, &[]);

        let err = connector
            .publish("events.security.alerts", &serde_json::json!({}), &PublishOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NotConnected {
                state: ConnectorState::Disconnected
            }
        ));

        let err = connector
            .subscribe(
                "g",
                &["events.security.alerts"],
                |_message: ConsumedMessage| async { Ok::<_, anyhow::Error>(()) },
                SubscribeOptions::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NOT_CONNECTED");
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let broker = MemoryBroker::new();
        let connector = connector(&broker, &[]);
        connector.connect().await.unwrap();

        connector.disconnect().await;
        connector.disconnect().await;
        assert_eq!(connector.state(), ConnectorState::Disconnected);
        assert_eq!(broker.lifecycle(), vec!["producer:default", "admin"]);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectorState::Connected.to_string(), "CONNECTED");
        assert_eq!(
            serde_json::to_value(ConnectorState::Error).unwrap(),
            serde_json::json!("ERROR")
        );
    }
}
