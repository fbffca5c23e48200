//! Producer pool and the publish pipeline.
//!
//! A publish runs: state gate, circuit breaker, retry loop, and inside each
//! attempt producer lookup, schema validation, envelope construction and send.

use crate::broker::{Broker, BrokerProducer, DeliveryReport};
use crate::config::{ProducerOptions, PublishOptions, ResilienceConfig};
use crate::connector::{ConnectorState, StateCell};
use crate::events::{ConnectorEvent, EventBus};
use crate::kafka::envelope::MessageEnvelope;
use crate::kafka::key_strategy::KeyStrategy;
use crate::kafka::schema::SchemaRegistry;
use crate::resilience::{CircuitBreaker, CircuitState, RetryPolicy};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

pub const PUBLISH_OPERATION: &str = "publish";

struct ProducerHandle {
    options: ProducerOptions,
    client: Arc<dyn BrokerProducer>,
    created_at: DateTime<Utc>,
}

/// Named producers, created on first use and released on disconnect.
pub struct ProducerPool {
    broker: Arc<dyn Broker>,
    defaults: ProducerOptions,
    producers: Mutex<HashMap<String, ProducerHandle>>,
    closed: AtomicBool,
}

impl ProducerPool {
    pub fn new(broker: Arc<dyn Broker>, defaults: ProducerOptions) -> Self {
        Self {
            broker,
            defaults,
            producers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Allows producers to be created again after [`close_all`](Self::close_all).
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Returns the named producer, creating it with `options` (or the pool
    /// defaults) if it does not exist yet.
    pub async fn get_or_create(
        &self,
        name: &str,
        options: Option<&ProducerOptions>,
    ) -> Result<Arc<dyn BrokerProducer>> {
        let mut producers = self.producers.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::NotConnected {
                state: ConnectorState::Disconnected,
            });
        }
        if let Some(handle) = producers.get(name) {
            if let Some(requested) = options {
                if *requested != handle.options {
                    debug!(producer = name, "Ignoring options for existing producer");
                }
            }
            return Ok(handle.client.clone());
        }

        let options = options.cloned().unwrap_or_else(|| self.defaults.clone());
        info!(
            producer = name,
            idempotent = options.idempotent,
            max_in_flight = options.max_in_flight_requests,
            transactional = options.transactional_id.is_some(),
            "Creating producer"
        );
        let client = self.broker.create_producer(name, &options).await?;
        producers.insert(
            name.to_string(),
            ProducerHandle {
                options,
                client: client.clone(),
                created_at: Utc::now(),
            },
        );
        Ok(client)
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.producers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Releases every producer. A failing producer is logged and does not
    /// stop the others from being released. No producer can be created
    /// until the pool is reopened.
    pub async fn close_all(&self, events: &EventBus) {
        let drained: Vec<(String, ProducerHandle)> = {
            let mut producers = self.producers.lock().await;
            self.closed.store(true, Ordering::SeqCst);
            producers.drain().collect()
        };

        for (name, handle) in drained {
            match handle.client.close().await {
                Ok(()) => info!(
                    producer = %name,
                    lifetime_secs = (Utc::now() - handle.created_at).num_seconds(),
                    "Producer disconnected"
                ),
                Err(e) => error!(producer = %name, error = %e, "Failed to release producer"),
            }
            events.emit(ConnectorEvent::ProducerDisconnect {
                producer: name,
                timestamp: Utc::now(),
            });
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReceipt {
    pub topic: String,
    pub message_id: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReceipt {
    pub topic: String,
    pub message_ids: Vec<String>,
    pub reports: Vec<DeliveryReportView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReportView {
    pub partition: i32,
    pub offset: i64,
}

impl From<DeliveryReport> for DeliveryReportView {
    fn from(report: DeliveryReport) -> Self {
        Self {
            partition: report.partition,
            offset: report.offset,
        }
    }
}

pub struct Publisher {
    pool: ProducerPool,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    retry_schema_errors: bool,
    schemas: Arc<SchemaRegistry>,
    key_strategy: KeyStrategy,
    source: String,
    state: StateCell,
    events: EventBus,
}

impl Publisher {
    pub(crate) fn new(
        pool: ProducerPool,
        resilience: &ResilienceConfig,
        schemas: Arc<SchemaRegistry>,
        source: impl Into<String>,
        state: StateCell,
        events: EventBus,
    ) -> Self {
        Self {
            pool,
            breaker: CircuitBreaker::new(
                PUBLISH_OPERATION,
                resilience.failure_threshold,
                resilience.circuit_timeout(),
            ),
            retry: RetryPolicy::from(resilience),
            retry_schema_errors: resilience.retry_schema_errors,
            schemas,
            key_strategy: KeyStrategy::default(),
            source: source.into(),
            state,
            events,
        }
    }

    pub fn with_key_strategy(mut self, key_strategy: KeyStrategy) -> Self {
        self.key_strategy = key_strategy;
        self
    }

    pub fn pool(&self) -> &ProducerPool {
        &self.pool
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Publishes one message through the circuit breaker and retry loop.
    #[instrument(skip(self, message, options), fields(producer = options.producer_name()))]
    pub async fn publish<T>(&self, topic: &str, message: &T, options: &PublishOptions) -> Result<PublishReceipt>
    where
        T: Serialize + ?Sized,
    {
        self.state.require_connected()?;
        let payload = serde_json::to_value(message)?;
        let retry_schema_errors = self.retry_schema_errors;

        let (envelope, report) = self
            .breaker
            .call_counting(
                || {
                    self.retry.run_if(
                        || self.attempt(topic, &payload, options),
                        |e| e.is_retryable() || (retry_schema_errors && e.is_schema_error()),
                    )
                },
                |e| retry_schema_errors || !e.is_schema_error(),
            )
            .await?;

        debug!(
            topic,
            message_id = %envelope.message_id,
            partition = report.partition,
            offset = report.offset,
            "Message published"
        );
        self.events.emit(ConnectorEvent::MessagePublished {
            topic: topic.to_string(),
            message_id: envelope.message_id.clone(),
            producer: options.producer_name().to_string(),
            timestamp: Utc::now(),
        });

        Ok(PublishReceipt {
            topic: topic.to_string(),
            message_id: envelope.message_id,
            partition: report.partition,
            offset: report.offset,
        })
    }

    async fn attempt(
        &self,
        topic: &str,
        payload: &Value,
        options: &PublishOptions,
    ) -> Result<(MessageEnvelope, DeliveryReport)> {
        let producer = self
            .pool
            .get_or_create(options.producer_name(), options.producer_options.as_ref())
            .await?;

        if let Some(schema_id) = &options.schema_id {
            self.schemas.validate(schema_id, payload)?;
        }

        let envelope = MessageEnvelope::build(payload, options, &self.key_strategy, &self.source)?;
        let report = producer.send(topic, &envelope, options.compression).await?;
        Ok((envelope, report))
    }

    /// Publishes several messages in one broker call.
    ///
    /// Batches bypass the circuit breaker and retry loop: a partially
    /// applied batch must not be resent wholesale.
    #[instrument(skip(self, messages, options), fields(count = messages.len()))]
    pub async fn publish_batch<T>(
        &self,
        topic: &str,
        messages: &[T],
        options: &PublishOptions,
    ) -> Result<BatchReceipt>
    where
        T: Serialize,
    {
        self.state.require_connected()?;

        let mut envelopes = Vec::with_capacity(messages.len());
        for message in messages {
            let payload = serde_json::to_value(message)?;
            if let Some(schema_id) = &options.schema_id {
                self.schemas.validate(schema_id, &payload)?;
            }
            envelopes.push(MessageEnvelope::build(
                &payload,
                options,
                &self.key_strategy,
                &self.source,
            )?);
        }

        if envelopes.is_empty() {
            warn!(topic, "Skipping empty batch");
            return Ok(BatchReceipt {
                topic: topic.to_string(),
                message_ids: Vec::new(),
                reports: Vec::new(),
            });
        }

        let producer = self
            .pool
            .get_or_create(options.producer_name(), options.producer_options.as_ref())
            .await?;
        let reports = producer
            .send_batch(topic, &envelopes, options.compression)
            .await?;

        info!(topic, count = envelopes.len(), "Batch published");
        self.events.emit(ConnectorEvent::BatchPublished {
            topic: topic.to_string(),
            count: envelopes.len(),
            producer: options.producer_name().to_string(),
            timestamp: Utc::now(),
        });

        Ok(BatchReceipt {
            topic: topic.to_string(),
            message_ids: envelopes.into_iter().map(|e| e.message_id).collect(),
            reports: reports.into_iter().map(DeliveryReportView::from).collect(),
        })
    }

    pub(crate) async fn close(&self) {
        self.pool.close_all(&self.events).await;
    }
}
