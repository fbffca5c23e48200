//! Seam between the connector and the broker client library.
//!
//! The connector never touches rdkafka directly; it drives these traits.
//! [`KafkaBroker`] is the production implementation and [`MemoryBroker`]
//! an in-process log used by tests and local development.

pub mod kafka;
pub mod memory;

use crate::config::{Compression, ProducerOptions, SubscribeOptions};
use crate::kafka::envelope::MessageEnvelope;
use crate::kafka::topic_manager::TopicSpec;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

pub use self::kafka::KafkaBroker;
pub use memory::MemoryBroker;

/// Where the broker stored a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A record as delivered to a consumer, detached from the client's buffers.
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Vec<(String, Bytes)>,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMetadata {
    pub broker_count: usize,
    pub topics: Vec<String>,
}

/// Administrative connection plus factory for producers and consumers.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Opens the administrative connection.
    async fn connect(&self) -> Result<()>;

    async fn list_topics(&self) -> Result<Vec<String>>;

    /// Creates every topic in one administrative call.
    async fn create_topics(&self, topics: &[TopicSpec]) -> Result<()>;

    async fn cluster_metadata(&self) -> Result<ClusterMetadata>;

    async fn create_producer(
        &self,
        name: &str,
        options: &ProducerOptions,
    ) -> Result<Arc<dyn BrokerProducer>>;

    async fn create_consumer(
        &self,
        group_id: &str,
        options: &SubscribeOptions,
    ) -> Result<Arc<dyn BrokerConsumer>>;

    /// Closes the administrative connection.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerProducer: Send + Sync {
    async fn send(
        &self,
        topic: &str,
        envelope: &MessageEnvelope,
        compression: Compression,
    ) -> Result<DeliveryReport>;

    async fn send_batch(
        &self,
        topic: &str,
        envelopes: &[MessageEnvelope],
        compression: Compression,
    ) -> Result<Vec<DeliveryReport>>;

    /// Flushes outstanding sends and releases the client.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    async fn subscribe(&self, topics: &[String]) -> Result<()>;

    /// Waits up to `timeout` for records, returning at most `max_records`.
    /// An empty batch means nothing arrived in time. Must be cancel-safe.
    async fn poll_batch(&self, max_records: usize, timeout: Duration) -> Result<Vec<InboundRecord>>;

    fn pause(&self, topics: &[String]) -> Result<()>;

    fn resume(&self, topics: &[String]) -> Result<()>;

    /// Moves the read cursor so `offset` is the next record delivered.
    fn seek(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;

    /// Marks `record` as processed so its offset is included in the next commit.
    fn resolve(&self, record: &InboundRecord) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
