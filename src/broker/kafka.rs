//! rdkafka-backed broker.

use super::{Broker, BrokerConsumer, BrokerProducer, ClusterMetadata, DeliveryReport, InboundRecord};
use crate::config::{Compression, Config, ProducerOptions, SubscribeOptions};
use crate::kafka::envelope::MessageEnvelope;
use crate::kafka::topic_manager::TopicSpec;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Once a batch has its first record, wait at most this long for more.
const BATCH_LINGER: Duration = Duration::from_millis(50);

type Admin = AdminClient<DefaultClientContext>;

pub struct KafkaBroker {
    config: Config,
    admin: Mutex<Option<Arc<Admin>>>,
}

impl KafkaBroker {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            admin: Mutex::new(None),
        }
    }

    /// Connection and security settings shared by every client.
    fn client_config(&self) -> ClientConfig {
        let kafka = &self.config.kafka;
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", kafka.bootstrap_servers())
            .set("client.id", &kafka.client_id)
            .set("security.protocol", kafka.security_protocol())
            .set("socket.connection.setup.timeout.ms", kafka.connection_timeout_ms.to_string())
            .set("socket.timeout.ms", kafka.request_timeout_ms.to_string());

        if let Some(sasl) = &kafka.sasl {
            client_config
                .set("sasl.mechanism", sasl.mechanism.as_str())
                .set("sasl.username", &sasl.username)
                .set("sasl.password", &sasl.password);
        }
        client_config
    }

    fn admin(&self) -> Result<Arc<Admin>> {
        self.admin
            .lock()
            .clone()
            .ok_or_else(|| Error::Connection("admin client is not connected".to_string()))
    }

    async fn fetch_metadata(&self, timeout: Duration) -> Result<ClusterMetadata> {
        let admin = self.admin()?;
        tokio::task::spawn_blocking(move || -> Result<ClusterMetadata> {
            let metadata = admin.inner().fetch_metadata(None, timeout)?;
            let mut topics: Vec<String> = metadata
                .topics()
                .iter()
                .map(|t| t.name().to_string())
                .filter(|name| !name.starts_with("__"))
                .collect();
            topics.sort();
            Ok(ClusterMetadata {
                broker_count: metadata.brokers().len(),
                topics,
            })
        })
        .await
        .map_err(|e| Error::Connection(format!("metadata request aborted: {}", e)))?
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    #[instrument(skip(self), fields(brokers = %self.config.kafka.bootstrap_servers()))]
    async fn connect(&self) -> Result<()> {
        let admin: Admin = self.client_config().create()?;
        *self.admin.lock() = Some(Arc::new(admin));

        match self.fetch_metadata(self.config.kafka.connection_timeout()).await {
            Ok(metadata) => {
                info!(brokers = metadata.broker_count, "Admin client connected");
                Ok(())
            }
            Err(e) => {
                self.admin.lock().take();
                Err(Error::Connection(format!("cluster unreachable: {}", e)))
            }
        }
    }

    async fn list_topics(&self) -> Result<Vec<String>> {
        Ok(self
            .fetch_metadata(self.config.kafka.request_timeout())
            .await?
            .topics)
    }

    async fn create_topics(&self, topics: &[TopicSpec]) -> Result<()> {
        let admin = self.admin()?;
        let retention: Vec<String> = topics.iter().map(|t| t.retention_ms.to_string()).collect();
        let new_topics: Vec<NewTopic<'_>> = topics
            .iter()
            .zip(&retention)
            .map(|(spec, retention_ms)| {
                NewTopic::new(
                    &spec.name,
                    spec.partitions,
                    TopicReplication::Fixed(spec.replication_factor),
                )
                .set("cleanup.policy", spec.cleanup_policy.as_str())
                .set("retention.ms", retention_ms)
            })
            .collect();

        let opts = AdminOptions::new().operation_timeout(Some(self.config.kafka.request_timeout()));
        let results = admin.create_topics(&new_topics, &opts).await?;

        for result in results {
            match result {
                Ok(topic) => info!("Successfully created topic: {}", topic),
                Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!("Topic '{}' was created concurrently", topic)
                }
                Err((_topic, code)) => {
                    return Err(Error::Kafka(rdkafka::error::KafkaError::AdminOp(code)));
                }
            }
        }
        Ok(())
    }

    async fn cluster_metadata(&self) -> Result<ClusterMetadata> {
        self.fetch_metadata(self.config.kafka.request_timeout()).await
    }

    async fn create_producer(&self, name: &str, options: &ProducerOptions) -> Result<Arc<dyn BrokerProducer>> {
        let producer = &self.config.producer;
        let mut base = self.client_config();
        base.set("enable.idempotence", options.idempotent.to_string())
            .set("max.in.flight.requests.per.connection", options.max_in_flight_requests.to_string())
            .set("linger.ms", producer.linger_ms.to_string())
            .set("message.timeout.ms", producer.message_timeout_ms.to_string());
        // Idempotence requires acknowledgement from all in-sync replicas.
        if options.idempotent {
            base.set("acks", "all");
        } else {
            base.set("acks", &producer.acks);
        }

        Ok(Arc::new(KafkaProducer {
            name: name.to_string(),
            base,
            transactional_id: options.transactional_id.clone(),
            timeout: self.config.kafka.request_timeout(),
            clients: Mutex::new(HashMap::new()),
            transaction: tokio::sync::Mutex::new(()),
        }))
    }

    async fn create_consumer(&self, group_id: &str, options: &SubscribeOptions) -> Result<Arc<dyn BrokerConsumer>> {
        let consumer_config = &self.config.consumer;
        let session_timeout = options
            .session_timeout
            .map(|d| d.as_millis() as u64)
            .unwrap_or(consumer_config.session_timeout_ms);
        let heartbeat_interval = options
            .heartbeat_interval
            .map(|d| d.as_millis() as u64)
            .unwrap_or(consumer_config.heartbeat_interval_ms);

        let consumer: StreamConsumer = self
            .client_config()
            .set("group.id", group_id)
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", consumer_config.auto_commit_interval_ms.to_string())
            // Offsets are stored explicitly once a record is resolved.
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set(
                "auto.offset.reset",
                if options.from_beginning { "earliest" } else { "latest" },
            )
            .set("session.timeout.ms", session_timeout.to_string())
            .set("heartbeat.interval.ms", heartbeat_interval.to_string())
            .create()?;

        Ok(Arc::new(KafkaConsumer {
            group_id: group_id.to_string(),
            consumer,
            timeout: self.config.kafka.request_timeout(),
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.admin.lock().take().is_some() {
            info!("Admin client closed");
        }
        Ok(())
    }
}

/// One named producer. rdkafka fixes the codec per client, so a client is
/// created lazily for each compression codec the producer is asked to use.
struct KafkaProducer {
    name: String,
    base: ClientConfig,
    transactional_id: Option<String>,
    timeout: Duration,
    clients: Mutex<HashMap<Compression, FutureProducer>>,
    transaction: tokio::sync::Mutex<()>,
}

impl KafkaProducer {
    async fn client(&self, compression: Compression) -> Result<FutureProducer> {
        if let Some(client) = self.clients.lock().get(&compression) {
            return Ok(client.clone());
        }

        let mut client_config = self.base.clone();
        client_config.set("compression.type", compression.as_str());
        if let Some(id) = &self.transactional_id {
            client_config.set("transactional.id", format!("{}-{}", id, compression.as_str()));
        }
        let client: FutureProducer = client_config.create()?;

        if self.transactional_id.is_some() {
            let init = client.clone();
            let timeout = self.timeout;
            tokio::task::spawn_blocking(move || init.init_transactions(timeout))
                .await
                .map_err(|e| Error::Connection(format!("transaction init aborted: {}", e)))??;
        }

        debug!(producer = %self.name, compression = compression.as_str(), "Created producer client");
        Ok(self
            .clients
            .lock()
            .entry(compression)
            .or_insert(client)
            .clone())
    }

    async fn deliver(&self, client: &FutureProducer, topic: &str, envelope: &MessageEnvelope) -> Result<DeliveryReport> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &envelope.headers {
            headers = headers.insert(Header {
                key,
                value: Some(value.as_str()),
            });
        }

        let mut record = FutureRecord::<str, [u8]>::to(topic)
            .payload(&envelope.value[..])
            .headers(headers)
            .timestamp(envelope.timestamp.timestamp_millis());
        if let Some(key) = &envelope.key {
            record = record.key(key.as_str());
        }

        let (partition, offset) = client
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| Error::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        Ok(DeliveryReport {
            topic: topic.to_string(),
            partition,
            offset,
        })
    }

    async fn in_transaction<F, T>(&self, client: &FutureProducer, work: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>> + Send,
    {
        let _guard = self.transaction.lock().await;
        client.begin_transaction()?;

        match work.await {
            Ok(value) => {
                let commit = client.clone();
                let timeout = self.timeout;
                tokio::task::spawn_blocking(move || commit.commit_transaction(timeout))
                    .await
                    .map_err(|e| Error::Timeout {
                        message: format!("transaction commit aborted: {}", e),
                    })??;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = client.abort_transaction(self.timeout) {
                    warn!(producer = %self.name, error = %abort_err, "Failed to abort transaction");
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl BrokerProducer for KafkaProducer {
    async fn send(&self, topic: &str, envelope: &MessageEnvelope, compression: Compression) -> Result<DeliveryReport> {
        let client = self.client(compression).await?;
        if self.transactional_id.is_some() {
            self.in_transaction(&client, self.deliver(&client, topic, envelope))
                .await
        } else {
            self.deliver(&client, topic, envelope).await
        }
    }

    async fn send_batch(
        &self,
        topic: &str,
        envelopes: &[MessageEnvelope],
        compression: Compression,
    ) -> Result<Vec<DeliveryReport>> {
        let client = self.client(compression).await?;
        let deliver_all = async {
            join_all(envelopes.iter().map(|e| self.deliver(&client, topic, e)))
                .await
                .into_iter()
                .collect::<Result<Vec<_>>>()
        };

        if self.transactional_id.is_some() {
            self.in_transaction(&client, deliver_all).await
        } else {
            deliver_all.await
        }
    }

    async fn close(&self) -> Result<()> {
        let clients: Vec<FutureProducer> = self.clients.lock().drain().map(|(_, c)| c).collect();
        for client in clients {
            let timeout = self.timeout;
            tokio::task::spawn_blocking(move || client.flush(timeout))
                .await
                .map_err(|e| Error::Timeout {
                    message: format!("producer flush aborted: {}", e),
                })??;
        }
        Ok(())
    }
}

struct KafkaConsumer {
    group_id: String,
    consumer: StreamConsumer,
    timeout: Duration,
}

impl KafkaConsumer {
    /// Assigned partitions of `topics`; pause and resume only act on these.
    fn assigned(&self, topics: &[String]) -> Result<TopicPartitionList> {
        let assignment = self.consumer.assignment()?;
        let mut scoped = TopicPartitionList::new();
        for elem in assignment.elements() {
            if topics.iter().any(|t| t == elem.topic()) {
                scoped.add_partition(elem.topic(), elem.partition());
            }
        }
        Ok(scoped)
    }
}

fn detach(message: &BorrowedMessage<'_>) -> InboundRecord {
    InboundRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        value: message.payload().map(Bytes::copy_from_slice).unwrap_or_default(),
        headers: message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|h| (h.key.to_string(), h.value.map(Bytes::copy_from_slice).unwrap_or_default()))
                    .collect()
            })
            .unwrap_or_default(),
        timestamp: message.timestamp().to_millis(),
    }
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics)?;
        Ok(())
    }

    async fn poll_batch(&self, max_records: usize, timeout: Duration) -> Result<Vec<InboundRecord>> {
        let mut deadline = Instant::now() + timeout;
        let mut batch = Vec::new();

        while batch.len() < max_records {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(message)) => {
                    batch.push(detach(&message));
                    if batch.len() == 1 {
                        deadline = deadline.min(Instant::now() + BATCH_LINGER);
                    }
                }
                Ok(Err(e)) if batch.is_empty() => return Err(e.into()),
                Ok(Err(e)) => {
                    warn!(group_id = %self.group_id, error = %e, "Receive failed mid-batch");
                    break;
                }
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    fn pause(&self, topics: &[String]) -> Result<()> {
        let partitions = self.assigned(topics)?;
        self.consumer.pause(&partitions)?;
        Ok(())
    }

    fn resume(&self, topics: &[String]) -> Result<()> {
        let partitions = self.assigned(topics)?;
        self.consumer.resume(&partitions)?;
        Ok(())
    }

    fn seek(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.consumer
            .seek(topic, partition, Offset::Offset(offset), self.timeout)?;
        Ok(())
    }

    fn resolve(&self, record: &InboundRecord) -> Result<()> {
        self.consumer
            .store_offset(&record.topic, record.partition, record.offset + 1)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            debug!(group_id = %self.group_id, error = %e, "No offsets committed on close");
        }
        self.consumer.unsubscribe();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SaslConfig, SaslMechanism};

    fn test_brokers() -> Vec<String> {
        std::env::var("TEST_KAFKA_BROKERS")
            .unwrap_or_else(|_| "localhost:9092".to_string())
            .split(',')
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_client_config_carries_security_settings() {
        let mut config = Config::local(&["k1:9093", "k2:9093"]);
        config.kafka.ssl = true;
        config.kafka.sasl = Some(SaslConfig {
            mechanism: SaslMechanism::ScramSha512,
            username: "svc".to_string(),
            password: "secret".to_string(),
        });

        let client_config = KafkaBroker::new(config).client_config();
        assert_eq!(client_config.get("bootstrap.servers"), Some("k1:9093,k2:9093"));
        assert_eq!(client_config.get("security.protocol"), Some("sasl_ssl"));
        assert_eq!(client_config.get("sasl.mechanism"), Some("SCRAM-SHA-512"));
        assert_eq!(client_config.get("sasl.username"), Some("svc"));
    }

    #[test]
    fn test_plaintext_by_default() {
        let client_config = KafkaBroker::new(Config::local(&["localhost:9092"])).client_config();
        assert_eq!(client_config.get("security.protocol"), Some("plaintext"));
        assert_eq!(client_config.get("sasl.mechanism"), None);
    }

    #[tokio::test]
    async fn test_admin_calls_require_connect() {
        let broker = KafkaBroker::new(Config::local(&["localhost:9092"]));
        assert!(matches!(broker.list_topics().await, Err(Error::Connection(_))));
    }

    #[tokio::test]
    #[ignore] // Requires running Kafka
    async fn test_live_connect_and_metadata() {
        let brokers = test_brokers();
        let refs: Vec<&str> = brokers.iter().map(String::as_str).collect();
        let broker = KafkaBroker::new(Config::local(&refs));

        broker.connect().await.unwrap();
        let metadata = broker.cluster_metadata().await.unwrap();
        assert!(metadata.broker_count >= 1);
        broker.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires running Kafka
    async fn test_live_create_topics_tolerates_existing() {
        let brokers = test_brokers();
        let refs: Vec<&str> = brokers.iter().map(String::as_str).collect();
        let broker = KafkaBroker::new(Config::local(&refs));
        broker.connect().await.unwrap();

        let spec = TopicSpec::for_topic(&format!("events.test.{}", uuid::Uuid::new_v4()), 1);
        broker.create_topics(&[spec.clone()]).await.unwrap();
        broker.create_topics(&[spec.clone()]).await.unwrap();
        assert!(broker.list_topics().await.unwrap().contains(&spec.name));
    }
}
