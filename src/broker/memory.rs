//! In-process broker with Kafka's partitioned log semantics.
//!
//! Records are partitioned by key hash (round robin without a key), consumer
//! groups keep committed offsets across consumer instances, and faults can
//! be injected to exercise the resilience layers without a cluster.

use super::{Broker, BrokerConsumer, BrokerProducer, ClusterMetadata, DeliveryReport, InboundRecord};
use crate::config::{Compression, ProducerOptions, SubscribeOptions};
use crate::kafka::envelope::MessageEnvelope;
use crate::kafka::topic_manager::TopicSpec;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredRecord {
    record: InboundRecord,
    producer_id: u64,
}

#[derive(Debug)]
struct TopicLog {
    spec: TopicSpec,
    partitions: Vec<Vec<StoredRecord>>,
    next_partition: usize,
}

impl TopicLog {
    fn new(spec: TopicSpec) -> Self {
        let count = spec.partitions.max(1) as usize;
        Self {
            spec,
            partitions: vec![Vec::new(); count],
            next_partition: 0,
        }
    }

    fn partition_for(&mut self, key: Option<&str>) -> usize {
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % self.partitions.len() as u64) as usize
            }
            None => {
                let partition = self.next_partition % self.partitions.len();
                self.next_partition += 1;
                partition
            }
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    connected: bool,
    unavailable: bool,
    topics: HashMap<String, TopicLog>,
    committed: HashMap<(String, String, i32), i64>,
    create_topic_calls: usize,
    send_attempts: usize,
    fail_sends: usize,
    lose_acks: usize,
    next_producer_id: u64,
    lifecycle: Vec<String>,
}

impl MemoryState {
    fn ensure_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(Error::Connection("broker unreachable".to_string()));
        }
        Ok(())
    }

    fn ensure_connected(&self) -> Result<()> {
        self.ensure_available()?;
        if !self.connected {
            return Err(Error::Connection("admin client is not connected".to_string()));
        }
        Ok(())
    }

    fn topic_mut(&mut self, name: &str) -> &mut TopicLog {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| TopicLog::new(TopicSpec::for_topic(name, 1)))
    }

    fn append(&mut self, producer_id: u64, idempotent: bool, topic: &str, envelope: &MessageEnvelope) -> DeliveryReport {
        let log = self.topic_mut(topic);
        let partition = log.partition_for(envelope.key.as_deref());
        let records = &mut log.partitions[partition];

        let key = envelope.key.as_ref().map(|k| Bytes::from(k.clone()));
        if idempotent {
            if let Some(last) = records.last() {
                if last.producer_id == producer_id && last.record.key == key && last.record.value == envelope.value {
                    debug!(topic, partition, "Dropping duplicate from idempotent producer");
                    return DeliveryReport {
                        topic: topic.to_string(),
                        partition: partition as i32,
                        offset: last.record.offset,
                    };
                }
            }
        }

        let offset = records.len() as i64;
        records.push(StoredRecord {
            record: InboundRecord {
                topic: topic.to_string(),
                partition: partition as i32,
                offset,
                key,
                value: envelope.value.clone(),
                headers: envelope
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), Bytes::from(v.clone())))
                    .collect(),
                timestamp: Some(envelope.timestamp.timestamp_millis()),
            },
            producer_id,
        });

        DeliveryReport {
            topic: topic.to_string(),
            partition: partition as i32,
            offset,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<MemoryState>,
    appended: Notify,
}

/// Broker backed by in-process partition logs.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a topic with `partitions` partitions outside any admin call.
    pub fn seed_topic(&self, name: &str, partitions: i32) {
        let mut spec = TopicSpec::for_topic(name, 1);
        spec.partitions = partitions;
        self.shared
            .state
            .lock()
            .topics
            .insert(name.to_string(), TopicLog::new(spec));
    }

    /// Appends a raw record, bypassing the envelope. Used to simulate
    /// foreign producers writing malformed payloads.
    pub fn produce_raw(&self, topic: &str, key: Option<&str>, value: &[u8]) -> DeliveryReport {
        let envelope = MessageEnvelope {
            message_id: String::new(),
            key: key.map(str::to_string),
            value: Bytes::copy_from_slice(value),
            headers: Default::default(),
            timestamp: chrono::Utc::now(),
        };
        let report = self.shared.state.lock().append(0, false, topic, &envelope);
        self.shared.appended.notify_waiters();
        report
    }

    /// All records of `topic`, partition by partition.
    pub fn records(&self, topic: &str) -> Vec<InboundRecord> {
        self.shared
            .state
            .lock()
            .topics
            .get(topic)
            .map(|log| {
                log.partitions
                    .iter()
                    .flatten()
                    .map(|stored| stored.record.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn topic_spec(&self, topic: &str) -> Option<TopicSpec> {
        self.shared.state.lock().topics.get(topic).map(|log| log.spec.clone())
    }

    pub fn create_topic_calls(&self) -> usize {
        self.shared.state.lock().create_topic_calls
    }

    /// Send calls seen so far, including failed and deduplicated ones.
    pub fn send_attempts(&self) -> usize {
        self.shared.state.lock().send_attempts
    }

    /// Makes the next `count` sends fail before anything is written.
    pub fn fail_next_sends(&self, count: usize) {
        self.shared.state.lock().fail_sends = count;
    }

    /// Makes the next `count` sends write the record but report failure,
    /// as if the acknowledgement was lost.
    pub fn lose_next_acks(&self, count: usize) {
        self.shared.state.lock().lose_acks = count;
    }

    /// Makes admin calls and client creation fail with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.state.lock().unavailable = unavailable;
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.shared
            .state
            .lock()
            .committed
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Release operations in the order they happened, e.g. `consumer:scan-workers`.
    pub fn lifecycle(&self) -> Vec<String> {
        self.shared.state.lock().lifecycle.clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.ensure_available()?;
        state.connected = true;
        Ok(())
    }

    async fn list_topics(&self) -> Result<Vec<String>> {
        let state = self.shared.state.lock();
        state.ensure_connected()?;
        let mut topics: Vec<String> = state.topics.keys().cloned().collect();
        topics.sort();
        Ok(topics)
    }

    async fn create_topics(&self, topics: &[TopicSpec]) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.ensure_connected()?;
        state.create_topic_calls += 1;
        for spec in topics {
            if !state.topics.contains_key(&spec.name) {
                state.topics.insert(spec.name.clone(), TopicLog::new(spec.clone()));
            }
        }
        Ok(())
    }

    async fn cluster_metadata(&self) -> Result<ClusterMetadata> {
        let topics = self.list_topics().await?;
        Ok(ClusterMetadata {
            broker_count: 1,
            topics,
        })
    }

    async fn create_producer(&self, name: &str, options: &ProducerOptions) -> Result<Arc<dyn BrokerProducer>> {
        let mut state = self.shared.state.lock();
        state.ensure_available()?;
        state.next_producer_id += 1;
        Ok(Arc::new(MemoryProducer {
            shared: self.shared.clone(),
            id: state.next_producer_id,
            name: name.to_string(),
            idempotent: options.idempotent,
        }))
    }

    async fn create_consumer(&self, group_id: &str, options: &SubscribeOptions) -> Result<Arc<dyn BrokerConsumer>> {
        self.shared.state.lock().ensure_available()?;
        Ok(Arc::new(MemoryConsumer {
            shared: self.shared.clone(),
            group_id: group_id.to_string(),
            from_beginning: options.from_beginning,
            topics: Mutex::new(Vec::new()),
            positions: Mutex::new(HashMap::new()),
            paused: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.connected = false;
        state.lifecycle.push("admin".to_string());
        Ok(())
    }
}

struct MemoryProducer {
    shared: Arc<Shared>,
    id: u64,
    name: String,
    idempotent: bool,
}

impl MemoryProducer {
    fn write(&self, topic: &str, envelopes: &[MessageEnvelope]) -> Result<Vec<DeliveryReport>> {
        let mut state = self.shared.state.lock();
        state.send_attempts += 1;
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(Error::Publish {
                topic: topic.to_string(),
                message: "broker rejected the request".to_string(),
            });
        }

        let reports = envelopes
            .iter()
            .map(|envelope| state.append(self.id, self.idempotent, topic, envelope))
            .collect();

        if state.lose_acks > 0 {
            state.lose_acks -= 1;
            drop(state);
            self.shared.appended.notify_waiters();
            return Err(Error::Timeout {
                message: format!("acknowledgement for '{}' was lost", topic),
            });
        }

        drop(state);
        self.shared.appended.notify_waiters();
        Ok(reports)
    }
}

#[async_trait]
impl BrokerProducer for MemoryProducer {
    async fn send(&self, topic: &str, envelope: &MessageEnvelope, _compression: Compression) -> Result<DeliveryReport> {
        let mut reports = self.write(topic, std::slice::from_ref(envelope))?;
        reports.pop().ok_or_else(|| Error::Publish {
            topic: topic.to_string(),
            message: "no delivery report".to_string(),
        })
    }

    async fn send_batch(
        &self,
        topic: &str,
        envelopes: &[MessageEnvelope],
        _compression: Compression,
    ) -> Result<Vec<DeliveryReport>> {
        self.write(topic, envelopes)
    }

    async fn close(&self) -> Result<()> {
        self.shared
            .state
            .lock()
            .lifecycle
            .push(format!("producer:{}", self.name));
        Ok(())
    }
}

struct MemoryConsumer {
    shared: Arc<Shared>,
    group_id: String,
    from_beginning: bool,
    topics: Mutex<Vec<String>>,
    positions: Mutex<HashMap<(String, i32), i64>>,
    paused: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl MemoryConsumer {
    /// Takes up to `max_records` from unpaused partitions, advancing positions.
    fn take(&self, max_records: usize) -> Vec<InboundRecord> {
        let state = self.shared.state.lock();
        let topics = self.topics.lock().clone();
        let paused = self.paused.lock().clone();
        let mut positions = self.positions.lock();
        let mut batch = Vec::new();

        for topic in topics.iter().filter(|t| !paused.contains(*t)) {
            let Some(log) = state.topics.get(topic) else {
                continue;
            };
            for (partition, records) in log.partitions.iter().enumerate() {
                let partition = partition as i32;
                let position = positions.entry((topic.clone(), partition)).or_insert_with(|| {
                    state
                        .committed
                        .get(&(self.group_id.clone(), topic.clone(), partition))
                        .copied()
                        .unwrap_or(0)
                });

                while batch.len() < max_records {
                    match records.get(*position as usize) {
                        Some(stored) => {
                            batch.push(stored.record.clone());
                            *position += 1;
                        }
                        None => break,
                    }
                }
            }
        }
        batch
    }
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        let state = self.shared.state.lock();
        state.ensure_available()?;
        let mut positions = self.positions.lock();

        for topic in topics {
            let Some(log) = state.topics.get(topic) else {
                continue;
            };
            for (partition, records) in log.partitions.iter().enumerate() {
                let partition = partition as i32;
                let start = match state
                    .committed
                    .get(&(self.group_id.clone(), topic.clone(), partition))
                {
                    Some(committed) => *committed,
                    None if self.from_beginning => 0,
                    None => records.len() as i64,
                };
                positions.insert((topic.clone(), partition), start);
            }
        }

        *self.topics.lock() = topics.to_vec();
        Ok(())
    }

    async fn poll_batch(&self, max_records: usize, timeout: Duration) -> Result<Vec<InboundRecord>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::Connection("consumer is closed".to_string()));
            }

            let appended = self.shared.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let batch = self.take(max_records);
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, appended).await;
        }
    }

    fn pause(&self, topics: &[String]) -> Result<()> {
        self.paused.lock().extend(topics.iter().cloned());
        Ok(())
    }

    fn resume(&self, topics: &[String]) -> Result<()> {
        let mut paused = self.paused.lock();
        for topic in topics {
            paused.remove(topic);
        }
        drop(paused);
        self.shared.appended.notify_waiters();
        Ok(())
    }

    fn seek(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.positions
            .lock()
            .insert((topic.to_string(), partition), offset.max(0));
        self.shared.appended.notify_waiters();
        Ok(())
    }

    fn resolve(&self, record: &InboundRecord) -> Result<()> {
        self.shared.state.lock().committed.insert(
            (self.group_id.clone(), record.topic.clone(), record.partition),
            record.offset + 1,
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.shared
            .state
            .lock()
            .lifecycle
            .push(format!("consumer:{}", self.group_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::key_strategy::KeyStrategy;
    use crate::config::PublishOptions;
    use serde_json::json;

    fn envelope(payload: serde_json::Value) -> MessageEnvelope {
        MessageEnvelope::build(&payload, &PublishOptions::new(), &KeyStrategy::default(), "test").unwrap()
    }

    #[tokio::test]
    async fn test_same_key_lands_on_same_partition() {
        let broker = MemoryBroker::new();
        broker.seed_topic("events.scan.results", 6);
        let producer = broker.create_producer("p", &ProducerOptions::default()).await.unwrap();

        let first = producer
            .send("events.scan.results", &envelope(json!({"id": "host-1", "n": 1})), Compression::Gzip)
            .await
            .unwrap();
        let second = producer
            .send("events.scan.results", &envelope(json!({"id": "host-1", "n": 2})), Compression::Gzip)
            .await
            .unwrap();

        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);
    }

    #[tokio::test]
    async fn test_idempotent_producer_drops_resent_record() {
        let broker = MemoryBroker::new();
        let idempotent = broker.create_producer("p", &ProducerOptions::default()).await.unwrap();
        let message = envelope(json!({"id": "evt-1"}));

        broker.lose_next_acks(1);
        assert!(idempotent.send("t.a", &message, Compression::None).await.is_err());
        idempotent.send("t.a", &message, Compression::None).await.unwrap();
        assert_eq!(broker.records("t.a").len(), 1);

        let plain = broker
            .create_producer(
                "plain",
                &ProducerOptions {
                    idempotent: false,
                    ..ProducerOptions::default()
                },
            )
            .await
            .unwrap();
        broker.lose_next_acks(1);
        assert!(plain.send("t.b", &message, Compression::None).await.is_err());
        plain.send("t.b", &message, Compression::None).await.unwrap();
        assert_eq!(broker.records("t.b").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_committed_offsets_survive_new_consumer() {
        let broker = MemoryBroker::new();
        broker.seed_topic("t", 1);
        for n in 0..3 {
            broker.produce_raw("t", None, format!("{{\"n\":{}}}", n).as_bytes());
        }
        let topics = vec!["t".to_string()];
        let options = SubscribeOptions::new().from_beginning(true);

        let consumer = broker.create_consumer("g", &options).await.unwrap();
        consumer.subscribe(&topics).await.unwrap();
        let batch = consumer.poll_batch(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 3);
        consumer.resolve(&batch[0]).unwrap();
        consumer.close().await.unwrap();
        assert_eq!(broker.committed_offset("g", "t", 0), Some(1));

        let again = broker.create_consumer("g", &options).await.unwrap();
        again.subscribe(&topics).await.unwrap();
        let batch = again.poll_batch(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_skips_existing_records() {
        let broker = MemoryBroker::new();
        broker.seed_topic("t", 1);
        broker.produce_raw("t", None, b"{}");

        let consumer = broker.create_consumer("g", &SubscribeOptions::new()).await.unwrap();
        consumer.subscribe(&["t".to_string()]).await.unwrap();
        assert!(consumer.poll_batch(10, Duration::from_millis(50)).await.unwrap().is_empty());

        broker.produce_raw("t", None, b"{\"new\":true}");
        let batch = consumer.poll_batch(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].offset, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_seek() {
        let broker = MemoryBroker::new();
        broker.seed_topic("t", 1);
        let consumer = broker
            .create_consumer("g", &SubscribeOptions::new().from_beginning(true))
            .await
            .unwrap();
        consumer.subscribe(&["t".to_string()]).await.unwrap();
        broker.produce_raw("t", None, b"1");
        broker.produce_raw("t", None, b"2");

        consumer.pause(&["t".to_string()]).unwrap();
        assert!(consumer.poll_batch(10, Duration::from_millis(50)).await.unwrap().is_empty());

        consumer.resume(&["t".to_string()]).unwrap();
        assert_eq!(consumer.poll_batch(10, Duration::from_millis(50)).await.unwrap().len(), 2);

        consumer.seek("t", 0, 1).unwrap();
        let batch = consumer.poll_batch(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(&batch[0].value[..], b"2");
    }

    #[tokio::test]
    async fn test_unavailable_broker_refuses_connect() {
        let broker = MemoryBroker::new();
        broker.set_unavailable(true);
        assert!(matches!(broker.connect().await, Err(Error::Connection(_))));
        assert!(!broker.is_connected());
    }
}
