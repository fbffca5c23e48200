//! Consumer groups and their message-processing loops.
//!
//! Each subscribed group gets one background task. The task polls batches,
//! splits them by partition, and feeds partitions to the handler
//! concurrently while keeping per-partition order. Handler failures are
//! dead-lettered when a DLQ topic is configured and then either skipped or
//! treated as fatal for the group.

use crate::broker::{Broker, BrokerConsumer, InboundRecord};
use crate::config::{ConsumerConfig, PublishOptions, SubscribeOptions};
use crate::events::{ConnectorEvent, EventBus};
use crate::kafka::dlq::DeadLetterRecord;
use crate::kafka::envelope::{decode_headers, decode_value};
use crate::kafka::producer::Publisher;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// A message handed to a consumer handler.
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Value,
    pub headers: HashMap<String, String>,
    pub timestamp: Option<i64>,
}

impl ConsumedMessage {
    fn decode(record: &InboundRecord) -> Result<Self> {
        Ok(Self {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            key: record
                .key
                .as_ref()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            value: decode_value(&record.value)?,
            headers: decode_headers(&record.headers),
            timestamp: record.timestamp,
        })
    }
}

/// Per-message callback supplied by the subscriber.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: ConsumedMessage) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(ConsumedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: ConsumedMessage) -> anyhow::Result<()> {
        (self)(message).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupStatus {
    Subscribed,
    Running,
    Paused,
    Crashed,
    Disconnected,
}

struct ConsumerGroupHandle {
    topics: Vec<String>,
    paused: HashSet<String>,
    consumer: Arc<dyn BrokerConsumer>,
    status: Arc<SyncMutex<GroupStatus>>,
    shutdown: watch::Sender<bool>,
    /// Owned by the group until release so the loop is never detached.
    task: JoinHandle<()>,
    finished: watch::Receiver<bool>,
    outcome: Arc<SyncMutex<Option<Result<()>>>>,
}

pub struct ConsumerGroupManager {
    broker: Arc<dyn Broker>,
    publisher: Arc<Publisher>,
    events: EventBus,
    config: ConsumerConfig,
    groups: Mutex<HashMap<String, ConsumerGroupHandle>>,
    closed: AtomicBool,
}

impl ConsumerGroupManager {
    pub fn new(
        broker: Arc<dyn Broker>,
        publisher: Arc<Publisher>,
        events: EventBus,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            broker,
            publisher,
            events,
            config,
            groups: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Accepts subscriptions again after [`disconnect_all`](Self::disconnect_all).
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Registers `group_id` on `topics` and starts its processing loop.
    #[instrument(skip(self, handler, options), fields(group_id = %group_id))]
    pub async fn subscribe(
        &self,
        group_id: &str,
        mut topics: Vec<String>,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<()> {
        topics.sort();
        topics.dedup();
        if topics.is_empty() {
            return Err(Error::ConsumerGroup {
                group_id: group_id.to_string(),
                message: "at least one topic is required".to_string(),
            });
        }

        let mut groups = self.groups.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConsumerGroup {
                group_id: group_id.to_string(),
                message: "consumer groups are shutting down".to_string(),
            });
        }
        if groups.contains_key(group_id) {
            return Err(Error::ConsumerGroup {
                group_id: group_id.to_string(),
                message: "group is already subscribed".to_string(),
            });
        }

        let consumer = self.broker.create_consumer(group_id, &options).await?;
        consumer.subscribe(&topics).await?;
        info!(
            topics = ?topics,
            from_beginning = options.from_beginning,
            dlq_topic = ?options.dlq_topic,
            continue_on_error = options.continue_on_error,
            "Consumer group subscribed"
        );

        let status = Arc::new(SyncMutex::new(GroupStatus::Subscribed));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = GroupWorker {
            group_id: group_id.to_string(),
            consumer: consumer.clone(),
            handler,
            options,
            publisher: self.publisher.clone(),
            events: self.events.clone(),
            status: status.clone(),
            max_batch: self.config.max_batch_size,
            poll_timeout: self.config.poll_timeout(),
        };
        let (finished_tx, finished_rx) = watch::channel(false);
        let outcome = Arc::new(SyncMutex::new(None));
        let slot = outcome.clone();
        let span = tracing::info_span!("consumer_group", group_id = %group_id);
        let task = tokio::spawn(
            async move {
                let result = worker.run(shutdown_rx).await;
                *slot.lock() = Some(result);
                let _ = finished_tx.send(true);
            }
            .instrument(span),
        );

        groups.insert(
            group_id.to_string(),
            ConsumerGroupHandle {
                topics,
                paused: HashSet::new(),
                consumer,
                status,
                shutdown: shutdown_tx,
                task,
                finished: finished_rx,
                outcome,
            },
        );
        Ok(())
    }

    pub async fn pause(&self, group_id: &str, topics: &[String]) -> Result<()> {
        let mut groups = self.groups.lock().await;
        let handle = lookup(&mut groups, group_id)?;
        let topics = scoped_topics(handle, group_id, topics)?;

        handle.consumer.pause(&topics)?;
        handle.paused.extend(topics.iter().cloned());
        let mut status = handle.status.lock();
        let active = matches!(*status, GroupStatus::Subscribed | GroupStatus::Running);
        if active && handle.paused.len() == handle.topics.len() {
            *status = GroupStatus::Paused;
        }
        info!(group_id, topics = ?topics, "Consumer paused");
        Ok(())
    }

    pub async fn resume(&self, group_id: &str, topics: &[String]) -> Result<()> {
        let mut groups = self.groups.lock().await;
        let handle = lookup(&mut groups, group_id)?;
        let topics = scoped_topics(handle, group_id, topics)?;

        handle.consumer.resume(&topics)?;
        for topic in &topics {
            handle.paused.remove(topic);
        }
        let mut status = handle.status.lock();
        if *status == GroupStatus::Paused {
            *status = GroupStatus::Running;
        }
        info!(group_id, topics = ?topics, "Consumer resumed");
        Ok(())
    }

    pub async fn seek(&self, group_id: &str, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut groups = self.groups.lock().await;
        let handle = lookup(&mut groups, group_id)?;
        if !handle.topics.iter().any(|t| t == topic) {
            return Err(Error::ConsumerGroup {
                group_id: group_id.to_string(),
                message: format!("not subscribed to topic '{}'", topic),
            });
        }

        handle.consumer.seek(topic, partition, offset)?;
        info!(group_id, topic, partition, offset, "Consumer seeked");
        Ok(())
    }

    pub async fn status(&self, group_id: &str) -> Option<GroupStatus> {
        self.groups
            .lock()
            .await
            .get(group_id)
            .map(|handle| *handle.status.lock())
    }

    pub async fn group_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.groups.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Waits for the group's loop to finish and returns its outcome. A
    /// fail-stop handler error surfaces here. Dropping the returned future
    /// leaves the loop owned by the group, so a later release still joins it.
    pub async fn wait(&self, group_id: &str) -> Result<()> {
        let (mut finished, outcome) = {
            let mut groups = self.groups.lock().await;
            let handle = lookup(&mut groups, group_id)?;
            (handle.finished.clone(), handle.outcome.clone())
        };

        // A closed channel means the loop task died before reporting.
        let _ = finished.wait_for(|done| *done).await;

        let result = outcome.lock().take();
        result.unwrap_or_else(|| {
            Err(Error::ConsumerGroup {
                group_id: group_id.to_string(),
                message: "processing loop outcome unavailable (already awaited or aborted)".to_string(),
            })
        })
    }

    /// Stops the group's loop and releases its consumer.
    pub async fn unsubscribe(&self, group_id: &str) -> Result<()> {
        let handle = self.groups.lock().await.remove(group_id);
        match handle {
            Some(handle) => {
                self.release(group_id, handle).await;
                Ok(())
            }
            None => Err(unknown_group(group_id)),
        }
    }

    /// Releases every group. Failures are logged per group and never stop
    /// the remaining groups from being released.
    /// New subscriptions are refused until [`reopen`](Self::reopen).
    pub async fn disconnect_all(&self) {
        let drained: Vec<(String, ConsumerGroupHandle)> = {
            let mut groups = self.groups.lock().await;
            self.closed.store(true, Ordering::SeqCst);
            groups.drain().collect()
        };
        for (group_id, handle) in drained {
            self.release(&group_id, handle).await;
        }
    }

    async fn release(&self, group_id: &str, mut handle: ConsumerGroupHandle) {
        let _ = handle.shutdown.send(true);

        match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle.task).await {
            Ok(Ok(())) => debug!(group_id, "Processing loop stopped"),
            Ok(Err(e)) => error!(group_id, error = %e, "Processing loop panicked"),
            Err(_) => {
                warn!(group_id, "Processing loop did not stop in time, aborting");
                handle.task.abort();
            }
        }

        if let Err(e) = handle.consumer.close().await {
            error!(group_id, error = %e, "Failed to release consumer");
        }
        *handle.status.lock() = GroupStatus::Disconnected;
        info!(group_id, "Consumer disconnected");
        self.events.emit(ConnectorEvent::ConsumerDisconnect {
            group_id: group_id.to_string(),
            timestamp: Utc::now(),
        });
    }
}

fn lookup<'a>(
    groups: &'a mut HashMap<String, ConsumerGroupHandle>,
    group_id: &str,
) -> Result<&'a mut ConsumerGroupHandle> {
    groups.get_mut(group_id).ok_or_else(|| unknown_group(group_id))
}

fn unknown_group(group_id: &str) -> Error {
    Error::ConsumerGroup {
        group_id: group_id.to_string(),
        message: "no such consumer group".to_string(),
    }
}

/// An empty topic list means every subscribed topic.
fn scoped_topics(handle: &ConsumerGroupHandle, group_id: &str, topics: &[String]) -> Result<Vec<String>> {
    if topics.is_empty() {
        return Ok(handle.topics.clone());
    }
    if let Some(unknown) = topics.iter().find(|t| !handle.topics.contains(t)) {
        return Err(Error::ConsumerGroup {
            group_id: group_id.to_string(),
            message: format!("not subscribed to topic '{}'", unknown),
        });
    }
    Ok(topics.to_vec())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

struct GroupWorker {
    group_id: String,
    consumer: Arc<dyn BrokerConsumer>,
    handler: Arc<dyn MessageHandler>,
    options: SubscribeOptions,
    publisher: Arc<Publisher>,
    events: EventBus,
    status: Arc<SyncMutex<GroupStatus>>,
    max_batch: usize,
    poll_timeout: Duration,
}

impl GroupWorker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        {
            let mut status = self.status.lock();
            if *status == GroupStatus::Subscribed {
                *status = GroupStatus::Running;
            }
        }
        debug!("Processing loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let polled = tokio::select! {
                _ = shutdown.changed() => break,
                polled = self.consumer.poll_batch(self.max_batch, self.poll_timeout) => polled,
            };

            let outcome = match polled {
                Ok(records) if records.is_empty() => continue,
                Ok(records) => self.process_batch(records).await,
                Err(e) => Err(e),
            };

            if let Err(e) = outcome {
                *self.status.lock() = GroupStatus::Crashed;
                error!(error = %e, "Consumer crashed");
                self.events.emit(ConnectorEvent::ConsumerCrash {
                    group_id: self.group_id.clone(),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                return Err(e);
            }
        }

        debug!("Processing loop stopped by shutdown");
        Ok(())
    }

    async fn process_batch(&self, records: Vec<InboundRecord>) -> Result<()> {
        debug!(records = records.len(), "Processing batch");

        let mut partitions: BTreeMap<(String, i32), Vec<InboundRecord>> = BTreeMap::new();
        for record in records {
            partitions
                .entry((record.topic.clone(), record.partition))
                .or_default()
                .push(record);
        }

        let halted = AtomicBool::new(false);
        let results = join_all(
            partitions
                .values()
                .map(|records| self.process_partition(records, &halted)),
        )
        .await;

        if let Some(e) = results.into_iter().find_map(Result::err) {
            return Err(e);
        }

        if !self.options.each_batch_auto_resolve {
            for last in partitions.values().filter_map(|records| records.last()) {
                self.consumer.resolve(last)?;
            }
        }
        Ok(())
    }

    async fn process_partition(&self, records: &[InboundRecord], halted: &AtomicBool) -> Result<()> {
        for record in records {
            if halted.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.process_message(record).await {
                halted.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn process_message(&self, record: &InboundRecord) -> Result<()> {
        let outcome = match ConsumedMessage::decode(record) {
            Ok(message) => match AssertUnwindSafe(self.handler.handle(message))
                .catch_unwind()
                .await
            {
                Ok(handled) => handled.map_err(|e| format!("{:#}", e)),
                Err(panic) => Err(format!("handler panicked: {}", panic_message(&*panic))),
            },
            Err(e) => Err(format!("failed to decode message: {}", e)),
        };

        let error_text = match outcome {
            Ok(()) => {
                self.events.emit(ConnectorEvent::MessageConsumed {
                    group_id: self.group_id.clone(),
                    topic: record.topic.clone(),
                    partition: record.partition,
                    offset: record.offset,
                    timestamp: Utc::now(),
                });
                if self.options.each_batch_auto_resolve {
                    self.consumer.resolve(record)?;
                }
                return Ok(());
            }
            Err(text) => text,
        };

        warn!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            error = %error_text,
            "Message handler failed"
        );

        let dead_lettered = match &self.options.dlq_topic {
            Some(dlq_topic) => self.dead_letter(dlq_topic, record, &error_text).await,
            None => false,
        };

        self.events.emit(ConnectorEvent::MessageError {
            group_id: self.group_id.clone(),
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            error: error_text.clone(),
            dead_lettered,
            timestamp: Utc::now(),
        });

        if self.options.continue_on_error {
            if self.options.each_batch_auto_resolve {
                self.consumer.resolve(record)?;
            }
            Ok(())
        } else {
            Err(Error::Handler {
                topic: record.topic.clone(),
                group_id: self.group_id.clone(),
                message: error_text,
            })
        }
    }

    /// Best effort: a failed dead-letter publish is logged, never raised.
    async fn dead_letter(&self, dlq_topic: &str, record: &InboundRecord, error_text: &str) -> bool {
        let dead_letter = DeadLetterRecord::capture(record, &self.group_id, error_text);
        let options = PublishOptions::new()
            .source(self.group_id.clone())
            .message_type("dead-letter");

        match self.publisher.publish(dlq_topic, &dead_letter, &options).await {
            Ok(receipt) => {
                info!(
                    dlq_topic,
                    original_topic = %record.topic,
                    offset = record.offset,
                    message_id = %receipt.message_id,
                    "Message routed to dead-letter topic"
                );
                true
            }
            Err(e) => {
                error!(
                    dlq_topic,
                    original_topic = %record.topic,
                    offset = record.offset,
                    error = %e,
                    "Failed to publish dead-letter record"
                );
                false
            }
        }
    }
}
