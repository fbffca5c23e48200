use crate::broker::Broker;
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

pub const DLQ_RETENTION_MS: i64 = 7 * DAY_MS;
pub const AUDIT_RETENTION_MS: i64 = 365 * DAY_MS;
pub const DEFAULT_RETENTION_MS: i64 = 30 * DAY_MS;

/// Topics the connector provisions when no catalog is configured.
pub const DEFAULT_TOPICS: &[&str] = &[
    "events.security.alerts",
    "events.security.incidents",
    "events.security.threat-intel",
    "events.scan.requests",
    "events.scan.results",
    "events.scan.vulnerabilities",
    "events.network.flows",
    "events.network.anomalies",
    "events.network.dns",
    "events.compliance.reports",
    "events.compliance.violations",
    "events.audit.user-actions",
    "events.audit.system",
    "events.notifications.outbound",
    "events.dlq.security",
    "events.dlq.scan",
    "events.dlq.default",
];

/// Category a topic name falls into, in match priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicCategory {
    DeadLetter,
    Scan,
    Network,
    Security,
    Default,
}

impl TopicCategory {
    pub fn classify(topic: &str) -> Self {
        if topic.contains(".dlq.") {
            TopicCategory::DeadLetter
        } else if topic.contains(".scan.") {
            TopicCategory::Scan
        } else if topic.contains(".network.") {
            TopicCategory::Network
        } else if topic.contains(".security.") {
            TopicCategory::Security
        } else {
            TopicCategory::Default
        }
    }

    pub fn partitions(&self) -> i32 {
        match self {
            TopicCategory::DeadLetter => 3,
            TopicCategory::Scan => 6,
            TopicCategory::Network => 12,
            TopicCategory::Security => 6,
            TopicCategory::Default => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPolicy {
    Delete,
}

impl CleanupPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupPolicy::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i32,
    pub retention_ms: i64,
    pub cleanup_policy: CleanupPolicy,
}

impl TopicSpec {
    /// Derives partitioning and retention from the topic name alone.
    pub fn for_topic(name: &str, replication_factor: i32) -> Self {
        let category = TopicCategory::classify(name);
        let retention_ms = if category == TopicCategory::DeadLetter {
            DLQ_RETENTION_MS
        } else if name.contains(".compliance.") || name.contains(".audit.") {
            AUDIT_RETENTION_MS
        } else {
            DEFAULT_RETENTION_MS
        };

        Self {
            name: name.to_string(),
            partitions: category.partitions(),
            replication_factor,
            retention_ms,
            cleanup_policy: CleanupPolicy::Delete,
        }
    }
}

/// Creates missing topics according to the naming policy. Existing topics
/// are never altered.
pub struct TopicManager {
    broker: Arc<dyn Broker>,
    replication_factor: i32,
    verified_topics: Mutex<HashSet<String>>,
}

impl TopicManager {
    pub fn new(broker: Arc<dyn Broker>, replication_factor: i32) -> Self {
        Self {
            broker,
            replication_factor,
            verified_topics: Mutex::new(HashSet::new()),
        }
    }

    pub fn spec_for(&self, topic: &str) -> TopicSpec {
        TopicSpec::for_topic(topic, self.replication_factor)
    }

    /// Lists the cluster's topics and creates every missing one in a single
    /// batch. Returns the names that were created.
    #[instrument(skip(self, topics), fields(known = topics.len()))]
    pub async fn provision(&self, topics: &[String]) -> Result<Vec<String>> {
        let existing: HashSet<String> = self.broker.list_topics().await?.into_iter().collect();

        let mut seen = HashSet::new();
        let missing: Vec<TopicSpec> = topics
            .iter()
            .filter(|t| !existing.contains(*t) && seen.insert(t.as_str()))
            .map(|t| self.spec_for(t))
            .collect();

        if missing.is_empty() {
            info!("All {} known topics already exist", topics.len());
        } else {
            for spec in &missing {
                debug!(
                    topic = %spec.name,
                    partitions = spec.partitions,
                    retention_ms = spec.retention_ms,
                    "Creating topic"
                );
            }
            self.broker.create_topics(&missing).await?;
            info!("Created {} topics", missing.len());
        }

        let mut verified = self.verified_topics.lock();
        verified.extend(existing.into_iter().filter(|t| topics.contains(t)));
        verified.extend(missing.iter().map(|s| s.name.clone()));

        Ok(missing.into_iter().map(|s| s.name).collect())
    }

    #[instrument(skip(self), fields(topic = %topic_name))]
    pub async fn ensure_topic_exists(&self, topic_name: &str) -> Result<()> {
        if self.verified_topics.lock().contains(topic_name) {
            debug!("Topic '{}' already verified to exist", topic_name);
            return Ok(());
        }

        match self.broker.list_topics().await {
            Ok(topics) if topics.iter().any(|t| t == topic_name) => {
                info!("Topic '{}' already exists", topic_name);
            }
            Ok(_) => {
                info!("Creating topic '{}'", topic_name);
                self.broker.create_topics(&[self.spec_for(topic_name)]).await?;
            }
            Err(e) => {
                warn!("Failed to check if topic '{}' exists: {}", topic_name, e);
                return Err(e);
            }
        }

        self.verified_topics.lock().insert(topic_name.to_string());
        Ok(())
    }

    /// Forgets which topics were verified; the next connect lists again.
    pub fn clear(&self) {
        self.verified_topics.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    #[test]
    fn test_partition_policy() {
        assert_eq!(TopicSpec::for_topic("events.dlq.security", 1).partitions, 3);
        assert_eq!(TopicSpec::for_topic("events.scan.results", 1).partitions, 6);
        assert_eq!(TopicSpec::for_topic("events.network.flows", 1).partitions, 12);
        assert_eq!(TopicSpec::for_topic("events.security.alerts", 1).partitions, 6);
        assert_eq!(TopicSpec::for_topic("events.notifications.outbound", 1).partitions, 6);
    }

    #[test]
    fn test_retention_policy() {
        assert_eq!(
            TopicSpec::for_topic("events.dlq.scan", 1).retention_ms,
            7 * 86_400_000
        );
        assert_eq!(
            TopicSpec::for_topic("events.compliance.reports", 1).retention_ms,
            365 * 86_400_000
        );
        assert_eq!(
            TopicSpec::for_topic("events.audit.system", 1).retention_ms,
            365 * 86_400_000
        );
        assert_eq!(
            TopicSpec::for_topic("events.security.alerts", 1).retention_ms,
            30 * 86_400_000
        );
        assert_eq!(
            TopicSpec::for_topic("events.security.alerts", 1).cleanup_policy,
            CleanupPolicy::Delete
        );
    }

    #[test]
    fn test_dlq_wins_over_every_other_category() {
        for name in [
            "events.dlq.scan.results",
            "events.network.dlq.flows",
            "events.security.dlq.alerts",
            "events.audit.dlq.system",
            "events.compliance.dlq.scan.network.security.x",
        ] {
            let spec = TopicSpec::for_topic(name, 3);
            assert_eq!(spec.partitions, 3, "{}", name);
            assert_eq!(spec.retention_ms, 7 * 86_400_000, "{}", name);
        }
    }

    #[test]
    fn test_category_priority() {
        assert_eq!(
            TopicCategory::classify("events.scan.network.results"),
            TopicCategory::Scan
        );
        assert_eq!(
            TopicCategory::classify("events.network.security.flows"),
            TopicCategory::Network
        );
        // Segment matching needs the surrounding dots.
        assert_eq!(TopicCategory::classify("dlq.events"), TopicCategory::Default);
        assert_eq!(TopicCategory::classify("events.scan"), TopicCategory::Default);
    }

    #[tokio::test]
    async fn test_provision_creates_missing_in_one_batch() {
        let broker = Arc::new(MemoryBroker::new());
        broker.seed_topic("events.security.alerts", 2);
        broker.connect().await.unwrap();

        let manager = TopicManager::new(broker.clone(), 1);
        let known = vec![
            "events.security.alerts".to_string(),
            "events.scan.results".to_string(),
            "events.dlq.scan".to_string(),
        ];

        let created = manager.provision(&known).await.unwrap();
        assert_eq!(created, vec!["events.scan.results", "events.dlq.scan"]);
        assert_eq!(broker.create_topic_calls(), 1);

        // Existing topic keeps its original layout.
        assert_eq!(broker.topic_spec("events.security.alerts").unwrap().partitions, 2);
        assert_eq!(broker.topic_spec("events.dlq.scan").unwrap().partitions, 3);

        let created = manager.provision(&known).await.unwrap();
        assert!(created.is_empty());
        assert_eq!(broker.create_topic_calls(), 1);
    }

    #[tokio::test]
    async fn test_ensure_topic_exists_caches() {
        let broker = Arc::new(MemoryBroker::new());
        broker.connect().await.unwrap();
        let manager = TopicManager::new(broker.clone(), 1);

        manager.ensure_topic_exists("events.dlq.default").await.unwrap();
        manager.ensure_topic_exists("events.dlq.default").await.unwrap();
        assert_eq!(broker.create_topic_calls(), 1);
        assert_eq!(broker.topic_spec("events.dlq.default").unwrap().partitions, 3);
    }
}
