//! Liveness probe backed by a cluster metadata request.

use crate::broker::Broker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub is_healthy: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_count: Option<usize>,
    pub last_check_timestamp: DateTime<Utc>,
}

/// Fetches cluster metadata. Failures are reported in the result, never raised.
pub async fn probe(broker: &dyn Broker) -> HealthReport {
    let last_check_timestamp = Utc::now();

    match broker.cluster_metadata().await {
        Ok(metadata) => {
            debug!(
                brokers = metadata.broker_count,
                topics = metadata.topics.len(),
                "Health probe succeeded"
            );
            HealthReport {
                is_healthy: true,
                message: "Kafka cluster is reachable".to_string(),
                broker_count: Some(metadata.broker_count),
                topic_count: Some(metadata.topics.len()),
                last_check_timestamp,
            }
        }
        Err(e) => {
            warn!(error = %e, "Health probe failed");
            HealthReport {
                is_healthy: false,
                message: e.to_string(),
                broker_count: None,
                topic_count: None,
                last_check_timestamp,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    #[tokio::test]
    async fn test_healthy_report() {
        let broker = MemoryBroker::new();
        broker.seed_topic("events.security.alerts", 6);
        broker.seed_topic("events.scan.results", 6);
        broker.connect().await.unwrap();

        let report = probe(&broker).await;
        assert!(report.is_healthy);
        assert_eq!(report.broker_count, Some(1));
        assert_eq!(report.topic_count, Some(2));
    }

    #[tokio::test]
    async fn test_failure_is_reported_not_raised() {
        let broker = MemoryBroker::new();
        let report = probe(&broker).await;
        assert!(!report.is_healthy);
        assert!(report.message.contains("not connected"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["isHealthy"], false);
        assert!(json.get("brokerCount").is_none());
        assert!(json["lastCheckTimestamp"].is_string());
    }
}
