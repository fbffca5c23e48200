#![allow(dead_code)]

use sentinel_bus::broker::MemoryBroker;
use sentinel_bus::{Config, Connector, ConnectorEvent};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const ALERTS_TOPIC: &str = "events.security.alerts";
pub const SCAN_TOPIC: &str = "events.scan.results";
pub const SCAN_DLQ_TOPIC: &str = "events.dlq.scan";

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("sentinel_bus=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

/// Configuration with short delays so failure paths finish quickly.
pub fn get_test_config() -> Config {
    let mut config = Config::local(&["memory:9092"]);
    config.topics.known = vec![
        ALERTS_TOPIC.to_string(),
        SCAN_TOPIC.to_string(),
        SCAN_DLQ_TOPIC.to_string(),
    ];
    config.resilience.failure_threshold = 3;
    config.resilience.circuit_timeout_ms = 30_000;
    config.resilience.max_retries = 2;
    config.resilience.base_delay_ms = 10;
    config.consumer.poll_timeout_ms = 200;
    config
}

pub async fn connected(broker: &MemoryBroker, config: Config) -> Connector {
    let connector = Connector::with_broker(config, Arc::new(broker.clone())).unwrap();
    connector.connect().await.unwrap();
    connector
}

/// Receives events until `done` accepts what has been collected so far.
pub async fn collect_until<F>(
    events: &mut broadcast::Receiver<ConnectorEvent>,
    done: F,
) -> Vec<ConnectorEvent>
where
    F: Fn(&[ConnectorEvent]) -> bool,
{
    let mut collected = Vec::new();
    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        while !done(&collected) {
            match events.recv().await {
                Ok(event) => collected.push(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await;
    assert!(finished.is_ok(), "timed out waiting for events: {:?}", collected);
    collected
}

pub fn count(events: &[ConnectorEvent], name: &str) -> usize {
    events.iter().filter(|e| e.name() == name).count()
}

/// Brokers for tests that need a running Kafka.
pub fn live_brokers() -> Vec<String> {
    env::var("TEST_KAFKA_BROKERS")
        .unwrap_or_else(|_| "localhost:9092".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .collect()
}
