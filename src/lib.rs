pub mod broker;
pub mod config;
pub mod connector;
pub mod error;
pub mod events;
pub mod health;
pub mod kafka;
pub mod resilience;

pub use config::{Compression, Config, ProducerOptions, PublishOptions, SubscribeOptions};
pub use connector::{Connector, ConnectorBuilder, ConnectorState};
pub use error::{Error, Result};
pub use events::{ConnectorEvent, EventBus};
pub use health::HealthReport;
pub use kafka::{ConsumedMessage, GroupStatus, KeyStrategy, MessageHandler};
