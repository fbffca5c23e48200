pub mod consumer;
pub mod dlq;
pub mod envelope;
pub mod key_strategy;
pub mod producer;
pub mod schema;
pub mod topic_manager;

pub use consumer::{ConsumedMessage, ConsumerGroupManager, GroupStatus, MessageHandler};
pub use dlq::DeadLetterRecord;
pub use envelope::MessageEnvelope;
pub use key_strategy::KeyStrategy;
pub use producer::{BatchReceipt, ProducerPool, PublishReceipt, Publisher};
pub use schema::SchemaRegistry;
pub use topic_manager::{TopicManager, TopicSpec};
