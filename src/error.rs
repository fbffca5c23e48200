//! Error types and result handling for sentinel-bus.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use sentinel_bus::{Error, Result};
//!
//! fn publish_alert() -> Result<()> {
//!     Err(Error::CircuitOpen { operation: "publish".to_string() })
//! }
//!
//! match publish_alert() {
//!     Ok(()) => println!("Published"),
//!     Err(e) if e.kind() == "CIRCUIT_OPEN" => eprintln!("Broker unavailable: {}", e),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use crate::connector::ConnectorState;
use thiserror::Error;

/// The main error type for sentinel-bus operations.
///
/// Every variant carries enough context (topic, group id, underlying cause)
/// for the caller to log and alert on it.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from an invalid file or environment variable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Kafka client, admin or producer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON serialization error when encoding or decoding messages.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from reading payload files in the CLI.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connecting to the broker cluster failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// An operation required a connected connector.
    #[error("Connector is not connected (state: {state})")]
    NotConnected {
        /// State the connector was in when the call was rejected
        state: ConnectorState,
    },

    /// The payload did not satisfy the schema named by the caller.
    #[error("Schema validation failed for '{schema_id}': {message}")]
    SchemaValidation {
        /// Schema the payload was checked against
        schema_id: String,
        /// First validation failure
        message: String,
    },

    /// The schema document itself could not be compiled.
    #[error("Invalid schema '{schema_id}': {message}")]
    InvalidSchema {
        /// Schema that failed to compile
        schema_id: String,
        /// Compiler diagnostic
        message: String,
    },

    /// The circuit breaker rejected the call without contacting the broker.
    #[error("Circuit breaker is open for operation '{operation}'")]
    CircuitOpen {
        /// Operation class protected by the breaker
        operation: String,
    },

    /// The broker rejected or failed to acknowledge a record.
    #[error("Failed to publish to '{topic}': {message}")]
    Publish {
        /// Destination topic
        topic: String,
        /// Broker-reported reason
        message: String,
    },

    /// A consumer handler failed while processing a message.
    #[error("Handler failed for topic '{topic}' in group '{group_id}': {message}")]
    Handler {
        /// Topic of the failing message
        topic: String,
        /// Consumer group running the handler
        group_id: String,
        /// Handler error text
        message: String,
    },

    /// Consumer group lookup or lifecycle error.
    #[error("Consumer group '{group_id}': {message}")]
    ConsumerGroup {
        /// Group the error belongs to
        group_id: String,
        /// What went wrong
        message: String,
    },

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// The connector is shutting down.
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Stable, upper-snake error code suitable for alert routing.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Kafka(_) => "BROKER_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Connection(_) => "CONNECTION_ERROR",
            Error::NotConnected { .. } => "NOT_CONNECTED",
            Error::SchemaValidation { .. } => "SCHEMA_VALIDATION_ERROR",
            Error::InvalidSchema { .. } => "INVALID_SCHEMA",
            Error::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Error::Publish { .. } => "PUBLISH_ERROR",
            Error::Handler { .. } => "HANDLER_ERROR",
            Error::ConsumerGroup { .. } => "CONSUMER_GROUP_ERROR",
            Error::Timeout { .. } => "TIMEOUT",
            Error::Shutdown => "SHUTDOWN",
        }
    }

    /// Whether another attempt of the same call could succeed.
    ///
    /// Broker errors, publish failures and timeouts are transient. Validation,
    /// configuration and state errors fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Kafka(_) | Error::Publish { .. } | Error::Timeout { .. } | Error::Connection(_)
        )
    }

    /// Schema errors are caller mistakes rather than broker health signals.
    pub fn is_schema_error(&self) -> bool {
        matches!(self, Error::SchemaValidation { .. })
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

/// A convenient Result type alias for sentinel-bus operations.
///
/// This is equivalent to `std::result::Result<T, sentinel_bus::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = Error::SchemaValidation {
            schema_id: "alert.v1".to_string(),
            message: "\"severity\" is a required property".to_string(),
        };
        assert_eq!(err.kind(), "SCHEMA_VALIDATION_ERROR");
        assert!(!err.is_retryable());
        assert!(err.is_schema_error());

        let err = Error::CircuitOpen {
            operation: "publish".to_string(),
        };
        assert_eq!(err.kind(), "CIRCUIT_OPEN");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        let err = Error::Publish {
            topic: "events.security.alerts".to_string(),
            message: "Leader not available".to_string(),
        };
        assert!(err.is_retryable());

        let err = Error::Timeout {
            message: "produce request".to_string(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_display_carries_context() {
        let err = Error::Handler {
            topic: "events.scan.results".to_string(),
            group_id: "scan-workers".to_string(),
            message: "boom".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("events.scan.results"));
        assert!(text.contains("scan-workers"));
        assert!(text.contains("boom"));
    }
}
