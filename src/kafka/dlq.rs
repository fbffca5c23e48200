//! Dead-letter records for messages a consumer handler could not process.

use crate::broker::InboundRecord;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    Utf8,
    Base64,
}

/// Failure context captured for a message, published to the dead-letter topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub original_topic: String,
    /// The message body exactly as received, before deserialization.
    pub original_message: String,
    pub encoding: BodyEncoding,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub group_id: String,
    pub partition: i32,
    pub offset: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl DeadLetterRecord {
    pub fn capture(record: &InboundRecord, group_id: &str, error: impl Into<String>) -> Self {
        let (original_message, encoding) = match std::str::from_utf8(&record.value) {
            Ok(text) => (text.to_string(), BodyEncoding::Utf8),
            Err(_) => (STANDARD.encode(&record.value), BodyEncoding::Base64),
        };

        Self {
            original_topic: record.topic.clone(),
            original_message,
            encoding,
            error: error.into(),
            timestamp: Utc::now(),
            group_id: group_id.to_string(),
            partition: record.partition,
            offset: record.offset,
            key: record
                .key
                .as_ref()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
        }
    }

    /// The original body bytes.
    pub fn raw_body(&self) -> Vec<u8> {
        match self.encoding {
            BodyEncoding::Utf8 => self.original_message.as_bytes().to_vec(),
            BodyEncoding::Base64 => STANDARD
                .decode(&self.original_message)
                .unwrap_or_else(|_| self.original_message.as_bytes().to_vec()),
        }
    }
}
