//! Wire representation of a published message.
//!
//! Values are UTF-8 JSON. Every envelope carries the reserved headers below;
//! caller-supplied headers are merged last and may replace them.

use crate::config::PublishOptions;
use crate::kafka::key_strategy::{message_identifier, KeyStrategy};
use crate::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_CONNECTOR_VERSION: &str = "x-connector-version";
pub const HEADER_MESSAGE_SOURCE: &str = "x-message-source";
pub const HEADER_MESSAGE_TYPE: &str = "x-message-type";
pub const HEADER_MESSAGE_ID: &str = "x-message-id";

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONNECTOR_VERSION: &str = env!("CARGO_PKG_VERSION");

const UNKNOWN_TYPE: &str = "unknown";

#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    pub message_id: String,
    pub key: Option<String>,
    pub value: Bytes,
    pub headers: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl MessageEnvelope {
    /// Builds the envelope for `payload`.
    ///
    /// The key is the explicit option if given, otherwise whatever
    /// `key_strategy` extracts. The message id is the payload's `id` field,
    /// or a fresh UUID when it has none.
    pub fn build(
        payload: &Value,
        options: &PublishOptions,
        key_strategy: &KeyStrategy,
        default_source: &str,
    ) -> Result<Self> {
        let value = Bytes::from(serde_json::to_vec(payload)?);

        let message_id =
            message_identifier(payload).unwrap_or_else(|| Uuid::new_v4().to_string());
        let key = options
            .key
            .clone()
            .or_else(|| key_strategy.extract_key(payload));

        let source = options
            .source
            .clone()
            .or_else(|| string_field(payload, "source"))
            .unwrap_or_else(|| default_source.to_string());
        let message_type = options
            .message_type
            .clone()
            .or_else(|| string_field(payload, "type"))
            .unwrap_or_else(|| UNKNOWN_TYPE.to_string());

        let mut headers = BTreeMap::new();
        headers.insert(HEADER_CONTENT_TYPE.to_string(), CONTENT_TYPE_JSON.to_string());
        headers.insert(HEADER_CONNECTOR_VERSION.to_string(), CONNECTOR_VERSION.to_string());
        headers.insert(HEADER_MESSAGE_SOURCE.to_string(), source);
        headers.insert(HEADER_MESSAGE_TYPE.to_string(), message_type);
        headers.insert(HEADER_MESSAGE_ID.to_string(), message_id.clone());
        headers.extend(options.headers.iter().map(|(k, v)| (k.clone(), v.clone())));

        Ok(Self {
            message_id,
            key,
            value,
            headers,
            timestamp: Utc::now(),
        })
    }

    pub fn decode(&self) -> Result<Value> {
        decode_value(&self.value)
    }
}

pub fn decode_value(raw: &[u8]) -> Result<Value> {
    Ok(serde_json::from_slice(raw)?)
}

/// Header values decoded to plain strings; invalid UTF-8 is replaced lossily.
pub fn decode_headers(headers: &[(String, Bytes)]) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
        .collect()
}

fn string_field(payload: &Value, field: &str) -> Option<String> {
    payload.get(field).and_then(Value::as_str).map(str::to_string)
}
