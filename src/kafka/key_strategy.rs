use serde_json::Value;
use tracing::debug;

pub const DEFAULT_ID_FIELD: &str = "id";

/// How the record key is derived from a structured payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStrategy {
    /// The payload's identifier field.
    MessageId(String),
    /// A dotted path into the payload, e.g. `asset.hostname`.
    FieldPath(String),
    /// Several fields joined with `:`; missing any of them yields no key.
    Composite(Vec<String>),
    None,
}

impl KeyStrategy {
    pub fn extract_key(&self, payload: &Value) -> Option<String> {
        match self {
            KeyStrategy::MessageId(field) => extract_field_value(payload, field),
            KeyStrategy::FieldPath(path) => extract_field_value(payload, path),
            KeyStrategy::Composite(fields) => extract_composite_key(payload, fields),
            KeyStrategy::None => None,
        }
    }
}

/// The payload's identifier, used as message id regardless of key strategy.
pub fn message_identifier(payload: &Value) -> Option<String> {
    extract_field_value(payload, DEFAULT_ID_FIELD)
}

fn extract_field_value(record: &Value, field_path: &str) -> Option<String> {
    let mut current = record;

    for part in field_path.split('.') {
        match current.get(part) {
            Some(value) => current = value,
            None => {
                debug!("Field '{}' not found in payload", part);
                return None;
            }
        }
    }

    match current {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        _ => Some(current.to_string()),
    }
}

fn extract_composite_key(record: &Value, fields: &[String]) -> Option<String> {
    let mut key_parts = Vec::with_capacity(fields.len());

    for field in fields {
        match extract_field_value(record, field) {
            Some(value) => key_parts.push(value),
            None => {
                debug!("Missing field '{}' for composite key", field);
                return None;
            }
        }
    }

    if key_parts.is_empty() {
        None
    } else {
        Some(key_parts.join(":"))
    }
}

impl Default for KeyStrategy {
    fn default() -> Self {
        KeyStrategy::MessageId(DEFAULT_ID_FIELD.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn alert() -> Value {
        json!({
            "id": "alrt-7f3a",
            "severity": "high",
            "tenant_id": 42,
            "asset": {
                "hostname": "db-01.internal",
                "tags": ["pci"]
            }
        })
    }

    #[test]
    fn test_default_uses_message_id() {
        assert_eq!(
            KeyStrategy::default().extract_key(&alert()),
            Some("alrt-7f3a".to_string())
        );
        assert_eq!(message_identifier(&alert()), Some("alrt-7f3a".to_string()));
    }

    #[test]
    fn test_field_path_strategy() {
        let strategy = KeyStrategy::FieldPath("asset.hostname".to_string());
        assert_eq!(
            strategy.extract_key(&alert()),
            Some("db-01.internal".to_string())
        );
    }

    #[test]
    fn test_composite_key_strategy() {
        let strategy = KeyStrategy::Composite(vec!["tenant_id".to_string(), "id".to_string()]);
        assert_eq!(strategy.extract_key(&alert()), Some("42:alrt-7f3a".to_string()));

        let strategy = KeyStrategy::Composite(vec!["tenant_id".to_string(), "missing".to_string()]);
        assert_eq!(strategy.extract_key(&alert()), None);
    }

    #[test]
    fn test_missing_id_yields_no_key() {
        let payload = json!({"severity": "low"});
        assert_eq!(KeyStrategy::default().extract_key(&payload), None);
        assert_eq!(message_identifier(&payload), None);
    }

    #[test]
    fn test_various_value_types() {
        let payload = json!({
            "int_val": 42,
            "bool_val": true,
            "null_val": null,
            "float_val": 3.5,
        });

        let key = |path: &str| KeyStrategy::FieldPath(path.to_string()).extract_key(&payload);
        assert_eq!(key("int_val"), Some("42".to_string()));
        assert_eq!(key("bool_val"), Some("true".to_string()));
        assert_eq!(key("null_val"), None);
        assert_eq!(key("float_val"), Some("3.5".to_string()));
        assert_eq!(
            KeyStrategy::FieldPath("asset.tags".to_string()).extract_key(&alert()),
            Some("[\"pci\"]".to_string())
        );
    }

    #[test]
    fn test_none_strategy() {
        assert_eq!(KeyStrategy::None.extract_key(&alert()), None);
    }
}
