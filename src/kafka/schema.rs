//! Named JSON Schemas checked before a payload is published.

use crate::{Error, Result};
use jsonschema::Validator;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Arc<Validator>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles and stores `schema` under `schema_id`, replacing any previous version.
    pub fn register(&self, schema_id: &str, schema: &Value) -> Result<()> {
        let validator = Validator::new(schema).map_err(|e| Error::InvalidSchema {
            schema_id: schema_id.to_string(),
            message: e.to_string(),
        })?;

        let replaced = self
            .schemas
            .write()
            .insert(schema_id.to_string(), Arc::new(validator))
            .is_some();
        info!(schema_id, replaced, "Registered schema");
        Ok(())
    }

    pub fn contains(&self, schema_id: &str) -> bool {
        self.schemas.read().contains_key(schema_id)
    }

    pub fn schema_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.schemas.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Checks `payload` against the named schema. An unregistered id fails
    /// validation rather than passing silently.
    pub fn validate(&self, schema_id: &str, payload: &Value) -> Result<()> {
        let validator = self
            .schemas
            .read()
            .get(schema_id)
            .cloned()
            .ok_or_else(|| Error::SchemaValidation {
                schema_id: schema_id.to_string(),
                message: "schema is not registered".to_string(),
            })?;

        if let Some(error) = validator.iter_errors(payload).next() {
            debug!(schema_id, error = %error, "Payload failed schema validation");
            return Err(Error::SchemaValidation {
                schema_id: schema_id.to_string(),
                message: format!("{} at '{}'", error, error.instance_path),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("schemas", &self.schema_ids())
            .finish()
    }
}
