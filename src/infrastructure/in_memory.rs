use crate::domain::ports::{AdapterError, BackendAdapter, CallContext};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A thread-safe in-memory backend.
///
/// Records are kept in `Arc<RwLock<HashMap<(kind, id), Value>>>`, so clones
/// share the same data. A second map remembers which id each idempotency key
/// produced, so a resubmitted entry updates its record instead of adding one.
#[derive(Clone)]
pub struct InMemoryBackend {
    name: String,
    records: Arc<RwLock<HashMap<(String, String), Value>>>,
    idempotency: Arc<RwLock<HashMap<(String, String), String>>>,
}

impl InMemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: Arc::default(),
            idempotency: Arc::default(),
        }
    }

    pub async fn get(&self, kind: &str, id: &str) -> Option<Value> {
        let records = self.records.read().await;
        records.get(&(kind.to_string(), id.to_string())).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl BackendAdapter for InMemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(
        &self,
        kind: &str,
        payload: &Value,
        call: &CallContext,
    ) -> Result<String, AdapterError> {
        if !payload.is_object() {
            return Err(AdapterError::Rejected("payload is not a JSON object".to_string()));
        }

        let key = call
            .idempotency_key
            .as_ref()
            .map(|key| (kind.to_string(), key.clone()));

        // Lock order: idempotency, then records.
        let mut idempotency = self.idempotency.write().await;
        let id = match payload.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => key
                .as_ref()
                .and_then(|key| idempotency.get(key).cloned())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        };
        if let Some(key) = key {
            idempotency.insert(key, id.clone());
        }

        let mut record = payload.clone();
        if let Some(fields) = record.as_object_mut() {
            fields.insert("id".to_string(), Value::String(id.clone()));
        }
        self.records
            .write()
            .await
            .insert((kind.to_string(), id.clone()), record);

        Ok(id)
    }

    async fn delete(&self, kind: &str, id: &str, _call: &CallContext) -> Result<(), AdapterError> {
        // Deleting an absent record is not an error.
        self.records
            .write()
            .await
            .remove(&(kind.to_string(), id.to_string()));
        Ok(())
    }
}
