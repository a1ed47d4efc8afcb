#![allow(dead_code)]

use async_trait::async_trait;
use bundle_processor::application::{BundleProcessor, RoutingTable, SUPPORTED_RESOURCE_TYPES};
use bundle_processor::config::ProcessorConfig;
use bundle_processor::domain::ports::{AdapterError, AdapterRef, BackendAdapter, CallContext};
use bundle_processor::infrastructure::in_memory::InMemoryBackend;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One call seen by a [`RecordingBackend`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub operation: &'static str,
    pub kind: String,
    pub payload: Option<Value>,
    pub id: Option<String>,
    pub identity: Option<String>,
}

/// In-memory backend that records every call and can be told to fail.
pub struct RecordingBackend {
    store: InMemoryBackend,
    calls: Mutex<Vec<RecordedCall>>,
    rejected_ids: HashSet<String>,
    transient_failures: AtomicUsize,
    delay: Duration,
    healthy: bool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingBackend {
    pub fn new(name: &str) -> Self {
        Self {
            store: InMemoryBackend::new(name),
            calls: Mutex::new(Vec::new()),
            rejected_ids: HashSet::new(),
            transient_failures: AtomicUsize::new(0),
            delay: Duration::ZERO,
            healthy: true,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Rejects writes whose payload carries this `id`.
    pub fn rejecting(mut self, id: &str) -> Self {
        self.rejected_ids.insert(id.to_string());
        self
    }

    /// Fails the next `n` calls with a transient error.
    pub fn transient_failures(self, n: usize) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, kind: &str) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| c.kind == kind).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub async fn stored(&self, kind: &str, id: &str) -> Option<Value> {
        self.store.get(kind, id).await
    }

    pub async fn stored_count(&self) -> usize {
        self.store.len().await
    }

    fn record(&self, operation: &'static str, kind: &str, payload: Option<&Value>, id: Option<&str>, call: &CallContext) {
        self.calls.lock().unwrap().push(RecordedCall {
            operation,
            kind: kind.to_string(),
            payload: payload.cloned(),
            id: id.map(str::to_string),
            identity: call.identity.as_ref().map(|i| i.token().to_string()),
        });
    }

    async fn enter(&self) -> Result<(), AdapterError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(AdapterError::Transient("connection reset".to_string()));
        }
        Ok(())
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackendAdapter for RecordingBackend {
    fn name(&self) -> &str {
        self.store.name()
    }

    async fn write(&self, kind: &str, payload: &Value, call: &CallContext) -> Result<String, AdapterError> {
        self.record("write", kind, Some(payload), None, call);
        self.enter().await?;
        let result = match payload.get("id").and_then(Value::as_str) {
            Some(id) if self.rejected_ids.contains(id) => {
                Err(AdapterError::Rejected(format!("{} {} is not allowed", kind, id)))
            }
            _ => self.store.write(kind, payload, call).await,
        };
        self.leave();
        result
    }

    async fn delete(&self, kind: &str, id: &str, call: &CallContext) -> Result<(), AdapterError> {
        self.record("delete", kind, None, Some(id), call);
        self.enter().await?;
        let result = self.store.delete(kind, id, call).await;
        self.leave();
        result
    }

    async fn is_healthy(&self) -> bool {
        self.healthy
    }
}

/// Routes every supported kind to `backend` alone.
pub fn single_backend_processor(backend: Arc<RecordingBackend>, config: ProcessorConfig) -> BundleProcessor {
    let adapter: AdapterRef = backend;
    let routes = RoutingTable::new().route_all(SUPPORTED_RESOURCE_TYPES, &adapter);
    BundleProcessor::new(config, routes).unwrap()
}

pub fn fast_config() -> ProcessorConfig {
    ProcessorConfig {
        retry_backoff_ms: 1,
        ..ProcessorConfig::default()
    }
}

pub fn transaction(entries: Vec<Value>) -> Value {
    json!({
        "resourceType": "Bundle",
        "type": "transaction",
        "identifier": {"system": "https://aced-idp.org/project_id", "value": "ohsu-test"},
        "entry": entries,
    })
}

pub fn put(full_url: &str, resource: Value) -> Value {
    let kind = resource["resourceType"].as_str().unwrap_or("Unknown").to_string();
    let url = match resource["id"].as_str() {
        Some(id) => format!("{}/{}", kind, id),
        None => kind,
    };
    json!({"fullUrl": full_url, "resource": resource, "request": {"method": "PUT", "url": url}})
}

pub fn post(full_url: &str, resource: Value) -> Value {
    let kind = resource["resourceType"].as_str().unwrap_or("Unknown").to_string();
    json!({"fullUrl": full_url, "resource": resource, "request": {"method": "POST", "url": kind}})
}

pub fn delete(url: &str) -> Value {
    json!({"request": {"method": "DELETE", "url": url}})
}

pub fn patient(id: &str) -> Value {
    json!({"resourceType": "Patient", "id": id})
}
