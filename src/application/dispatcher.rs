use super::resolution_table::{Resolution, ResolutionTable};
use super::resolver::replace_reference;
use crate::config::ProcessorConfig;
use crate::domain::bundle::{DurableId, Entry, Method};
use crate::domain::outcome::{Applied, EntryError, EntryOutcome};
use crate::domain::ports::{AdapterError, AdapterRef, BackendAdapter, CallContext, Identity};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Resource kinds accepted by the standard routing.
pub const SUPPORTED_RESOURCE_TYPES: [&str; 14] = [
    "ResearchStudy",
    "Patient",
    "ResearchSubject",
    "Substance",
    "Specimen",
    "Observation",
    "Condition",
    "Medication",
    "MedicationAdministration",
    "DocumentReference",
    "Task",
    "FamilyMemberHistory",
    "BodyStructure",
    "Organization",
];

/// Kinds that are additionally projected into the search index.
pub const SEARCH_INDEXED_TYPES: [&str; 3] = ["ResearchSubject", "Observation", "DocumentReference"];

/// Dispatch table from resource kind to the adapters that store it.
///
/// The first adapter of a route is the primary store: the id it returns is the
/// entry's durable identifier. Later adapters receive the payload with that id.
#[derive(Clone, Default)]
pub struct RoutingTable {
    routes: HashMap<String, Vec<AdapterRef>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `adapter` to the route of `kind`.
    pub fn route(mut self, kind: impl Into<String>, adapter: AdapterRef) -> Self {
        self.routes.entry(kind.into()).or_default().push(adapter);
        self
    }

    pub fn route_all<'a>(
        mut self,
        kinds: impl IntoIterator<Item = &'a str>,
        adapter: &AdapterRef,
    ) -> Self {
        for kind in kinds {
            self = self.route(kind, adapter.clone());
        }
        self
    }

    /// Every supported kind goes to the graph store then the metadata catalog;
    /// subject, observation and document kinds also go to the search index.
    pub fn standard(graph: AdapterRef, catalog: AdapterRef, search: AdapterRef) -> Self {
        Self::new()
            .route_all(SUPPORTED_RESOURCE_TYPES, &graph)
            .route_all(SUPPORTED_RESOURCE_TYPES, &catalog)
            .route_all(SEARCH_INDEXED_TYPES, &search)
    }

    fn targets(&self, kind: &str, method: Method) -> Vec<AdapterRef> {
        self.routes
            .get(kind)
            .map(|adapters| {
                adapters
                    .iter()
                    .filter(|adapter| {
                        let caps = adapter.capabilities();
                        if method == Method::Delete { caps.delete } else { caps.write }
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Each distinct adapter once, in first-routed order.
    pub fn adapters(&self) -> Vec<AdapterRef> {
        let mut kinds: Vec<&String> = self.routes.keys().collect();
        kinds.sort();
        let mut unique: Vec<AdapterRef> = Vec::new();
        for kind in kinds {
            for adapter in &self.routes[kind] {
                if !unique.iter().any(|known| Arc::ptr_eq(known, adapter)) {
                    unique.push(adapter.clone());
                }
            }
        }
        unique
    }
}

impl fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (kind, adapters) in &self.routes {
            let names: Vec<&str> = adapters.iter().map(|a| a.name()).collect();
            map.entry(kind, &names);
        }
        map.finish()
    }
}

/// Timeout and retry applied to every adapter call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallPolicy {
    pub adapter_timeout: Duration,
    pub retry_backoff: Duration,
}

impl CallPolicy {
    pub fn from_config(config: &ProcessorConfig) -> Self {
        Self {
            adapter_timeout: config.adapter_timeout(),
            retry_backoff: config.retry_backoff(),
        }
    }
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self::from_config(&ProcessorConfig::default())
    }
}

/// Applies one entry to the adapters responsible for its resource kind.
#[derive(Debug, Clone)]
pub struct EntryDispatcher {
    routes: RoutingTable,
    policy: CallPolicy,
}

impl EntryDispatcher {
    pub fn new(routes: RoutingTable, policy: CallPolicy) -> Self {
        Self { routes, policy }
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    /// Dispatches `entry` and settles its slot in `table`.
    ///
    /// `references` are the transient urls the entry mentions; each one must
    /// already be resolved, otherwise the entry is reported unresolvable and no
    /// adapter is called.
    pub async fn dispatch(
        &self,
        entry: &Entry,
        references: &[String],
        table: &ResolutionTable,
        identity: Option<&Identity>,
    ) -> EntryOutcome {
        let outcome = self.apply(entry, references, table, identity).await;
        let resolution = match &outcome {
            Ok(Applied {
                location: Some(id), ..
            }) => Resolution::Resolved(id.clone()),
            _ => Resolution::Failed,
        };
        table.settle(entry.index, resolution);
        outcome
    }

    async fn apply(
        &self,
        entry: &Entry,
        references: &[String],
        table: &ResolutionTable,
        identity: Option<&Identity>,
    ) -> EntryOutcome {
        let mut resolved = Vec::with_capacity(references.len());
        for reference in references {
            match table.resolved(reference) {
                Some(id) => resolved.push((reference.as_str(), id.to_string())),
                None => {
                    return Err(EntryError::UnresolvableReference {
                        reference: reference.clone(),
                        dependency: table.owner_of(reference).unwrap_or(entry.index),
                    });
                }
            }
        }

        let call = CallContext {
            identity: identity.cloned(),
            idempotency_key: entry
                .full_url
                .clone()
                .or_else(|| entry.resource_id().map(str::to_string)),
        };

        let url = substitute_text(&entry.request.url, &resolved);
        match entry.request.method {
            Method::Delete => self.delete(entry.index, &url, &call).await,
            method => {
                let kind = entry.resource_kind().unwrap_or("<missing resourceType>");
                let mut payload = entry.resource.clone().unwrap_or(Value::Null);
                substitute_value(&mut payload, &resolved);
                self.write(entry.index, method, kind, payload, &call).await
            }
        }
    }

    async fn write(
        &self,
        index: usize,
        method: Method,
        kind: &str,
        mut payload: Value,
        call: &CallContext,
    ) -> EntryOutcome {
        let targets = self.routes.targets(kind, method);
        let Some((primary, secondaries)) = targets.split_first() else {
            return Err(EntryError::UnsupportedResource {
                kind: kind.to_string(),
            });
        };

        debug!(index, %kind, backend = primary.name(), "Writing primary record");
        let id = {
            let (adapter, body) = (primary.as_ref(), &payload);
            self.call(adapter, index, move || adapter.write(kind, body, call))
                .await?
        };
        let location = DurableId::new(kind, id.as_str());

        if let Some(fields) = payload.as_object_mut() {
            fields.insert("id".to_string(), Value::String(id));
        }
        // Projections are best effort: the primary record stays, the entry fails.
        for secondary in secondaries {
            debug!(index, %kind, backend = secondary.name(), "Writing projection");
            let (adapter, body) = (secondary.as_ref(), &payload);
            self.call(adapter, index, move || adapter.write(kind, body, call))
                .await
                .map_err(|err| err.with_stored_primary(&location))?;
        }

        Ok(Applied {
            method,
            location: Some(location),
        })
    }

    async fn delete(&self, index: usize, url: &str, call: &CallContext) -> EntryOutcome {
        let Some(target) = DurableId::parse(url) else {
            return Err(EntryError::InvalidTarget {
                url: url.to_string(),
                reason: "expected exactly one '/' between resource type and id".to_string(),
            });
        };
        let targets = self.routes.targets(&target.kind, Method::Delete);
        if targets.is_empty() {
            return Err(EntryError::UnsupportedResource {
                kind: target.kind.clone(),
            });
        }

        for adapter in targets {
            debug!(index, %target, backend = adapter.name(), "Deleting");
            let (adapter, kind, id) = (adapter.as_ref(), target.kind.as_str(), target.id.as_str());
            self.call(adapter, index, move || adapter.delete(kind, id, call))
                .await?;
        }

        Ok(Applied {
            method: Method::Delete,
            location: Some(target),
        })
    }

    /// Runs `op` under the adapter timeout, retrying once on a transient error.
    async fn call<T, F, Fut>(
        &self,
        adapter: &dyn BackendAdapter,
        index: usize,
        op: F,
    ) -> Result<T, EntryError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        let mut retried = false;
        loop {
            match self.attempt(op()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && !retried => {
                    warn!(index, backend = adapter.name(), error = %err, "Transient backend error, retrying once");
                    retried = true;
                    tokio::time::sleep(self.policy.retry_backoff).await;
                }
                Err(err) => {
                    warn!(index, backend = adapter.name(), error = %err, "Backend call failed");
                    return Err(EntryError::from_adapter(adapter.name(), err));
                }
            }
        }
    }

    async fn attempt<T>(
        &self,
        fut: impl Future<Output = Result<T, AdapterError>>,
    ) -> Result<T, AdapterError> {
        let limit = self.policy.adapter_timeout;
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout(limit.as_millis() as u64)),
        }
    }
}

fn substitute_text(text: &str, resolved: &[(&str, String)]) -> String {
    resolved
        .iter()
        .fold(text.to_string(), |text, (reference, durable)| {
            replace_reference(&text, reference, durable)
        })
}

fn substitute_value(value: &mut Value, resolved: &[(&str, String)]) {
    if resolved.is_empty() {
        return;
    }
    match value {
        Value::String(text) => *text = substitute_text(text, resolved),
        Value::Array(items) => items
            .iter_mut()
            .for_each(|item| substitute_value(item, resolved)),
        Value::Object(fields) => fields
            .values_mut()
            .for_each(|field| substitute_value(field, resolved)),
        _ => {}
    }
}
