use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Opaque caller identity (usually the raw `Authorization` token).
///
/// The processor never inspects it; it is only forwarded to adapters.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity(String);

impl Identity {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Identity(***)")
    }
}

/// Per-call data handed to every adapter operation.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub identity: Option<Identity>,
    /// Stable key for the submitted entry (its transient `fullUrl`, else the
    /// resource `id`). Adapters use it to turn a repeated write into a no-op update.
    pub idempotency_key: Option<String>,
}

/// Operations an adapter is able to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub write: bool,
    pub delete: bool,
}

impl Capabilities {
    pub const ALL: Self = Self {
        write: true,
        delete: true,
    };
    pub const WRITE_ONLY: Self = Self {
        write: true,
        delete: false,
    };
}

/// Errors reported by a backend adapter.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AdapterError {
    /// Network-class failure, eligible for the single bounded retry.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// The call did not finish within the adapter timeout. Treated as transient.
    #[error("backend call timed out after {0} ms")]
    Timeout(u64),

    /// The backend refused the data itself. Never retried.
    #[error("backend rejected the resource: {0}")]
    Rejected(String),

    /// Any other backend failure.
    #[error("backend failure: {0}")]
    Failed(String),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Write contract every downstream store exposes.
///
/// Calls are independent: the processor assumes no transaction spanning two
/// calls, and adapters must tolerate a repeated write carrying the same
/// [`CallContext::idempotency_key`] without creating a second record.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    /// Persists `payload` and returns the durable id of the stored record.
    async fn write(&self, kind: &str, payload: &Value, call: &CallContext)
    -> Result<String, AdapterError>;

    async fn delete(&self, kind: &str, id: &str, call: &CallContext) -> Result<(), AdapterError>;

    async fn is_healthy(&self) -> bool {
        true
    }
}

pub type AdapterRef = Arc<dyn BackendAdapter>;
