use super::bundle::{BundleType, DurableId, Identifier, Method};
use super::ports::AdapterError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a single entry could not be applied.
///
/// These never cross entry boundaries: they are stored as the entry's outcome
/// and reported inside an otherwise successful response.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EntryError {
    #[error("Unsupported resource {kind}")]
    UnsupportedResource { kind: String },

    #[error("Invalid entry.request.url {url}: {reason}")]
    InvalidTarget { url: String, reason: String },

    #[error("Reference {reference} is unresolvable: entry {dependency} was not applied")]
    UnresolvableReference { reference: String, dependency: usize },

    #[error("Backend {backend} unavailable after retry: {message}")]
    AdapterTransient { backend: String, message: String },

    #[error("Backend {backend} rejected the entry: {message}")]
    AdapterRejection { backend: String, message: String },

    #[error("Backend {backend} failed: {message}")]
    AdapterFailure { backend: String, message: String },

    #[error("Entry not attempted: {0}")]
    NotAttempted(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EntryError {
    pub fn from_adapter(backend: &str, err: AdapterError) -> Self {
        let backend = backend.to_string();
        let message = err.to_string();
        match err {
            AdapterError::Transient(_) | AdapterError::Timeout(_) => {
                Self::AdapterTransient { backend, message }
            }
            AdapterError::Rejected(_) => Self::AdapterRejection { backend, message },
            AdapterError::Failed(_) => Self::AdapterFailure { backend, message },
        }
    }

    /// Appends the location of a primary record that was stored before a
    /// secondary adapter failed.
    pub fn with_stored_primary(self, location: &DurableId) -> Self {
        let note = |message: String| format!("{} (primary record stored as {})", message, location);
        match self {
            Self::AdapterTransient { backend, message } => Self::AdapterTransient {
                backend,
                message: note(message),
            },
            Self::AdapterRejection { backend, message } => Self::AdapterRejection {
                backend,
                message: note(message),
            },
            Self::AdapterFailure { backend, message } => Self::AdapterFailure {
                backend,
                message: note(message),
            },
            other => other,
        }
    }

    /// Status token reported in `entry.response.status`.
    pub fn status(&self) -> &'static str {
        match self {
            Self::UnsupportedResource { .. }
            | Self::InvalidTarget { .. }
            | Self::AdapterRejection { .. } => "422 Unprocessable Entity",
            Self::UnresolvableReference { .. } => "424 Failed Dependency",
            Self::AdapterFailure { .. } | Self::Internal(_) => "500 Internal Server Error",
            Self::AdapterTransient { .. } => "503 Service Unavailable",
            Self::NotAttempted(_) => "504 Gateway Timeout",
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status().starts_with('4')
    }

    fn issue_code(&self) -> &'static str {
        match self {
            Self::UnsupportedResource { .. } | Self::InvalidTarget { .. } => "invariant",
            Self::UnresolvableReference { .. } => "not-found",
            Self::AdapterRejection { .. } => "processing",
            Self::AdapterTransient { .. } | Self::NotAttempted(_) => "timeout",
            Self::AdapterFailure { .. } | Self::Internal(_) => "exception",
        }
    }
}

/// A successfully applied entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub method: Method,
    pub location: Option<DurableId>,
}

impl Applied {
    pub fn status(&self) -> &'static str {
        match self.method {
            Method::Create => "201 Created",
            Method::Update => "200 OK",
            Method::Delete => "204 No Content",
        }
    }
}

pub type EntryOutcome = Result<Applied, EntryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Fatal,
    Error,
    Warning,
    Information,
    Success,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    pub code: String,
    pub diagnostics: String,
}

impl Issue {
    pub fn new(severity: Severity, code: impl Into<String>, diagnostics: impl Into<String>) -> Self {
        Self {
            severity,
            code: code.into(),
            diagnostics: diagnostics.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    pub resource_type: String,
    pub issue: Vec<Issue>,
}

impl OperationOutcome {
    pub fn new(issue: Vec<Issue>) -> Self {
        Self {
            resource_type: "OperationOutcome".to_string(),
            issue,
        }
    }

    pub fn single(issue: Issue) -> Self {
        Self::new(vec![issue])
    }

    pub fn has_fatal(&self) -> bool {
        self.issue.iter().any(|i| i.severity == Severity::Fatal)
    }
}

/// `entry.response` of the response Bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<OperationOutcome>,
}

impl From<&EntryOutcome> for EntryResponse {
    fn from(outcome: &EntryOutcome) -> Self {
        match outcome {
            Ok(applied) => Self {
                status: applied.status().to_string(),
                location: applied.location.as_ref().map(ToString::to_string),
                outcome: None,
            },
            Err(err) => Self {
                status: err.status().to_string(),
                location: None,
                outcome: Some(OperationOutcome::single(Issue::new(
                    Severity::Error,
                    err.issue_code(),
                    err.to_string(),
                ))),
            },
        }
    }
}

impl EntryResponse {
    pub fn is_success(&self) -> bool {
        self.status.starts_with('2')
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_url: Option<String>,
    pub response: EntryResponse,
}

/// The `transaction-response` Bundle returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBundle {
    pub resource_type: String,
    pub id: String,
    #[serde(rename = "type")]
    pub bundle_type: BundleType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<Identifier>,
    #[serde(default)]
    pub entry: Vec<ResponseEntry>,
    pub issues: OperationOutcome,
}

/// Overall status of a processed Bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleStatus {
    /// Every entry was applied.
    Created,
    /// Some entries failed.
    Accepted,
    /// No entry was applied, or the Bundle itself was rejected.
    Unprocessable,
}

impl BundleStatus {
    pub fn code(&self) -> u16 {
        match self {
            Self::Created => 201,
            Self::Accepted => 202,
            Self::Unprocessable => 422,
        }
    }
}

impl ResponseBundle {
    /// A response carrying only Bundle-level issues, used when the Bundle is
    /// rejected before dispatch.
    pub fn rejected(id: impl Into<String>, issues: OperationOutcome) -> Self {
        Self {
            resource_type: "Bundle".to_string(),
            id: id.into(),
            bundle_type: BundleType::TransactionResponse,
            identifier: None,
            entry: Vec::new(),
            issues,
        }
    }

    pub fn status(&self) -> BundleStatus {
        let applied = self.entry.iter().filter(|e| e.response.is_success()).count();
        if self.issues.has_fatal() || applied == 0 {
            BundleStatus::Unprocessable
        } else if applied == self.entry.len() {
            BundleStatus::Created
        } else {
            BundleStatus::Accepted
        }
    }
}
