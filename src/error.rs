use miette::Diagnostic;
use thiserror::Error;

/// Bundle-level failures.
///
/// Every variant aborts the whole call before any backend write happens.
/// Entry-scoped problems are never reported through this type, see
/// [`crate::domain::outcome::EntryError`].
#[derive(Error, Diagnostic, Debug)]
pub enum BundleError {
    #[error("Invalid bundle at `{field}`: {message}")]
    #[diagnostic(
        code(bundle::validation),
        help("The bundle must be a FHIR Bundle of type `transaction` with a request on every entry")
    )]
    Validation { field: String, message: String },

    #[error("Cyclic reference between entries {indices:?}")]
    #[diagnostic(
        code(bundle::cyclic_reference),
        help("Entries may reference each other's fullUrl, but not in a cycle")
    )]
    CyclicReference { indices: Vec<usize> },

    #[error("Illegal transaction state transition {from} -> {to}")]
    #[diagnostic(code(bundle::state))]
    IllegalTransition { from: &'static str, to: &'static str },

    #[error("Invalid configuration: {0}")]
    #[diagnostic(code(bundle::config))]
    Config(String),

    #[error("Storage error: {0}")]
    #[diagnostic(code(bundle::storage))]
    Storage(String),

    #[error("JSON error: {0}")]
    #[diagnostic(code(bundle::json))]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    #[diagnostic(code(bundle::io))]
    Io(#[from] std::io::Error),
}

impl BundleError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// `true` for failures caused by the submitted document itself.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::CyclicReference { .. })
    }
}

pub type Result<T> = std::result::Result<T, BundleError>;
