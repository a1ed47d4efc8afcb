use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The `type` of a Bundle document.
///
/// Only `transaction` is accepted on input; the processor always answers with
/// `transaction-response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundleType {
    Transaction,
    TransactionResponse,
}

impl BundleType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "transaction" => Some(Self::Transaction),
            "transaction-response" => Some(Self::TransactionResponse),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transaction => "transaction",
            Self::TransactionResponse => "transaction-response",
        }
    }
}

/// Business identifier attached to a Bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub r#use: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// The effect an entry asks for, read from `request.method`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `POST`
    Create,
    /// `PUT`
    Update,
    /// `DELETE`
    Delete,
}

impl Method {
    pub fn from_verb(verb: &str) -> Option<Self> {
        match verb {
            "POST" => Some(Self::Create),
            "PUT" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Self::Create => "POST",
            Self::Update => "PUT",
            Self::Delete => "DELETE",
        }
    }

    /// Create and update entries must carry a resource body.
    pub fn requires_resource(&self) -> bool {
        !matches!(self, Self::Delete)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryRequest {
    pub method: Method,
    pub url: String,
}

/// A validated Bundle entry.
///
/// `index` is the position of the entry in the submitted Bundle and is the key
/// used everywhere downstream (dependency graph, resolution table, outcomes).
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub index: usize,
    pub full_url: Option<String>,
    pub resource: Option<Value>,
    pub request: EntryRequest,
}

impl Entry {
    /// The `resourceType` of the payload, if any.
    pub fn resource_kind(&self) -> Option<&str> {
        self.resource
            .as_ref()
            .and_then(|resource| resource.get("resourceType"))
            .and_then(Value::as_str)
    }

    /// The `id` the caller put on the payload, if any.
    pub fn resource_id(&self) -> Option<&str> {
        self.resource
            .as_ref()
            .and_then(|resource| resource.get("id"))
            .and_then(Value::as_str)
    }
}

/// A Bundle that passed envelope validation. Its type is always `transaction`.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    pub identifier: Option<Identifier>,
    pub entries: Vec<Entry>,
}

/// Identifier assigned by a backend once an entry's effect has been applied.
///
/// Rendered as `Kind/id`, which is the form substituted for transient
/// references and reported as the entry `location`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DurableId {
    pub kind: String,
    pub id: String,
}

impl DurableId {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Parses a relative reference of the form `Kind/id`.
    pub fn parse(reference: &str) -> Option<Self> {
        let (kind, id) = reference.split_once('/')?;
        if kind.is_empty() || id.is_empty() || id.contains('/') {
            return None;
        }
        Some(Self::new(kind, id))
    }
}

impl fmt::Display for DurableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}
