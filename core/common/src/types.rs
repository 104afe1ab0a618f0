//! Common types used throughout the replication engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use zeroize::Zeroize;

/// Name of a replicated collection (e.g. `products`, `customers`, `taxes`).
///
/// Doubles as the remote resource path and the snapshot file name, so it is
/// limited to ASCII letters, digits, `-` and `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionName(String);

impl CollectionName {
    /// Create a new CollectionName.
    ///
    /// # Errors
    /// - Returns error if the name is empty or contains anything but ASCII
    ///   letters, digits, `-` and `_`
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Collection name cannot be empty".to_string(),
            ));
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(crate::Error::InvalidInput(format!(
                "Collection name {:?} contains {:?}",
                name, c
            )));
        }
        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CollectionName {
    type Error = crate::Error;

    fn try_from(name: String) -> crate::Result<Self> {
        Self::new(name)
    }
}

impl From<CollectionName> for String {
    fn from(name: CollectionName) -> Self {
        name.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier assigned by the remote system.
///
/// Only equality and hashing matter; no ordering between remote ids is assumed
/// by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteId {
    Number(u64),
    Text(String),
}

impl RemoteId {
    /// Extract an id from a JSON value.
    ///
    /// Accepts non-negative integers and non-empty strings.
    pub fn from_json(value: &Value) -> crate::Result<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(RemoteId::Number).ok_or_else(|| {
                crate::Error::InvalidInput(format!("Remote id is not a non-negative integer: {}", n))
            }),
            Value::String(s) if !s.is_empty() => Ok(RemoteId::Text(s.clone())),
            other => Err(crate::Error::InvalidInput(format!(
                "Unsupported remote id: {}",
                other
            ))),
        }
    }

    /// Read the `id` field of a remote document.
    pub fn of_document(doc: &Value) -> crate::Result<Self> {
        let id = doc
            .get("id")
            .ok_or_else(|| crate::Error::InvalidInput("Document has no id field".to_string()))?;
        Self::from_json(id)
    }
}

impl From<u64> for RemoteId {
    fn from(id: u64) -> Self {
        RemoteId::Number(id)
    }
}

impl From<&str> for RemoteId {
    fn from(id: &str) -> Self {
        RemoteId::Text(id.to_string())
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteId::Number(n) => write!(f, "{}", n),
            RemoteId::Text(s) => write!(f, "{}", s),
        }
    }
}

/// What a replication task does for its collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    /// Reconcile the remote id space with the local id space.
    Audit,
    /// Pull full documents for outstanding ids.
    Sync,
}

impl ReplicationMode {
    fn suffix(&self) -> &'static str {
        match self {
            ReplicationMode::Audit => "audit",
            ReplicationMode::Sync => "replication",
        }
    }
}

impl fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationMode::Audit => write!(f, "audit"),
            ReplicationMode::Sync => write!(f, "sync"),
        }
    }
}

/// Unique key of a replication task: one per (collection, mode).
///
/// Renders as `<collection>-replication` for sync and `<collection>-audit`
/// for audit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicationIdentifier {
    collection: CollectionName,
    mode: ReplicationMode,
}

impl ReplicationIdentifier {
    /// Create the identifier of a (collection, mode) pair.
    pub fn new(collection: CollectionName, mode: ReplicationMode) -> Self {
        Self { collection, mode }
    }

    /// Identifier of the sync task of `collection`.
    pub fn sync(collection: &CollectionName) -> Self {
        Self::new(collection.clone(), ReplicationMode::Sync)
    }

    /// Identifier of the audit task of `collection`.
    pub fn audit(collection: &CollectionName) -> Self {
        Self::new(collection.clone(), ReplicationMode::Audit)
    }

    /// Collection the task replicates.
    pub fn collection(&self) -> &CollectionName {
        &self.collection
    }

    /// Whether this is the audit or the sync task.
    pub fn mode(&self) -> ReplicationMode {
        self.mode
    }
}

impl fmt::Display for ReplicationIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.collection, self.mode.suffix())
    }
}

/// Credential string that zeroizes on drop.
#[derive(Clone, Zeroize, Deserialize)]
#[zeroize(drop)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    /// Wrap a secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Expose the secret for the duration of a request.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString([REDACTED])")
    }
}
