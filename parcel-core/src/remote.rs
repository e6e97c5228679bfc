//! Remote collaborators: the document store and the auth provider
//!
//! Both are consumed through traits so the repositories can run against the
//! HTTP client, the in-memory fakes, or anything else implementing them.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// Field map of a stored document
pub type Fields = serde_json::Map<String, Value>;

/// A document as returned by the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub fields: Fields,
}

/// Errors raised by remote collaborators
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("authentication rejected")]
    AuthRejected,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("malformed document: {0}")]
    Malformed(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Document store accessor
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch a document, `None` when absent
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, RemoteError>;

    /// Documents whose `field` equals `value`
    async fn query(&self, collection: &str, field: &str, value: &Value) -> Result<Vec<Document>, RemoteError>;

    /// Every document in a collection
    async fn list(&self, collection: &str) -> Result<Vec<Document>, RemoteError>;

    /// Reserve a new, empty document and return its generated id
    async fn create(&self, collection: &str) -> Result<String, RemoteError>;

    /// Create or fully replace a document
    async fn set(&self, collection: &str, id: &str, fields: Fields) -> Result<(), RemoteError>;

    /// Merge `fields` into an existing document in one write.
    ///
    /// Fails with [`RemoteError::NotFound`] when the document does not exist.
    async fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<(), RemoteError>;

    /// Remove a document
    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError>;
}

/// Identity held by the auth provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub display_name: Option<String>,
}

/// Remote authentication provider
#[async_trait]
pub trait AuthClient: Send + Sync {
    /// Create a new account and return its id
    async fn create_account(&self, email: &str, password: &str) -> Result<String, RemoteError>;

    /// Sign in and return the account id
    async fn sign_in(&self, email: &str, password: &str) -> Result<String, RemoteError>;

    async fn sign_out(&self) -> Result<(), RemoteError>;

    /// Currently signed-in account, if any
    async fn current_account(&self) -> Option<Account>;
}

/// Run a remote call with an upper bound on its duration.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout(limit)),
    }
}

/// Serialize a record into document fields, leaving out the `id`.
pub fn encode<T: Serialize>(record: &T) -> Result<Fields, RemoteError> {
    match serde_json::to_value(record) {
        Ok(Value::Object(mut map)) => {
            map.remove("id");
            Ok(map)
        }
        Ok(other) => Err(RemoteError::Malformed(format!("expected an object, got {}", other))),
        Err(e) => Err(RemoteError::Malformed(e.to_string())),
    }
}

/// Deserialize a document into a record, taking the id from the document.
pub fn decode<T: DeserializeOwned>(doc: Document) -> Result<T, RemoteError> {
    let Document { id, mut fields } = doc;
    fields.insert("id".to_string(), Value::String(id.clone()));
    serde_json::from_value(Value::Object(fields))
        .map_err(|e| RemoteError::Malformed(format!("{}: {}", id, e)))
}
