//! In-memory remote collaborators
//!
//! Useful for tests and local experiments. Both fakes support failure
//! injection so partial-failure paths can be exercised deterministically.

use crate::remote::{Account, AuthClient, Document, Fields, RemoteError, RemoteStore};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;

/// Remote store operation, used to target injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Get,
    Query,
    List,
    Create,
    Set,
    Update,
    Delete,
}

/// In-memory document store
#[derive(Default)]
pub struct MemoryRemoteStore {
    /// collection -> (id -> fields)
    collections: RwLock<HashMap<String, BTreeMap<String, Fields>>>,

    /// Pending injected failures, consumed in order per operation
    failures: Mutex<Vec<(RemoteOp, RemoteError)>>,

    /// Number of calls per operation
    calls: Mutex<HashMap<RemoteOp, usize>>,

    /// Artificial delay applied to every call
    latency: Mutex<Option<Duration>>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: RemoteOp, error: RemoteError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push((op, error));
        }
    }

    /// Delay every subsequent call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut slot) = self.latency.lock() {
            *slot = latency;
        }
    }

    /// How many times `op` has been invoked.
    pub fn call_count(&self, op: RemoteOp) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.get(&op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Raw fields of a stored document, bypassing failure injection.
    pub async fn raw(&self, collection: &str, id: &str) -> Option<Fields> {
        self.collections
            .read()
            .await
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// Overwrite a single field directly, bypassing failure injection.
    pub async fn poke(&self, collection: &str, id: &str, field: &str, value: Value) {
        let mut collections = self.collections.write().await;
        if let Some(doc) = collections.get_mut(collection).and_then(|docs| docs.get_mut(id)) {
            doc.insert(field.to_string(), value);
        }
    }

    /// Number of documents in a collection.
    pub async fn document_count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    async fn enter(&self, op: RemoteOp) -> Result<(), RemoteError> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(op).or_insert(0) += 1;
        }

        let latency = self.latency.lock().ok().and_then(|slot| *slot);
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }

        let injected = self.failures.lock().ok().and_then(|mut failures| {
            let pos = failures.iter().position(|(target, _)| *target == op)?;
            Some(failures.remove(pos).1)
        });
        match injected {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, RemoteError> {
        self.enter(RemoteOp::Get).await?;
        Ok(self.raw(collection, id).await.map(|fields| Document {
            id: id.to_string(),
            fields,
        }))
    }

    async fn query(&self, collection: &str, field: &str, value: &Value) -> Result<Vec<Document>, RemoteError> {
        self.enter(RemoteOp::Query).await?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, fields)| fields.get(field) == Some(value))
                    .map(|(id, fields)| Document {
                        id: id.clone(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>, RemoteError> {
        self.enter(RemoteOp::List).await?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, fields)| Document {
                        id: id.clone(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create(&self, collection: &str) -> Result<String, RemoteError> {
        self.enter(RemoteOp::Create).await?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), Fields::new());
        Ok(id)
    }

    async fn set(&self, collection: &str, id: &str, fields: Fields) -> Result<(), RemoteError> {
        self.enter(RemoteOp::Set).await?;
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), fields);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<(), RemoteError> {
        self.enter(RemoteOp::Update).await?;
        let mut collections = self.collections.write().await;
        let doc = collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| RemoteError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        for (key, value) in fields {
            doc.insert(key, value);
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        self.enter(RemoteOp::Delete).await?;
        if let Some(docs) = self.collections.write().await.get_mut(collection) {
            docs.remove(id);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredAccount {
    id: String,
    password: String,
    display_name: Option<String>,
}

/// In-memory auth provider
#[derive(Default)]
pub struct MemoryAuthClient {
    accounts: RwLock<HashMap<String, StoredAccount>>,
    current: RwLock<Option<Account>>,
    fail_sign_out: Mutex<Option<RemoteError>>,
}

impl MemoryAuthClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `sign_out` fail with `error`.
    pub fn fail_next_sign_out(&self, error: RemoteError) {
        if let Ok(mut slot) = self.fail_sign_out.lock() {
            *slot = Some(error);
        }
    }

    pub async fn account_count(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn set_display_name(&self, email: &str, name: &str) {
        if let Some(account) = self.accounts.write().await.get_mut(email) {
            account.display_name = Some(name.to_string());
        }
    }
}

#[async_trait]
impl AuthClient for MemoryAuthClient {
    async fn create_account(&self, email: &str, password: &str) -> Result<String, RemoteError> {
        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(email) {
            return Err(RemoteError::Conflict(format!("account already exists: {}", email)));
        }
        let id = uuid::Uuid::new_v4().to_string();
        accounts.insert(
            email.to_string(),
            StoredAccount {
                id: id.clone(),
                password: password.to_string(),
                display_name: None,
            },
        );
        *self.current.write().await = Some(Account {
            id: id.clone(),
            email: email.to_string(),
            display_name: None,
        });
        Ok(id)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<String, RemoteError> {
        let accounts = self.accounts.read().await;
        match accounts.get(email) {
            Some(stored) if stored.password == password => {
                *self.current.write().await = Some(Account {
                    id: stored.id.clone(),
                    email: email.to_string(),
                    display_name: stored.display_name.clone(),
                });
                Ok(stored.id.clone())
            }
            _ => Err(RemoteError::AuthRejected),
        }
    }

    async fn sign_out(&self) -> Result<(), RemoteError> {
        let injected = self.fail_sign_out.lock().ok().and_then(|mut slot| slot.take());
        if let Some(err) = injected {
            return Err(err);
        }
        *self.current.write().await = None;
        Ok(())
    }

    async fn current_account(&self) -> Option<Account> {
        self.current.read().await.clone()
    }
}
