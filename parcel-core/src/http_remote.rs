//! HTTP client for a REST document store.
//!
//! Endpoints, relative to the base URL:
//!
//! | call     | request                                           |
//! |----------|---------------------------------------------------|
//! | `get`    | `GET /{collection}/{id}` (404 means absent)        |
//! | `query`  | `GET /{collection}?field=F&value=<json>`          |
//! | `list`   | `GET /{collection}`                               |
//! | `create` | `POST /{collection}` returning `{"id": "..."}`    |
//! | `set`    | `PUT /{collection}/{id}` with the field map       |
//! | `update` | `PATCH /{collection}/{id}` (404 means not found)  |
//! | `delete` | `DELETE /{collection}/{id}` (404 is success)      |

use crate::remote::{Document, Fields, RemoteError, RemoteStore};
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

#[derive(Deserialize)]
struct CreatedId {
    id: String,
}

/// Remote store backed by a REST document API
pub struct HttpRemoteStore {
    base_url: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpRemoteStore {
    /// Create a client targeting `base_url` (e.g. `https://docs.example/v1`).
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            timeout,
        })
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{}", self.base_url, collection)
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{}/{}", self.base_url, collection, id)
    }

    fn transport(&self, err: reqwest::Error) -> RemoteError {
        if err.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else {
            RemoteError::Transport(err.to_string())
        }
    }

    /// Map a non-success status to an error. 404 is left to the caller.
    async fn check(&self, resp: Response, what: &str) -> Result<Response, RemoteError> {
        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(RemoteError::PermissionDenied(format!("{} ({}): {}", what, status, body)))
            }
            StatusCode::CONFLICT => Err(RemoteError::Conflict(format!("{}: {}", what, body))),
            _ => Err(RemoteError::Transport(format!("{} failed ({}): {}", what, status, body))),
        }
    }

    fn not_found(collection: &str, id: &str) -> RemoteError {
        RemoteError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    async fn documents(&self, resp: Response, what: &str) -> Result<Vec<Document>, RemoteError> {
        let resp = self.check(resp, what).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        resp.json()
            .await
            .map_err(|e| RemoteError::Malformed(format!("{}: {}", what, e)))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, RemoteError> {
        let url = self.document_url(collection, id);
        let resp = self.http.get(&url).send().await.map_err(|e| self.transport(e))?;
        let resp = self.check(resp, &format!("GET {}", url)).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let fields: Fields = resp
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(format!("{}/{}: {}", collection, id, e)))?;
        Ok(Some(Document {
            id: id.to_string(),
            fields,
        }))
    }

    async fn query(&self, collection: &str, field: &str, value: &Value) -> Result<Vec<Document>, RemoteError> {
        let url = self.collection_url(collection);
        let encoded = serde_json::to_string(value).map_err(|e| RemoteError::Malformed(e.to_string()))?;
        let resp = self
            .http
            .get(&url)
            .query(&[("field", field), ("value", encoded.as_str())])
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        self.documents(resp, &format!("query {} by {}", collection, field)).await
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>, RemoteError> {
        let url = self.collection_url(collection);
        let resp = self.http.get(&url).send().await.map_err(|e| self.transport(e))?;
        self.documents(resp, &format!("list {}", collection)).await
    }

    async fn create(&self, collection: &str) -> Result<String, RemoteError> {
        let url = self.collection_url(collection);
        let resp = self
            .http
            .post(&url)
            .json(&Fields::new())
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        let resp = self.check(resp, &format!("POST {}", url)).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(RemoteError::Transport(format!("collection {} does not exist", collection)));
        }
        let created: CreatedId = resp
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(format!("create response: {}", e)))?;
        Ok(created.id)
    }

    async fn set(&self, collection: &str, id: &str, fields: Fields) -> Result<(), RemoteError> {
        let url = self.document_url(collection, id);
        let resp = self
            .http
            .put(&url)
            .json(&fields)
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        let resp = self.check(resp, &format!("PUT {}", url)).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Self::not_found(collection, id));
        }
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<(), RemoteError> {
        let url = self.document_url(collection, id);
        let resp = self
            .http
            .patch(&url)
            .json(&fields)
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        let resp = self.check(resp, &format!("PATCH {}", url)).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Self::not_found(collection, id));
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        let url = self.document_url(collection, id);
        let resp = self.http.delete(&url).send().await.map_err(|e| self.transport(e))?;
        // Deleting an absent document is not an error.
        self.check(resp, &format!("DELETE {}", url)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_trim_trailing_slash() {
        let store = HttpRemoteStore::new("http://docs.local/v1/", Duration::from_secs(1)).unwrap();
        assert_eq!(store.collection_url("packages"), "http://docs.local/v1/packages");
        assert_eq!(store.document_url("users", "u1"), "http://docs.local/v1/users/u1");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let store = HttpRemoteStore::new(&format!("http://{}", addr), Duration::from_secs(2)).unwrap();
        let err = store.list("packages").await.unwrap_err();
        assert!(matches!(err, RemoteError::Transport(_) | RemoteError::Timeout(_)));
    }
}
