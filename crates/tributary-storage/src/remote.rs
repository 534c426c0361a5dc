//! Remote Object Store
//!
//! Tiered storage talks to its archive through the `RemoteStore` trait:
//! five whole-object operations, nothing else. `ObjectStoreRemote` adapts
//! any `object_store::ObjectStore` (S3, MinIO, the in-memory store used in
//! tests) to it.
//!
//! Errors are reported, not retried, at this layer. A missing object is
//! always `Error::RemoteObjectMissing`; anything else the store returns is
//! `Error::ObjectStore`, which callers treat as transient.
//!
//! ## Usage
//!
//! ```ignore
//! use tributary_storage::remote::{ObjectStoreRemote, RemoteStoreConfig};
//!
//! let remote = ObjectStoreRemote::from_config(&RemoteStoreConfig {
//!     bucket: "tributary-archive".to_string(),
//!     region: "us-east-1".to_string(),
//!     endpoint: Some("http://localhost:9000".to_string()),
//! })?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An object listed from the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
    pub last_modified_ms: i64,
}

/// Whole-object storage used as the archive tier.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Fails with `Error::RemoteObjectMissing` if `key` does not exist.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Size of the object, or `None` if it does not exist.
    async fn head(&self, key: &str) -> Result<Option<u64>>;

    /// Deleting a missing object succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Every object whose key starts with `prefix/`.
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>>;
}

/// S3 connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStoreConfig {
    pub bucket: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint for MinIO or localstack.
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// `RemoteStore` over an `object_store` backend.
#[derive(Debug, Clone)]
pub struct ObjectStoreRemote {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreRemote {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Builds an S3 client from `config`. Credentials come from the
    /// environment.
    pub fn from_config(config: &RemoteStoreConfig) -> Result<Self> {
        let mut builder = object_store::aws::AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint).with_allow_http(true);
        }
        Ok(Self::new(Arc::new(builder.build()?)))
    }

    /// In-process store, used for tests and local development.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()))
    }
}

fn not_found_as_missing(key: &str, error: object_store::Error) -> Error {
    match error {
        object_store::Error::NotFound { .. } => Error::RemoteObjectMissing(key.to_string()),
        other => Error::ObjectStore(other),
    }
}

#[async_trait]
impl RemoteStore for ObjectStoreRemote {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.store.put(&ObjectPath::from(key), data).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let result = self
            .store
            .get(&ObjectPath::from(key))
            .await
            .map_err(|e| not_found_as_missing(key, e))?;
        result.bytes().await.map_err(|e| not_found_as_missing(key, e))
    }

    async fn head(&self, key: &str) -> Result<Option<u64>> {
        match self.store.head(&ObjectPath::from(key)).await {
            Ok(meta) => Ok(Some(meta.size as u64)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self.store.delete(&ObjectPath::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let prefix = ObjectPath::from(prefix);
        let objects: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;
        Ok(objects
            .into_iter()
            .map(|meta| RemoteObject {
                key: meta.location.to_string(),
                size: meta.size as u64,
                last_modified_ms: meta.last_modified.timestamp_millis(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_head_delete() {
        let remote = ObjectStoreRemote::in_memory();
        let data = Bytes::from("segment bytes");

        remote.put("archive/p0/00000000000000000000.log", data.clone()).await.unwrap();
        assert_eq!(
            remote.head("archive/p0/00000000000000000000.log").await.unwrap(),
            Some(data.len() as u64)
        );
        assert_eq!(remote.get("archive/p0/00000000000000000000.log").await.unwrap(), data);

        remote.delete("archive/p0/00000000000000000000.log").await.unwrap();
        assert_eq!(remote.head("archive/p0/00000000000000000000.log").await.unwrap(), None);
        // Deleting again is fine.
        remote.delete("archive/p0/00000000000000000000.log").await.unwrap();
    }

    #[tokio::test]
    async fn test_get_missing_object() {
        let remote = ObjectStoreRemote::in_memory();
        let err = remote.get("archive/nothing.log").await.unwrap_err();
        assert!(matches!(err, Error::RemoteObjectMissing(ref k) if k == "archive/nothing.log"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let remote = ObjectStoreRemote::in_memory();
        remote.put("archive/p0/a.log", Bytes::from("a")).await.unwrap();
        remote.put("archive/p0/b.log", Bytes::from("bb")).await.unwrap();
        remote.put("archive/p1/c.log", Bytes::from("ccc")).await.unwrap();

        let mut keys: Vec<String> = remote
            .list("archive/p0")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["archive/p0/a.log", "archive/p0/b.log"]);
    }
}
