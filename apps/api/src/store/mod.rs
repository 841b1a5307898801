//! State Store — namespaced JSON records with per-key expiry.
//!
//! Keys are `<namespace>:<uuid>`; every write resets the key's TTL.
//! Production runs on Redis (`RedisStore`); tests use an in-memory map.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::file::FileRecord;
use crate::models::job::Job;

pub mod redis_store;

#[cfg(test)]
pub mod memory;

pub const FILE_NAMESPACE: &str = "file";
pub const JOB_NAMESPACE: &str = "job";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Corrupt record at '{key}': {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Raw key-value access with expiry. Single-key operations only.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

pub fn record_key(namespace: &str, id: Uuid) -> String {
    format!("{namespace}:{id}")
}

/// Typed access to file and job records.
#[derive(Clone)]
pub struct StateStore {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl StateStore {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub async fn put_file(&self, record: &FileRecord) -> Result<(), StoreError> {
        self.put(&record_key(FILE_NAMESPACE, record.id), record).await
    }

    pub async fn get_file(&self, id: Uuid) -> Result<Option<FileRecord>, StoreError> {
        self.get(&record_key(FILE_NAMESPACE, id)).await
    }

    pub async fn delete_file(&self, id: Uuid) -> Result<(), StoreError> {
        self.kv.delete(&record_key(FILE_NAMESPACE, id)).await
    }

    pub async fn put_job(&self, job: &Job) -> Result<(), StoreError> {
        self.put(&record_key(JOB_NAMESPACE, job.id), job).await
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        self.get(&record_key(JOB_NAMESPACE, id)).await
    }

    async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string(value).map_err(|source| StoreError::Codec {
            key: key.to_string(),
            source,
        })?;
        self.kv.set_with_ttl(key, &json, self.ttl).await
    }

    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let Some(raw) = self.kv.get(key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Codec {
                key: key.to_string(),
                source,
            })
    }
}
