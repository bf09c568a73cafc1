//! # KV adapter
//!
//! The narrow key-value contract consumed by the session store, the
//! idempotency store and the task scheduler. The core never holds KV state
//! across requests beyond these calls, so clustering reduces to pointing
//! every instance at the same KV.

mod memory;

pub use memory::MemoryKv;

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KvError {
    #[error("Wrong value kind for key `{0}`")]
    WrongKind(String),
    #[error("KV backend unavailable: {0}")]
    Unavailable(String),
}

impl From<KvError> for crate::error::ApiError {
    fn from(value: KvError) -> Self {
        // Shared-state outages fail closed.
        crate::error::ApiError::Unavailable(value.to_string())
    }
}

#[async_trait]
pub trait KVAdapter: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Sets only if the key is absent. Returns whether the write happened.
    /// This is the single-writer lock primitive.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<bool, KvError>;

    async fn del(&self, key: &str) -> Result<bool, KvError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;

    async fn exists(&self, key: &str) -> Result<bool, KvError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError>;

    async fn hmset(&self, key: &str, entries: &[(String, String)]) -> Result<(), KvError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError>;

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, KvError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, KvError>;

    async fn srem(&self, key: &str, member: &str) -> Result<bool, KvError>;

    async fn smembers(&self, key: &str) -> Result<HashSet<String>, KvError>;

    /// Key scan with a trailing-`*` glob (`session:*`), or an exact match.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError>;
}
