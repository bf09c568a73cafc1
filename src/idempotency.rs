//! Idempotent mutation.
//!
//! When a mutating request carries `Idempotency-Key`, the first execution
//! under a `(principal, method, path, key)` scope caches its response and
//! every retry within the TTL replays it. A request fingerprint (method,
//! path, canonical body) detects a key reused for a different logical
//! request, which is a conflict.
//!
//! A single-writer lock (KV `set_nx`) serialises concurrent requests with
//! the same key: losers wait for the winner and replay its cached response.
//! Responses with status ≥ 500 are never cached; their retries re-execute.
//!
//! Failure policy is fail-closed: a KV outage surfaces as `Unavailable`
//! and the request does not execute.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::error::ApiError;
use crate::kv::KVAdapter;
use crate::models::canonical_json;

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Lock deadline: an executor that dies without releasing blocks retries
/// for at most this long.
const LOCK_TTL: Duration = Duration::from_secs(30);

const WAIT_STEP: Duration = Duration::from_millis(50);
const MAX_WAIT: Duration = Duration::from_secs(10);

/// `^[A-Za-z0-9_-]{8,256}$`
pub fn validate_key(key: &str) -> bool {
    (8..=256).contains(&key.len())
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Hash over `(method, path, canonical body)`.
pub fn fingerprint(method: &str, path: &str, body: Option<&Value>) -> String {
    let mut hasher = Md5::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    if let Some(body) = body {
        hasher.update(canonical_json(body).as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub body: Value,
    /// End-to-end headers worth replaying. Hop-by-hop headers are never
    /// cached.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub resource_version: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    fingerprint: String,
    #[serde(flatten)]
    response: StoredResponse,
}

/// Handed out by [`IdempotencyStore::begin`] when the caller should
/// execute; it must end with [`IdempotencyStore::complete`] or
/// [`IdempotencyStore::abort`] to release the scope lock.
#[derive(Debug)]
pub struct ExecutionGuard {
    scope: String,
}

#[derive(Debug)]
pub enum Begin {
    Execute(ExecutionGuard),
    Replay(StoredResponse),
}

pub struct IdempotencyStore {
    kv: Arc<dyn KVAdapter>,
    ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(kv: Arc<dyn KVAdapter>) -> Self {
        Self::with_ttl(kv, DEFAULT_TTL)
    }

    pub fn with_ttl(kv: Arc<dyn KVAdapter>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub fn scope(principal: &str, method: &str, path: &str, key: &str) -> String {
        format!("{principal}:{method}:{path}:{key}")
    }

    fn record_key(scope: &str) -> String {
        format!("idem:{scope}")
    }

    fn lock_key(scope: &str) -> String {
        format!("idem_lock:{scope}")
    }

    async fn lookup(
        &self,
        scope: &str,
        fingerprint: &str,
    ) -> Result<Option<StoredResponse>, ApiError> {
        let Some(raw) = self.kv.get(&Self::record_key(scope)).await? else {
            return Ok(None);
        };
        let record: StoredRecord = serde_json::from_str(&raw)
            .map_err(|err| ApiError::Internal(format!("undecodable idempotency record: {err}")))?;
        if record.fingerprint != fingerprint {
            return Err(ApiError::Conflict(
                "Idempotency-Key reused for a different request".to_owned(),
            ));
        }
        Ok(Some(record.response))
    }

    /// Pre-check and lock acquisition. Blocks (bounded) while a concurrent
    /// request with the same scope executes.
    #[instrument(skip(self, fingerprint))]
    pub async fn begin(&self, scope: &str, fingerprint: &str) -> Result<Begin, ApiError> {
        let mut waited = Duration::ZERO;
        loop {
            if let Some(response) = self.lookup(scope, fingerprint).await? {
                debug!(scope, "Replaying cached idempotent response");
                return Ok(Begin::Replay(response));
            }
            if self
                .kv
                .set_nx(&Self::lock_key(scope), "1", Some(LOCK_TTL))
                .await?
            {
                return Ok(Begin::Execute(ExecutionGuard { scope: scope.to_owned() }));
            }
            if waited >= MAX_WAIT {
                warn!(scope, "Gave up waiting for idempotency lock");
                return Err(ApiError::Unavailable(
                    "timed out waiting for a concurrent request with the same Idempotency-Key"
                        .to_owned(),
                ));
            }
            tokio::time::sleep(WAIT_STEP).await;
            waited += WAIT_STEP;
        }
    }

    /// Write-through after execution. Final statuses < 500 are cached;
    /// server errors are not, so retries re-execute.
    pub async fn complete(
        &self,
        guard: ExecutionGuard,
        fingerprint: &str,
        response: StoredResponse,
    ) -> Result<(), ApiError> {
        if response.status < 500 {
            let record = StoredRecord { fingerprint: fingerprint.to_owned(), response };
            let raw = serde_json::to_string(&record)
                .map_err(|err| ApiError::Internal(err.to_string()))?;
            self.kv
                .set(&Self::record_key(&guard.scope), &raw, Some(self.ttl))
                .await?;
        }
        self.kv.del(&Self::lock_key(&guard.scope)).await?;
        Ok(())
    }

    /// Releases the lock without caching (the execution never produced a
    /// response, e.g. it panicked upstream or was cancelled).
    pub async fn abort(&self, guard: ExecutionGuard) -> Result<(), ApiError> {
        self.kv.del(&Self::lock_key(&guard.scope)).await?;
        Ok(())
    }
}
