//! Session storage.
//!
//! Sessions are created by the auth adapter and consumed by the core
//! through [`SessionStore`]. Expiry is enforced on every read: a session
//! past its `expires_at` reads as absent and is reclaimed, and its live
//! subscriptions are expected to be invalidated by the caller (the
//! [`crate::changelog::ChangelogBroker`] session cascade).

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::kv::{KVAdapter, KvError};
use crate::models::Record;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Adapter-specific payload (refresh token handles, device info, ...).
    #[serde(default)]
    pub data: Record,
}

impl Session {
    pub fn new(user_id: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(24));
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_owned(),
            created_at: now,
            expires_at: now + ttl,
            data: Record::new(),
        }
    }

    pub fn expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Expiry-checked read: an expired session is deleted and reads as
    /// absent.
    async fn get(&self, id: &str) -> Result<Option<Session>, KvError>;

    async fn set(&self, session: &Session) -> Result<(), KvError>;

    async fn delete(&self, id: &str) -> Result<Option<Session>, KvError>;

    /// Extends the session deadline by `ttl` from now.
    async fn touch(&self, id: &str, ttl: Duration) -> Result<bool, KvError>;

    async fn get_by_user(&self, user_id: &str) -> Result<Vec<Session>, KvError>;

    async fn delete_by_user(&self, user_id: &str) -> Result<Vec<Session>, KvError>;

    /// Sweeps expired sessions; returns how many were reclaimed.
    async fn cleanup(&self) -> Result<usize, KvError>;
}

const SESSION_PREFIX: &str = "session:";
const USER_INDEX_PREFIX: &str = "session_user:";

/// KV-backed session store. Sessions serialise to JSON under
/// `session:<id>`, with a per-user id set under `session_user:<user>` for
/// the by-user operations.
pub struct KvSessionStore {
    kv: Arc<dyn KVAdapter>,
}

impl KvSessionStore {
    pub fn new(kv: Arc<dyn KVAdapter>) -> Self {
        Self { kv }
    }

    fn key(id: &str) -> String {
        format!("{SESSION_PREFIX}{id}")
    }

    fn user_key(user_id: &str) -> String {
        format!("{USER_INDEX_PREFIX}{user_id}")
    }

    async fn load(&self, id: &str) -> Result<Option<Session>, KvError> {
        let Some(raw) = self.kv.get(&Self::key(id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<Session>(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(err) => {
                // A corrupt entry is unrecoverable; drop it.
                debug!(id, error = %err, "Dropping undecodable session");
                self.kv.del(&Self::key(id)).await?;
                Ok(None)
            }
        }
    }

    async fn reclaim(&self, session: &Session) -> Result<(), KvError> {
        self.kv.del(&Self::key(&session.id)).await?;
        self.kv
            .srem(&Self::user_key(&session.user_id), &session.id)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for KvSessionStore {
    async fn get(&self, id: &str) -> Result<Option<Session>, KvError> {
        match self.load(id).await? {
            Some(session) if session.expired() => {
                self.reclaim(&session).await?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn set(&self, session: &Session) -> Result<(), KvError> {
        let raw = serde_json::to_string(session)
            .map_err(|err| KvError::Unavailable(err.to_string()))?;
        // The KV TTL mirrors expires_at so abandoned entries age out even
        // without a sweeper.
        let ttl = (session.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.kv.set(&Self::key(&session.id), &raw, Some(ttl)).await?;
        self.kv
            .sadd(&Self::user_key(&session.user_id), &session.id)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<Option<Session>, KvError> {
        let session = self.load(id).await?;
        if let Some(session) = &session {
            self.reclaim(session).await?;
        }
        Ok(session)
    }

    async fn touch(&self, id: &str, ttl: Duration) -> Result<bool, KvError> {
        let Some(mut session) = self.get(id).await? else {
            return Ok(false);
        };
        session.expires_at = Utc::now()
            + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(24));
        self.set(&session).await?;
        Ok(true)
    }

    async fn get_by_user(&self, user_id: &str) -> Result<Vec<Session>, KvError> {
        let ids = self.kv.smembers(&Self::user_key(user_id)).await?;
        let mut sessions = Vec::new();
        for id in ids {
            if let Some(session) = self.get(&id).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    async fn delete_by_user(&self, user_id: &str) -> Result<Vec<Session>, KvError> {
        let sessions = self.get_by_user(user_id).await?;
        for session in &sessions {
            self.reclaim(session).await?;
        }
        Ok(sessions)
    }

    async fn cleanup(&self) -> Result<usize, KvError> {
        let keys = self.kv.keys(&format!("{SESSION_PREFIX}*")).await?;
        let mut reclaimed = 0usize;
        for key in keys {
            let id = key.trim_start_matches(SESSION_PREFIX);
            if let Some(session) = self.load(id).await? {
                if session.expired() {
                    self.reclaim(&session).await?;
                    reclaimed += 1;
                }
            }
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use pretty_assertions::assert_eq;

    fn store() -> KvSessionStore {
        KvSessionStore::new(Arc::new(MemoryKv::new()))
    }

    #[tokio::test]
    async fn round_trip_and_user_index() {
        let store = store();
        let session = Session::new("u1", Duration::from_secs(3600));
        store.set(&session).await.unwrap();

        let loaded = store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded, session);

        let by_user = store.get_by_user("u1").await.unwrap();
        assert_eq!(by_user.len(), 1);

        store.delete(&session.id).await.unwrap();
        assert!(store.get(&session.id).await.unwrap().is_none());
        assert!(store.get_by_user("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_session_reads_as_absent() {
        let store = store();
        let mut session = Session::new("u1", Duration::from_secs(3600));
        session.expires_at = Utc::now() - ChronoDuration::seconds(1);
        // Write directly: `set` would hand the KV a zero TTL.
        let raw = serde_json::to_string(&session).unwrap();
        store.kv.set(&KvSessionStore::key(&session.id), &raw, None).await.unwrap();
        store.kv.sadd(&KvSessionStore::user_key("u1"), &session.id).await.unwrap();

        assert!(store.get(&session.id).await.unwrap().is_none());
        assert!(store.get_by_user("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn touch_extends_deadline() {
        let store = store();
        let session = Session::new("u1", Duration::from_secs(60));
        store.set(&session).await.unwrap();
        assert!(store.touch(&session.id, Duration::from_secs(7200)).await.unwrap());
        let loaded = store.get(&session.id).await.unwrap().unwrap();
        assert!(loaded.expires_at > session.expires_at);
        assert!(!store.touch("missing", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_reclaims_expired() {
        let store = store();
        let live = Session::new("u1", Duration::from_secs(3600));
        store.set(&live).await.unwrap();

        let mut dead = Session::new("u2", Duration::from_secs(3600));
        dead.expires_at = Utc::now() - ChronoDuration::seconds(1);
        let raw = serde_json::to_string(&dead).unwrap();
        store.kv.set(&KvSessionStore::key(&dead.id), &raw, None).await.unwrap();

        assert_eq!(store.cleanup().await.unwrap(), 1);
        assert!(store.get(&live.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_by_user_returns_reclaimed_sessions() {
        let store = store();
        let a = Session::new("u1", Duration::from_secs(3600));
        let b = Session::new("u1", Duration::from_secs(3600));
        store.set(&a).await.unwrap();
        store.set(&b).await.unwrap();
        let removed = store.delete_by_user("u1").await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(store.get_by_user("u1").await.unwrap().is_empty());
    }
}
