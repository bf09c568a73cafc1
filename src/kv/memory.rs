//! In-memory KV adapter.
//!
//! Expiry is checked on every read; a key past its deadline reads as absent
//! and is reclaimed in place. Good enough for single-process deployments
//! and the test-suite; clustered deployments plug in a shared store.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{KVAdapter, KvError};

#[derive(Debug, Clone)]
enum Kind {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    kind: Kind,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.map(|at| at <= Instant::now()).unwrap_or(false)
    }
}

#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    if map.get(key).map(Entry::expired).unwrap_or(false) {
        map.remove(key);
        return None;
    }
    map.get_mut(key)
}

#[async_trait]
impl KVAdapter for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut map = self.inner.lock().await;
        match live(&mut map, key) {
            None => Ok(None),
            Some(entry) => match &entry.kind {
                Kind::Str(s) => Ok(Some(s.clone())),
                _ => Err(KvError::WrongKind(key.to_owned())),
            },
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut map = self.inner.lock().await;
        map.insert(
            key.to_owned(),
            Entry {
                kind: Kind::Str(value.to_owned()),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let mut map = self.inner.lock().await;
        if live(&mut map, key).is_some() {
            return Ok(false);
        }
        map.insert(
            key.to_owned(),
            Entry {
                kind: Kind::Str(value.to_owned()),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        let mut map = self.inner.lock().await;
        let was_live = live(&mut map, key).is_some();
        map.remove(key);
        Ok(was_live)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut map = self.inner.lock().await;
        match live(&mut map, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut map = self.inner.lock().await;
        Ok(live(&mut map, key).is_some())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        let mut map = self.inner.lock().await;
        match live(&mut map, key) {
            None => Ok(None),
            Some(entry) => match &entry.kind {
                Kind::Hash(h) => Ok(h.get(field).cloned()),
                _ => Err(KvError::WrongKind(key.to_owned())),
            },
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        self.hmset(key, &[(field.to_owned(), value.to_owned())]).await
    }

    async fn hmset(&self, key: &str, entries: &[(String, String)]) -> Result<(), KvError> {
        let mut map = self.inner.lock().await;
        if live(&mut map, key).is_none() {
            map.insert(
                key.to_owned(),
                Entry { kind: Kind::Hash(HashMap::new()), expires_at: None },
            );
        }
        let entry = map.get_mut(key).expect("just ensured");
        match &mut entry.kind {
            Kind::Hash(h) => {
                for (field, value) in entries {
                    h.insert(field.clone(), value.clone());
                }
                Ok(())
            }
            _ => Err(KvError::WrongKind(key.to_owned())),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let mut map = self.inner.lock().await;
        match live(&mut map, key) {
            None => Ok(HashMap::new()),
            Some(entry) => match &entry.kind {
                Kind::Hash(h) => Ok(h.clone()),
                _ => Err(KvError::WrongKind(key.to_owned())),
            },
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, KvError> {
        let mut map = self.inner.lock().await;
        match live(&mut map, key) {
            None => Ok(false),
            Some(entry) => match &mut entry.kind {
                Kind::Hash(h) => Ok(h.remove(field).is_some()),
                _ => Err(KvError::WrongKind(key.to_owned())),
            },
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut map = self.inner.lock().await;
        if live(&mut map, key).is_none() {
            map.insert(
                key.to_owned(),
                Entry { kind: Kind::Set(HashSet::new()), expires_at: None },
            );
        }
        let entry = map.get_mut(key).expect("just ensured");
        match &mut entry.kind {
            Kind::Set(s) => Ok(s.insert(member.to_owned())),
            _ => Err(KvError::WrongKind(key.to_owned())),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut map = self.inner.lock().await;
        match live(&mut map, key) {
            None => Ok(false),
            Some(entry) => match &mut entry.kind {
                Kind::Set(s) => Ok(s.remove(member)),
                _ => Err(KvError::WrongKind(key.to_owned())),
            },
        }
    }

    async fn smembers(&self, key: &str) -> Result<HashSet<String>, KvError> {
        let mut map = self.inner.lock().await;
        match live(&mut map, key) {
            None => Ok(HashSet::new()),
            Some(entry) => match &entry.kind {
                Kind::Set(s) => Ok(s.clone()),
                _ => Err(KvError::WrongKind(key.to_owned())),
            },
        }
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut map = self.inner.lock().await;
        let expired: Vec<String> = map
            .iter()
            .filter(|(_, e)| e.expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            map.remove(&key);
        }
        let matches: Vec<String> = match pattern.strip_suffix('*') {
            Some(prefix) => map.keys().filter(|k| k.starts_with(prefix)).cloned().collect(),
            None => map.keys().filter(|k| *k == pattern).cloned().collect(),
        };
        Ok(matches)
    }
}
