use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tracing::debug;

use crate::transport::Session;

pub const DEFAULT_CACHE_CAPACITY: usize = 16;
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(600);

struct CacheEntry {
    session: Arc<dyn Session>,
    last_used: Instant,
}

/// Sessions shared by resource connections, keyed by `user@host`.
///
/// Entries idle for longer than the TTL, and the least recently used entry once
/// the cache is full, are dropped from the cache. A dropped session is only
/// disconnected when nothing outside the cache still holds it; otherwise the
/// last holder hands it back through [`release`](Self::release). A cached
/// session that no longer reports itself connected is never handed out.
pub struct SessionCache {
    entries: DashMap<String, CacheEntry>,
    idle_ttl: Option<Duration>,
    capacity: usize,
}

impl Default for SessionCache {
    fn default() -> Self {
        SessionCache::new(DEFAULT_CACHE_CAPACITY, Some(DEFAULT_IDLE_TTL))
    }
}

impl SessionCache {
    pub fn new(capacity: usize, idle_ttl: Option<Duration>) -> Self {
        SessionCache {
            entries: DashMap::new(),
            idle_ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn get(&self, key: &str) -> Option<Arc<dyn Session>> {
        let (session, usable) = {
            let mut entry = self.entries.get_mut(key)?;
            let usable = entry.session.is_connected() && !self.is_idle(entry.last_used);
            if usable {
                entry.last_used = Instant::now();
            }
            (entry.session.clone(), usable)
        };

        if usable {
            debug!(key, "session cache hit");
            return Some(session);
        }

        debug!(key, "dropping stale cached session");
        self.forget(key, &session);
        if session.is_connected() {
            retire(key, session).await;
        }
        None
    }

    pub async fn insert(&self, key: &str, session: Arc<dyn Session>) {
        if !self.entries.contains_key(key) && self.entries.len() >= self.capacity {
            self.evict_least_recent().await;
        }
        let previous = self.entries.insert(
            key.to_string(),
            CacheEntry {
                session: session.clone(),
                last_used: Instant::now(),
            },
        );
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous.session, &session) {
                retire(key, previous.session).await;
            }
        }
    }

    /// Hands back a session taken from the cache. It is disconnected if the
    /// cache has dropped it meanwhile and `session` was its last holder.
    pub async fn release(&self, key: &str, session: Arc<dyn Session>) {
        let cached = self
            .entries
            .get(key)
            .map(|entry| Arc::ptr_eq(&entry.session, &session))
            .unwrap_or(false);
        if !cached {
            retire(key, session).await;
        }
    }

    /// Disconnects and forgets the session cached under `key`.
    pub async fn invalidate(&self, key: &str) {
        if let Some((_, entry)) = self.entries.remove(key) {
            debug!(key, "invalidating cached session");
            entry.session.disconnect().await;
        }
    }

    /// Forgets every entry that has been idle past the TTL or lost its connection.
    pub async fn purge_idle(&self) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| self.is_idle(entry.last_used) || !entry.session.is_connected())
            .map(|entry| entry.key().clone())
            .collect();
        for key in expired {
            self.reclaim(&key).await;
        }
    }

    /// Disconnects every cached session.
    pub async fn clear(&self) {
        let keys: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            self.invalidate(&key).await;
        }
    }

    async fn evict_least_recent(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.last_used)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            debug!(key = %key, "session cache full, evicting");
            self.reclaim(&key).await;
        }
    }

    /// Removes the entry under `key` only while it still holds `session`;
    /// another task may have cached a fresh one meanwhile.
    fn forget(&self, key: &str, session: &Arc<dyn Session>) -> bool {
        self.entries
            .remove_if(key, |_, entry| Arc::ptr_eq(&entry.session, session))
            .is_some()
    }

    async fn reclaim(&self, key: &str) {
        if let Some((_, entry)) = self.entries.remove(key) {
            retire(key, entry.session).await;
        }
    }

    fn is_idle(&self, last_used: Instant) -> bool {
        match self.idle_ttl {
            Some(ttl) => last_used.elapsed() > ttl,
            None => false,
        }
    }
}

async fn retire(key: &str, session: Arc<dyn Session>) {
    if Arc::strong_count(&session) > 1 {
        debug!(key, "dropped session is still in use");
        return;
    }
    if session.is_connected() {
        session.disconnect().await;
    }
}
