//! Provider response cache with per-key expiry.
//!
//! Keys are `(provider_id, identifier)`. An entry counts as a miss once
//! `now >= expires_at`, whether or not it has been physically evicted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use leadflow_shared::{Clock, RawPayload, Result, SystemClock};

/// Key/value store for raw provider payloads.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Return the live entry for the key, or `None` on miss/expiry.
    async fn get(&self, provider_id: &str, identifier: &str) -> Result<Option<RawPayload>>;

    /// Store `payload`, superseding any previous entry for the key.
    async fn put(
        &self,
        provider_id: &str,
        identifier: &str,
        payload: &RawPayload,
        ttl: Duration,
    ) -> Result<()>;

    /// Physically drop expired entries. Returns how many were removed.
    async fn evict_expired(&self) -> Result<usize>;
}

/// Composite cache key. Identifiers are matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub provider_id: String,
    pub identifier: String,
}

impl CacheKey {
    pub fn new(provider_id: &str, identifier: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            identifier: normalize_identifier(identifier),
        }
    }
}

/// Trim and lowercase an identifier for keying.
pub fn normalize_identifier(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}

/// One cached payload.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: RawPayload,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// `now + ttl`, saturating at the maximum representable time.
pub fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Process-local cache. Safe for concurrent use; last writer wins.
pub struct MemoryCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Number of stored entries, live or expired.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, provider_id: &str, identifier: &str) -> Result<Option<RawPayload>> {
        let key = CacheKey::new(provider_id, identifier);
        let now = self.clock.now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(&key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.payload.clone()))
    }

    async fn put(
        &self,
        provider_id: &str,
        identifier: &str,
        payload: &RawPayload,
        ttl: Duration,
    ) -> Result<()> {
        let key = CacheKey::new(provider_id, identifier);
        let entry = CacheEntry {
            key: key.clone(),
            payload: payload.clone(),
            expires_at: expiry(self.clock.now(), ttl),
        };
        self.entries.write().await.insert(key, entry);
        Ok(())
    }

    async fn evict_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_shared::ManualClock;
    use serde_json::{Map, json};

    fn payload(provider: &str, name: &str) -> RawPayload {
        let mut data = Map::new();
        data.insert("name".into(), json!(name));
        RawPayload::new(provider, data)
    }

    #[tokio::test]
    async fn put_is_visible_immediately() {
        let cache = MemoryCache::new();
        let p = payload("crunchbase", "Acme");
        cache
            .put("crunchbase", "Acme", &p, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("crunchbase", "Acme").await.unwrap(), Some(p));
    }

    #[tokio::test]
    async fn keys_do_not_collide_across_providers() {
        let cache = MemoryCache::new();
        cache
            .put("crunchbase", "Acme", &payload("crunchbase", "A"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(cache.get("kaspr", "Acme").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn identifiers_match_case_insensitively() {
        let cache = MemoryCache::new();
        cache
            .put("kaspr", "  Acme ", &payload("kaspr", "Acme"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(cache.get("kaspr", "ACME").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn entry_expires_at_boundary() {
        let clock = Arc::new(ManualClock::default());
        let cache = MemoryCache::with_clock(clock.clone());
        cache
            .put("apollo", "Acme", &payload("apollo", "Acme"), Duration::from_secs(3600))
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(3599));
        assert!(cache.get("apollo", "Acme").await.unwrap().is_some());

        // now == expires_at is already a miss
        clock.advance(chrono::Duration::seconds(1));
        assert!(cache.get("apollo", "Acme").await.unwrap().is_none());
        // ...but the entry has not been physically removed yet
        assert_eq!(cache.len().await, 1);

        assert_eq!(cache.evict_expired().await.unwrap(), 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn put_supersedes_previous_entry() {
        let clock = Arc::new(ManualClock::default());
        let cache = MemoryCache::with_clock(clock.clone());
        cache
            .put("apollo", "Acme", &payload("apollo", "old"), Duration::from_secs(10))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(20));
        let fresh = payload("apollo", "new");
        cache
            .put("apollo", "Acme", &fresh, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(cache.get("apollo", "Acme").await.unwrap(), Some(fresh));
        assert_eq!(cache.len().await, 1);
    }

    #[test]
    fn expiry_saturates() {
        let now = Utc::now();
        assert_eq!(expiry(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(expiry(now, Duration::ZERO), now);
    }
}
