//! Cache-checked, deadline-bounded access to a source provider.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use leadflow_shared::{LeadflowError, RawPayload, Result};
use leadflow_storage::CacheStore;

use crate::provider::SourceProvider;

/// Wraps a [`SourceProvider`] with the shared cache.
///
/// Hit: the cached payload is returned and upstream is not called.
/// Miss: upstream is called under the configured timeout and, on success
/// only, the payload is stored with the configured TTL.
pub struct CachedSource {
    inner: Arc<dyn SourceProvider>,
    cache: Arc<dyn CacheStore>,
    ttl: Duration,
    timeout: Duration,
}

impl CachedSource {
    pub fn new(
        inner: Arc<dyn SourceProvider>,
        cache: Arc<dyn CacheStore>,
        ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            inner,
            cache,
            ttl,
            timeout,
        }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    /// Fetch through the cache, aborting as soon as `cancel` fires.
    pub async fn fetch(&self, identifier: &str, cancel: &CancellationToken) -> Result<RawPayload> {
        if cancel.is_cancelled() {
            return Err(LeadflowError::Cancelled);
        }
        let provider = self.inner.id();

        // A broken cache degrades to a miss rather than failing the fetch.
        match self.cache.get(provider, identifier).await {
            Ok(Some(payload)) => {
                debug!(provider, identifier, "cache hit");
                return Ok(payload);
            }
            Ok(None) => debug!(provider, identifier, "cache miss"),
            Err(e) => warn!(provider, identifier, kind = e.kind(), error = %e, "cache read failed"),
        }

        let started = Instant::now();
        let payload = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LeadflowError::Cancelled),
            result = tokio::time::timeout(self.timeout, self.inner.fetch_raw(identifier)) => {
                match result {
                    Ok(inner) => inner?,
                    Err(_) => {
                        return Err(LeadflowError::Timeout {
                            provider: provider.to_string(),
                            elapsed_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                }
            }
        };

        if let Err(e) = self.cache.put(provider, identifier, &payload, self.ttl).await {
            warn!(provider, identifier, kind = e.kind(), error = %e, "cache write failed");
        }
        Ok(payload)
    }
}

#[async_trait]
impl SourceProvider for CachedSource {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn fetch_raw(&self, identifier: &str) -> Result<RawPayload> {
        self.fetch(identifier, &CancellationToken::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::StaticSource;
    use leadflow_shared::ManualClock;
    use leadflow_storage::MemoryCache;
    use serde_json::json;

    struct SlowSource;

    #[async_trait]
    impl SourceProvider for SlowSource {
        fn id(&self) -> &str {
            "slow"
        }

        async fn fetch_raw(&self, _identifier: &str) -> Result<RawPayload> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(LeadflowError::unavailable("slow", "unreachable"))
        }
    }

    fn setup(clock: Arc<ManualClock>) -> (Arc<StaticSource>, Arc<MemoryCache>, CachedSource) {
        let source = Arc::new(StaticSource::new("kaspr").with("Acme", json!({"name": "Acme"})));
        let cache = Arc::new(MemoryCache::with_clock(clock));
        let cached = CachedSource::new(
            source.clone(),
            cache.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(5),
        );
        (source, cache, cached)
    }

    #[tokio::test]
    async fn second_fetch_within_ttl_hits_cache() {
        let clock = Arc::new(ManualClock::default());
        let (source, _cache, cached) = setup(clock);
        let token = CancellationToken::new();

        let first = cached.fetch("Acme", &token).await.unwrap();
        let second = cached.fetch("Acme", &token).await.unwrap();
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test]
    async fn fetch_after_expiry_calls_upstream_again() {
        let clock = Arc::new(ManualClock::default());
        let (source, cache, cached) = setup(clock.clone());
        let token = CancellationToken::new();

        cached.fetch("Acme", &token).await.unwrap();
        clock.advance(chrono::Duration::seconds(3600));
        cached.fetch("Acme", &token).await.unwrap();
        assert_eq!(source.call_count(), 2);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let clock = Arc::new(ManualClock::default());
        let (source, cache, cached) = setup(clock);
        let token = CancellationToken::new();

        let err = cached.fetch("Globex", &token).await.unwrap_err();
        assert_eq!(err.kind(), "no_data");
        assert!(cache.is_empty().await);
        cached.fetch("Globex", &token).await.unwrap_err();
        assert_eq!(source.call_count(), 2);
    }

    #[tokio::test]
    async fn slow_upstream_times_out() {
        let cached = CachedSource::new(
            Arc::new(SlowSource),
            Arc::new(MemoryCache::new()),
            Duration::from_secs(60),
            Duration::from_millis(50),
        );
        let err = cached
            .fetch("Acme", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LeadflowError::Timeout { ref provider, .. } if provider == "slow"));
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_call() {
        let cache = Arc::new(MemoryCache::new());
        let cached = CachedSource::new(
            Arc::new(SlowSource),
            cache.clone(),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = cached.fetch("Acme", &token).await.unwrap_err();
        assert!(matches!(err, LeadflowError::Cancelled));
        assert!(cache.is_empty().await);
    }
}
