//! The source provider capability and an in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value};

use leadflow_shared::{LeadflowError, RawPayload, Result};
use leadflow_storage::normalize_identifier;

/// Fetches a raw record for an identifier from one external source.
///
/// Implementations are black boxes behind this contract: they report
/// upstream trouble through the `LeadflowError` provider variants and never
/// touch the cache themselves (see [`crate::CachedSource`]).
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Stable provider id used for cache keys and provenance.
    fn id(&self) -> &str;

    async fn fetch_raw(&self, identifier: &str) -> Result<RawPayload>;
}

/// Serves fixed payloads keyed by identifier. Unknown identifiers are `NoData`.
pub struct StaticSource {
    id: String,
    payloads: HashMap<String, Map<String, Value>>,
    calls: AtomicUsize,
}

impl StaticSource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payloads: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Register the payload returned for `identifier`.
    ///
    /// Non-object values are wrapped as `{"value": ...}`.
    pub fn with(mut self, identifier: &str, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            other => Map::from_iter([("value".to_string(), other)]),
        };
        self.payloads.insert(normalize_identifier(identifier), data);
        self
    }

    /// How many times `fetch_raw` has been called.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceProvider for StaticSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch_raw(&self, identifier: &str) -> Result<RawPayload> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads
            .get(&normalize_identifier(identifier))
            .map(|data| RawPayload::new(self.id.clone(), data.clone()))
            .ok_or_else(|| LeadflowError::NoData {
                provider: self.id.clone(),
                identifier: identifier.to_string(),
            })
    }
}
