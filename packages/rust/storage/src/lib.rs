//! Turso Embedded / libSQL storage layer for Leadflow.
//!
//! The [`Storage`] struct wraps a libSQL database holding the provider
//! response cache and finalized lead records. It implements both
//! [`CacheStore`] and [`RecordSink`], so a single file can back a whole run.
//!
//! [`MemoryCache`], [`JsonLinesSink`] and [`MemorySink`] are lighter
//! alternatives for runs that do not need persistence.

pub mod cache;
mod migrations;
pub mod sink;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};

use leadflow_shared::{Clock, FinalRecord, LeadflowError, RawPayload, Result, SystemClock};

pub use cache::{CacheEntry, CacheKey, CacheStore, MemoryCache, expiry, normalize_identifier};
pub use sink::{JsonLinesSink, MemorySink, RecordSink};

/// Summary row for a stored lead record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecordMeta {
    pub identifier: String,
    pub run_id: String,
    pub score: Option<u8>,
    pub finalized_at: String,
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    clock: Arc<dyn Clock>,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock)).await
    }

    /// Like [`Storage::open`], but expiry is judged against `clock`.
    pub async fn open_with_clock(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| LeadflowError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            clock,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` for inspection only.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            clock: Arc::new(SystemClock),
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        LeadflowError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    pub async fn schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // table doesn't exist yet
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(LeadflowError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cache maintenance
    // -----------------------------------------------------------------------

    /// Drop every cache entry, live or not. Returns the number removed.
    pub async fn purge_cache(&self) -> Result<usize> {
        self.check_writable()?;
        let removed = self
            .conn
            .execute("DELETE FROM cache_entries", params![])
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;
        Ok(removed as usize)
    }

    /// Number of rows in the cache table, live or expired.
    pub async fn cache_len(&self) -> Result<usize> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM cache_entries", params![])
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0).max(0) as usize),
            _ => Ok(0),
        }
    }

    // -----------------------------------------------------------------------
    // Lead records
    // -----------------------------------------------------------------------

    /// Insert or replace the stored record for its identifier.
    pub async fn save_record(&self, record: &FinalRecord) -> Result<()> {
        self.check_writable()?;
        let json = serde_json::to_string(record)
            .map_err(|e| LeadflowError::Storage(format!("failed to serialize record: {e}")))?;
        let score = record.record().score().map(i64::from);
        let finalized_at = record.finalized_at().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO lead_records (identifier, run_id, score, record_json, finalized_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(identifier) DO UPDATE SET
                    run_id = excluded.run_id,
                    score = excluded.score,
                    record_json = excluded.record_json,
                    finalized_at = excluded.finalized_at",
                params![
                    record.identifier(),
                    record.run_id().to_string(),
                    score,
                    json,
                    finalized_at
                ],
            )
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Load the latest stored record for `identifier`.
    pub async fn get_record(&self, identifier: &str) -> Result<Option<FinalRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_json FROM lead_records WHERE identifier = ?1",
                params![identifier],
            )
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let json: String = row
                    .get(0)
                    .map_err(|e| LeadflowError::Storage(e.to_string()))?;
                let record = serde_json::from_str(&json)
                    .map_err(|e| LeadflowError::Storage(format!("corrupt record row: {e}")))?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(LeadflowError::Storage(e.to_string())),
        }
    }

    /// List stored records, highest score first.
    pub async fn list_records(&self) -> Result<Vec<StoredRecordMeta>> {
        let mut rows = self
            .conn
            .query(
                "SELECT identifier, run_id, score, finalized_at FROM lead_records
                 ORDER BY score DESC, identifier ASC",
                params![],
            )
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            records.push(StoredRecordMeta {
                identifier: row.get(0).map_err(|e| LeadflowError::Storage(e.to_string()))?,
                run_id: row.get(1).map_err(|e| LeadflowError::Storage(e.to_string()))?,
                score: row
                    .get::<Option<i64>>(2)
                    .ok()
                    .flatten()
                    .map(|s| s.clamp(0, 100) as u8),
                finalized_at: row.get(3).map_err(|e| LeadflowError::Storage(e.to_string()))?,
            });
        }
        Ok(records)
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

#[async_trait]
impl CacheStore for Storage {
    async fn get(&self, provider_id: &str, identifier: &str) -> Result<Option<RawPayload>> {
        let key = CacheKey::new(provider_id, identifier);
        let now = to_millis(self.clock.now());
        let mut rows = self
            .conn
            .query(
                "SELECT payload_json FROM cache_entries
                 WHERE provider_id = ?1 AND identifier = ?2 AND expires_at_ms > ?3",
                params![key.provider_id, key.identifier, now],
            )
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let json: String = row
                    .get(0)
                    .map_err(|e| LeadflowError::Storage(e.to_string()))?;
                let payload = serde_json::from_str(&json)
                    .map_err(|e| LeadflowError::Storage(format!("corrupt cache row: {e}")))?;
                Ok(Some(payload))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(LeadflowError::Storage(e.to_string())),
        }
    }

    async fn put(
        &self,
        provider_id: &str,
        identifier: &str,
        payload: &RawPayload,
        ttl: Duration,
    ) -> Result<()> {
        self.check_writable()?;
        let key = CacheKey::new(provider_id, identifier);
        let json = serde_json::to_string(payload)
            .map_err(|e| LeadflowError::Storage(format!("failed to serialize payload: {e}")))?;
        let expires_at = to_millis(expiry(self.clock.now(), ttl));
        self.conn
            .execute(
                "INSERT INTO cache_entries (provider_id, identifier, payload_json, expires_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(provider_id, identifier) DO UPDATE SET
                    payload_json = excluded.payload_json,
                    expires_at_ms = excluded.expires_at_ms",
                params![key.provider_id, key.identifier, json, expires_at],
            )
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn evict_expired(&self) -> Result<usize> {
        self.check_writable()?;
        let now = to_millis(self.clock.now());
        let removed = self
            .conn
            .execute(
                "DELETE FROM cache_entries WHERE expires_at_ms <= ?1",
                params![now],
            )
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;
        Ok(removed as usize)
    }
}

#[async_trait]
impl RecordSink for Storage {
    async fn save(&self, record: &FinalRecord) -> Result<()> {
        self.save_record(record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_shared::{CanonicalRecord, Field, ManualClock, MergePolicy, RunId};
    use serde_json::{Map, json};
    use uuid::Uuid;

    fn temp_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("lf_test_{}.db", Uuid::now_v7()))
    }

    async fn test_storage() -> Storage {
        Storage::open(&temp_path()).await.expect("open test storage")
    }

    fn payload(provider: &str) -> RawPayload {
        let mut data = Map::new();
        data.insert("name".into(), json!("Acme"));
        data.insert("employees".into(), json!(120));
        RawPayload::new(provider, data)
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = temp_path();
        let s1 = Storage::open(&tmp).await.unwrap();
        drop(s1);
        let s2 = Storage::open(&tmp).await.unwrap();
        assert_eq!(s2.schema_version().await, 1);
    }

    #[tokio::test]
    async fn cache_roundtrip_and_overwrite() {
        let storage = test_storage().await;
        assert!(storage.get("kaspr", "Acme").await.unwrap().is_none());

        let p = payload("kaspr");
        storage
            .put("kaspr", "Acme", &p, Duration::from_secs(60))
            .await
            .expect("put");
        assert_eq!(storage.get("kaspr", "acme").await.unwrap(), Some(p));

        let mut data = Map::new();
        data.insert("name".into(), json!("Acme Corp"));
        let newer = RawPayload::new("kaspr", data);
        storage
            .put("kaspr", "ACME", &newer, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(storage.get("kaspr", "Acme").await.unwrap(), Some(newer));
        assert_eq!(storage.cache_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cache_expiry_and_eviction() {
        let clock = Arc::new(ManualClock::default());
        let storage = Storage::open_with_clock(&temp_path(), clock.clone())
            .await
            .unwrap();
        storage
            .put("crunchbase", "Acme", &payload("crunchbase"), Duration::from_secs(3600))
            .await
            .unwrap();
        storage
            .put("apollo", "Acme", &payload("apollo"), Duration::from_secs(7200))
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(3600));
        assert!(storage.get("crunchbase", "Acme").await.unwrap().is_none());
        assert!(storage.get("apollo", "Acme").await.unwrap().is_some());

        assert_eq!(storage.evict_expired().await.unwrap(), 1);
        assert_eq!(storage.cache_len().await.unwrap(), 1);
        assert_eq!(storage.purge_cache().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn records_upsert_by_identifier() {
        let storage = test_storage().await;

        let mut record = CanonicalRecord::new("Acme");
        record.merge_field(Field::Industry, json!("SaaS"), "crunchbase", 0, MergePolicy::FirstWins);
        record.set_score(40);
        storage.save(&FinalRecord::new(RunId::new(), record.clone())).await.unwrap();

        record.set_score(65);
        let second = FinalRecord::new(RunId::new(), record);
        storage.save(&second).await.unwrap();

        let loaded = storage.get_record("Acme").await.unwrap().expect("record");
        assert_eq!(loaded.record().score(), Some(65));
        assert_eq!(loaded.run_id(), second.run_id());

        let listed = storage.list_records().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].score, Some(65));
        assert!(storage.get_record("Globex").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = temp_path();
        let rw = Storage::open(&tmp).await.unwrap();
        rw.put("kaspr", "Acme", &payload("kaspr"), Duration::from_secs(60))
            .await
            .unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert!(ro.get("kaspr", "Acme").await.unwrap().is_some());
        let result = ro
            .put("kaspr", "Globex", &payload("kaspr"), Duration::from_secs(60))
            .await;
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
