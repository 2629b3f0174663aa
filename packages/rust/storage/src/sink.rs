//! Destinations for finalized lead records.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use leadflow_shared::{FinalRecord, LeadflowError, Result};

/// The storage/presentation collaborator that receives each finalized record once.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn save(&self, record: &FinalRecord) -> Result<()>;
}

/// Appends one JSON document per line to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it and its parent directories if needed.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LeadflowError::io(parent, e))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| LeadflowError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSink for JsonLinesSink {
    async fn save(&self, record: &FinalRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)
            .map_err(|e| LeadflowError::Storage(format!("failed to serialize record: {e}")))?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line)
            .await
            .map_err(|e| LeadflowError::io(&self.path, e))?;
        file.flush()
            .await
            .map_err(|e| LeadflowError::io(&self.path, e))?;
        Ok(())
    }
}

/// Keeps records in memory; handy for dry runs and tests.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<FinalRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything saved so far, in save order.
    pub async fn records(&self) -> Vec<FinalRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn save(&self, record: &FinalRecord) -> Result<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}
