//! File-backed backup transport

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::coordinator::OperationContext;
use crate::error::TransportError;
use crate::operation::OperationId;
use crate::transport::{BackupTransport, RestoredPayload};

/// A stored snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Backup operation that produced the record
    pub id: OperationId,
    /// Package the snapshot belongs to
    pub package: String,
    /// When the record was written
    pub created_at: DateTime<Utc>,
    /// Snapshot size in bytes
    pub size_bytes: u64,
    /// Opaque snapshot
    pub data: Vec<u8>,
}

/// Transport storing each backup as a JSON record under a directory
#[derive(Debug, Clone)]
pub struct FileTransport {
    /// Base directory for backup records
    base_dir: PathBuf,
    /// Package name reported on restore
    package: String,
    /// Number of newest records kept after each backup
    keep: usize,
}

impl FileTransport {
    /// Create a transport rooted at `base_dir`
    pub fn new(base_dir: PathBuf, package: impl Into<String>) -> Self {
        Self {
            base_dir,
            package: package.into(),
            keep: 3,
        }
    }

    /// Keep the newest `keep` records (at least one)
    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = keep.max(1);
        self
    }

    /// Initialize storage directory
    pub async fn init(&self) -> Result<(), TransportError> {
        fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            TransportError::Storage(format!("Failed to create storage directory: {}", e))
        })?;

        debug!(dir = %self.base_dir.display(), "Initialized backup storage");
        Ok(())
    }

    /// Load one record
    pub async fn load(&self, id: &OperationId) -> Result<BackupRecord, TransportError> {
        let path = self.record_path(id);

        let json = fs::read_to_string(&path)
            .await
            .map_err(|e| TransportError::Storage(format!("Failed to read record: {}", e)))?;

        serde_json::from_str(&json)
            .map_err(|e| TransportError::Storage(format!("Failed to deserialize record: {}", e)))
    }

    /// All records, oldest first
    pub async fn records(&self) -> Result<Vec<BackupRecord>, TransportError> {
        let mut records = Vec::new();
        for id in self.list_ids().await? {
            records.push(self.load(&id).await?);
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    /// Newest record, if any
    pub async fn latest(&self) -> Result<Option<BackupRecord>, TransportError> {
        Ok(self.records().await?.pop())
    }

    /// Total size of stored records on disk
    pub async fn total_size(&self) -> Result<u64, TransportError> {
        let mut total = 0u64;
        for id in self.list_ids().await? {
            if let Ok(metadata) = fs::metadata(self.record_path(&id)).await {
                total += metadata.len();
            }
        }
        Ok(total)
    }

    async fn save(&self, record: &BackupRecord) -> Result<u64, TransportError> {
        self.init().await?;

        let path = self.record_path(&record.id);
        let tmp = path.with_extension("json.tmp");

        let json = serde_json::to_string(record)
            .map_err(|e| TransportError::Storage(format!("Failed to serialize record: {}", e)))?;
        let size = json.len() as u64;

        fs::write(&tmp, &json)
            .await
            .map_err(|e| TransportError::Storage(format!("Failed to write record: {}", e)))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| TransportError::Storage(format!("Failed to commit record: {}", e)))?;

        debug!(
            operation_id = %record.id,
            path = %path.display(),
            size = size,
            "Saved backup record"
        );
        Ok(size)
    }

    async fn list_ids(&self) -> Result<Vec<OperationId>, TransportError> {
        let mut ids = Vec::new();

        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => {
                return Err(TransportError::Storage(format!(
                    "Failed to read storage directory: {}",
                    e
                )))
            }
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| TransportError::Storage(format!("Failed to read entry: {}", e)))?
        {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Some(stem) = path.file_stem() {
                    if let Ok(uuid) = stem.to_string_lossy().parse::<uuid::Uuid>() {
                        ids.push(OperationId::from_uuid(uuid));
                    }
                }
            }
        }

        Ok(ids)
    }

    async fn prune(&self) -> Result<usize, TransportError> {
        let records = self.records().await?;
        let excess = records.len().saturating_sub(self.keep);

        for record in records.iter().take(excess) {
            fs::remove_file(self.record_path(&record.id))
                .await
                .map_err(|e| TransportError::Storage(format!("Failed to delete record: {}", e)))?;
            debug!(operation_id = %record.id, "Pruned old backup record");
        }
        Ok(excess)
    }

    fn record_path(&self, id: &OperationId) -> PathBuf {
        self.base_dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl BackupTransport for FileTransport {
    async fn send(&self, ctx: &OperationContext, snapshot: Vec<u8>) -> Result<(), TransportError> {
        if ctx.is_cancelled() {
            return Err(TransportError::Aborted);
        }

        let record = BackupRecord {
            id: ctx.id(),
            package: self.package.clone(),
            created_at: Utc::now(),
            size_bytes: snapshot.len() as u64,
            data: snapshot,
        };
        let size = self.save(&record).await?;
        ctx.report_progress(1, 1, Some(&self.package));

        // Past the commit point; cancellation no longer undoes the write
        let pruned = self.prune().await?;
        info!(
            operation_id = %record.id,
            size = size,
            pruned = pruned,
            "Wrote backup record"
        );
        Ok(())
    }

    async fn fetch(&self, ctx: &OperationContext) -> Result<RestoredPayload, TransportError> {
        if ctx.is_cancelled() {
            return Err(TransportError::Aborted);
        }

        match self.latest().await? {
            Some(record) => Ok(RestoredPayload::single(record.package, record.data)),
            None => {
                debug!(dir = %self.base_dir.display(), "No backup records found");
                Ok(RestoredPayload::empty())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::operation::OperationKind;
    use tempfile::tempdir;

    fn backup_ctx() -> OperationContext {
        OperationContext::detached(OperationKind::Backup)
    }

    fn restore_ctx() -> OperationContext {
        OperationContext::detached(OperationKind::Restore)
    }

    #[tokio::test]
    async fn test_send_then_fetch() {
        let dir = tempdir().unwrap();
        let transport = FileTransport::new(dir.path().to_path_buf(), "prefs");

        let ctx = backup_ctx();
        transport.send(&ctx, b"hello".to_vec()).await.unwrap();

        let record = transport.load(&ctx.id()).await.unwrap();
        assert_eq!(record.size_bytes, 5);
        assert_eq!(record.package, "prefs");

        let payload = transport.fetch(&restore_ctx()).await.unwrap();
        assert_eq!(payload, RestoredPayload::single("prefs", b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_fetch_missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        let transport = FileTransport::new(dir.path().join("never-created"), "prefs");

        let payload = transport.fetch(&restore_ctx()).await.unwrap();
        assert!(payload.is_empty());
        assert_eq!(transport.total_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fetch_returns_newest() {
        let dir = tempdir().unwrap();
        let transport = FileTransport::new(dir.path().to_path_buf(), "prefs");

        transport.send(&backup_ctx(), b"v1".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        transport.send(&backup_ctx(), b"v2".to_vec()).await.unwrap();

        let payload = transport.fetch(&restore_ctx()).await.unwrap();
        assert_eq!(payload.packages[0].data, b"v2".to_vec());
    }

    #[tokio::test]
    async fn test_prunes_to_keep() {
        let dir = tempdir().unwrap();
        let transport = FileTransport::new(dir.path().to_path_buf(), "prefs").with_keep(2);

        for i in 0..4u8 {
            transport.send(&backup_ctx(), vec![i]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let records = transport.records().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].data, vec![3]);
        assert!(transport.total_size().await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_cancelled_send_writes_nothing() {
        let dir = tempdir().unwrap();
        let transport = FileTransport::new(dir.path().to_path_buf(), "prefs");

        let ctx = backup_ctx();
        ctx.cancel();
        let err = transport.send(&ctx, b"data".to_vec()).await.unwrap_err();
        assert_eq!(err, TransportError::Aborted);
        assert!(transport.latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_storage_error() {
        let dir = tempdir().unwrap();
        let transport = FileTransport::new(dir.path().to_path_buf(), "prefs");
        transport.init().await.unwrap();

        let id = OperationId::new();
        tokio::fs::write(dir.path().join(format!("{}.json", id)), "not json")
            .await
            .unwrap();

        let err = transport.fetch(&restore_ctx()).await.unwrap_err();
        assert!(matches!(err, TransportError::Storage(msg) if msg.contains("deserialize")));
    }
}
