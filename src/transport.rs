//! Backup transport interface

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::coordinator::OperationContext;
use crate::error::TransportError;
use crate::operation::OperationId;

/// One restored unit of backup data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoredPackage {
    /// Package name, reported in progress events
    pub name: String,
    /// Opaque payload handed to the snapshot provider
    pub data: Vec<u8>,
}

/// Everything a restore fetched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoredPayload {
    pub packages: Vec<RestoredPackage>,
}

impl RestoredPayload {
    /// No backup data available
    pub fn empty() -> Self {
        Self::default()
    }

    /// A single named package
    pub fn single(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            packages: vec![RestoredPackage {
                name: name.into(),
                data,
            }],
        }
    }

    /// Whether nothing was restored
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Total payload size
    pub fn total_bytes(&self) -> u64 {
        self.packages.iter().map(|p| p.data.len() as u64).sum()
    }
}

/// Moves snapshots to and from a backup store.
///
/// Calls run outside the coordinator lock and may take arbitrarily long.
/// Implementations should check [`OperationContext::is_cancelled`] at safe
/// points and may report progress through the context.
#[async_trait]
pub trait BackupTransport: Send + Sync {
    /// Ship a snapshot to the backup store
    async fn send(&self, ctx: &OperationContext, snapshot: Vec<u8>) -> Result<(), TransportError>;

    /// Fetch the latest backup. An empty payload means there is nothing to restore.
    async fn fetch(&self, ctx: &OperationContext) -> Result<RestoredPayload, TransportError>;

    /// Ask an in-flight call for `operation` to stop. Returns whether abort is supported.
    ///
    /// Invoked after the operation has already reached its terminal state.
    fn abort(&self, _operation: OperationId) -> bool {
        false
    }
}

/// In-process transport holding the most recent snapshot
#[derive(Debug)]
pub struct MemoryTransport {
    package: String,
    stored: Mutex<Option<Vec<u8>>>,
    next_failure: Mutex<Option<TransportError>>,
    sends: AtomicUsize,
}

impl MemoryTransport {
    /// Empty store for `package`
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            stored: Mutex::new(None),
            next_failure: Mutex::new(None),
            sends: AtomicUsize::new(0),
        }
    }

    /// Store pre-seeded with a backup
    pub fn with_data(package: impl Into<String>, data: Vec<u8>) -> Self {
        let transport = Self::new(package);
        *transport.stored.lock() = Some(data);
        transport
    }

    /// Fail the next send or fetch with `err`
    pub fn fail_next(&self, err: TransportError) {
        *self.next_failure.lock() = Some(err);
    }

    /// Most recently stored snapshot
    pub fn stored(&self) -> Option<Vec<u8>> {
        self.stored.lock().clone()
    }

    /// Number of successful sends
    pub fn send_count(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> Result<(), TransportError> {
        match self.next_failure.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BackupTransport for MemoryTransport {
    async fn send(&self, ctx: &OperationContext, snapshot: Vec<u8>) -> Result<(), TransportError> {
        if ctx.is_cancelled() {
            return Err(TransportError::Aborted);
        }
        self.take_failure()?;

        let size = snapshot.len();
        *self.stored.lock() = Some(snapshot);
        self.sends.fetch_add(1, Ordering::SeqCst);
        ctx.report_progress(1, 1, Some(&self.package));

        debug!(operation_id = %ctx.id(), size = size, "Stored snapshot in memory");
        Ok(())
    }

    async fn fetch(&self, ctx: &OperationContext) -> Result<RestoredPayload, TransportError> {
        if ctx.is_cancelled() {
            return Err(TransportError::Aborted);
        }
        self.take_failure()?;

        Ok(self
            .stored()
            .map(|data| RestoredPayload::single(self.package.clone(), data))
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationKind;

    #[test]
    fn test_payload_helpers() {
        assert!(RestoredPayload::empty().is_empty());

        let payload = RestoredPayload::single("prefs", b"hello".to_vec());
        assert!(!payload.is_empty());
        assert_eq!(payload.total_bytes(), 5);
        assert_eq!(payload.packages[0].name, "prefs");
    }

    #[tokio::test]
    async fn test_memory_send_then_fetch() {
        let transport = MemoryTransport::new("prefs");
        let ctx = OperationContext::detached(OperationKind::Backup);

        transport.send(&ctx, b"snapshot".to_vec()).await.unwrap();
        assert_eq!(transport.send_count(), 1);

        let ctx = OperationContext::detached(OperationKind::Restore);
        let payload = transport.fetch(&ctx).await.unwrap();
        assert_eq!(payload, RestoredPayload::single("prefs", b"snapshot".to_vec()));
    }

    #[tokio::test]
    async fn test_memory_fetch_empty() {
        let transport = MemoryTransport::new("prefs");
        let ctx = OperationContext::detached(OperationKind::Restore);
        assert!(transport.fetch(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_fail_next_once() {
        let transport = MemoryTransport::with_data("prefs", b"old".to_vec());
        transport.fail_next(TransportError::Unavailable("offline".into()));
        let ctx = OperationContext::detached(OperationKind::Backup);

        let err = transport.send(&ctx, b"new".to_vec()).await.unwrap_err();
        assert_eq!(err, TransportError::Unavailable("offline".into()));
        assert_eq!(transport.stored(), Some(b"old".to_vec()));

        transport.send(&ctx, b"new".to_vec()).await.unwrap();
        assert_eq!(transport.stored(), Some(b"new".to_vec()));
    }

    #[tokio::test]
    async fn test_memory_respects_cancellation() {
        let transport = MemoryTransport::new("prefs");
        let ctx = OperationContext::detached(OperationKind::Backup);
        ctx.cancel();

        let err = transport.send(&ctx, b"data".to_vec()).await.unwrap_err();
        assert_eq!(err, TransportError::Aborted);
        assert_eq!(transport.send_count(), 0);
        assert!(!transport.abort(ctx.id()));
    }
}
