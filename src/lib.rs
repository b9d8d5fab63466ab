//! # Keepsake
//!
//! Backup coordination core - knows when local state needs a backup and
//! makes sure only one backup or restore runs at a time.
//!
//! This crate provides:
//! - Dirty tracking that survives edits racing an in-flight backup
//! - Single-flight backup/restore with conflict rejection
//! - Timeouts and cooperative cancellation
//! - Lifecycle events delivered off the coordinator's critical section
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │               OperationCoordinator               │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐  │
//! │  │  Pending   │→ │  Running   │→ │ Succeeded/ │  │
//! │  │            │  │            │  │ Failed/... │  │
//! │  └────────────┘  └────────────┘  └────────────┘  │
//! │       │               │               │          │
//! │       ▼               ▼               ▼          │
//! │  ┌────────────────────────────────────────────┐  │
//! │  │               ObserverBus                  │  │
//! │  │   Pending → Running → Progress → Finished  │  │
//! │  └────────────────────────────────────────────┘  │
//! │                       │                          │
//! │  ┌──────────────┐     ▼     ┌─────────────────┐  │
//! │  │ChangeTracker │  Transport│SnapshotProvider │  │
//! │  └──────────────┘           └─────────────────┘  │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use keepsake::{
//!     CoordinatorConfig, EventFilter, MemorySnapshot, MemoryTransport, OperationCoordinator,
//! };
//!
//! let coordinator = OperationCoordinator::new(
//!     CoordinatorConfig::default(),
//!     Arc::new(MemoryTransport::new("prefs")),
//!     Arc::new(MemorySnapshot::default()),
//! );
//! let mut events = coordinator.subscribe(EventFilter::all());
//!
//! // Local state changed
//! coordinator.mark_changed();
//!
//! // Back up; a second request while this runs is rejected
//! let mut handle = coordinator.request_backup()?;
//! let operation = handle.wait().await?;
//!
//! // Restore from the backup store
//! let operation = coordinator.request_restore()?.wait().await?;
//! ```

pub mod bus;
pub mod change_tracker;
pub mod coordinator;
pub mod error;
pub mod operation;
pub mod snapshot;
pub mod storage;
pub mod transport;

pub use bus::{
    EventFilter, EventStage, LifecycleObserver, ObserverBus, OperationEvent, Subscription,
    SubscriptionId,
};
pub use change_tracker::{ChangeState, ChangeTracker};
pub use coordinator::{CoordinatorConfig, OperationContext, OperationCoordinator, OperationHandle};
pub use error::{ApplyError, BackupError, ErrorKind, TransportError};
pub use operation::{Operation, OperationId, OperationKind, OperationOutcome, OperationState};
pub use snapshot::{MemorySnapshot, SnapshotProvider};
pub use storage::{BackupRecord, FileTransport};
pub use transport::{BackupTransport, MemoryTransport, RestoredPackage, RestoredPayload};
