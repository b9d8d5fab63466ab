//! Operation coordinator - single-flight backup and restore
//!
//! One mutex guards the change tracker, the active operation, the retained
//! history and the generation counter. Every transition and every lifecycle
//! event is produced under it. Snapshot capture, transport calls and aborts
//! run outside it, so host code never stalls another caller. Results arriving
//! for a generation that is no longer active are discarded.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::{EventFilter, EventStage, ObserverBus, OperationEvent, Subscription};
use crate::change_tracker::{ChangeState, ChangeTracker};
use crate::error::{BackupError, ErrorKind, TransportError};
use crate::operation::{Operation, OperationId, OperationKind, OperationOutcome, OperationState};
use crate::snapshot::SnapshotProvider;
use crate::transport::{BackupTransport, RestoredPayload};

/// Configuration for the operation coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Operations still unfinished after this long fail with a timeout
    pub operation_timeout: Duration,
    /// Maximum number of finished operations to retain
    pub history_limit: usize,
    /// Finished operations are dropped after this long
    pub retention: Duration,
    /// `on_foreground` backs up dirty state
    pub foreground_backup: bool,
    /// `on_background` backs up dirty state
    pub background_backup: bool,
    /// Quiet period after the last change before `on_foreground` backs up
    pub debounce: Duration,
    /// Backups of clean state succeed without calling the transport
    pub skip_clean_backups: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
            history_limit: 32,
            retention: Duration::from_secs(600),
            foreground_backup: true,
            background_backup: false,
            debounce: Duration::from_millis(500),
            skip_clean_backups: false,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_background_backup(mut self, enabled: bool) -> Self {
        self.background_backup = enabled;
        self
    }

    pub fn with_foreground_backup(mut self, enabled: bool) -> Self {
        self.foreground_backup = enabled;
        self
    }

    pub fn with_skip_clean_backups(mut self, enabled: bool) -> Self {
        self.skip_clean_backups = enabled;
        self
    }
}

/// Per-call view of an operation, handed to the transport
#[derive(Clone)]
pub struct OperationContext {
    id: OperationId,
    kind: OperationKind,
    generation: u64,
    cancel: Arc<AtomicBool>,
    shared: Option<Arc<Shared>>,
}

impl OperationContext {
    /// Context not bound to any coordinator, for driving a transport directly
    pub fn detached(kind: OperationKind) -> Self {
        Self {
            id: OperationId::new(),
            kind,
            generation: 0,
            cancel: Arc::new(AtomicBool::new(false)),
            shared: None,
        }
    }

    /// Operation this call belongs to
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Backup or restore
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Cancelled or timed out; the transport should stop at its next safe point
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Publish a progress event. Returns false once the operation is no longer running.
    pub fn report_progress(&self, current: u32, total: u32, label: Option<&str>) -> bool {
        match &self.shared {
            Some(shared) => shared.progress(self.generation, current, total, label),
            None => !self.is_cancelled(),
        }
    }

    /// Flag the call as cancelled, for contexts driven outside a coordinator
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("generation", &self.generation)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Caller's handle on an accepted operation
#[derive(Debug, Clone)]
pub struct OperationHandle {
    id: OperationId,
    kind: OperationKind,
    done: watch::Receiver<Option<Operation>>,
}

impl OperationHandle {
    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Terminal operation, or `None` while still pending or running
    pub fn finished(&self) -> Option<Operation> {
        self.done.borrow().clone()
    }

    /// Wait for the operation to reach a terminal state
    pub async fn wait(&mut self) -> Result<Operation, BackupError> {
        let id = self.id;
        let done = self
            .done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| BackupError::Abandoned(id))?;
        done.clone().ok_or(BackupError::Abandoned(id))
    }
}

struct ActiveOperation {
    operation: Operation,
    cancel: Arc<AtomicBool>,
    done: watch::Sender<Option<Operation>>,
    captured_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct CoordinatorState {
    tracker: ChangeTracker,
    active: Option<ActiveOperation>,
    history: VecDeque<Operation>,
    generation: u64,
}

impl CoordinatorState {
    fn active_for(&mut self, generation: u64) -> Option<&mut ActiveOperation> {
        self.active
            .as_mut()
            .filter(|active| active.operation.generation == generation)
    }

    fn prune_history(&mut self, config: &CoordinatorConfig) {
        let cutoff = chrono::Duration::from_std(config.retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        if let Some(cutoff) = cutoff {
            self.history
                .retain(|op| op.ended_at.map_or(true, |ended| ended >= cutoff));
        }

        while self.history.len() > config.history_limit {
            if let Some(dropped) = self.history.pop_front() {
                debug!(operation_id = %dropped.id, "Dropped retained operation");
            }
        }
    }
}

enum Launch {
    Capture,
    Fetch,
    Skip,
}

enum Terminal {
    Succeeded(OperationOutcome),
    Failed(ErrorKind),
    Cancelled,
}

pub(crate) struct Shared {
    config: CoordinatorConfig,
    state: Mutex<CoordinatorState>,
    bus: ObserverBus,
    transport: Arc<dyn BackupTransport>,
    snapshot: Arc<dyn SnapshotProvider>,
}

impl Shared {
    fn publish(&self, operation: &Operation, stage: EventStage) {
        self.bus
            .publish(OperationEvent::new(operation.id, operation.kind, stage));
    }

    /// Pending -> Running
    fn begin(&self, ctx: &OperationContext) -> Option<Launch> {
        let mut state = self.state.lock();
        let skip = self.config.skip_clean_backups && !state.tracker.is_dirty();
        let active = state.active_for(ctx.generation)?;
        if ctx.is_cancelled() || !active.operation.transition(OperationState::Running) {
            return None;
        }

        let launch = match ctx.kind {
            OperationKind::Backup if skip => Launch::Skip,
            OperationKind::Backup => Launch::Capture,
            OperationKind::Restore => Launch::Fetch,
        };
        self.publish(&active.operation, EventStage::Running);

        debug!(operation_id = %ctx.id, kind = %ctx.kind, "Operation running");
        Some(launch)
    }

    /// Capture the snapshot without holding the lock.
    ///
    /// The capture time is taken before `capture()` runs, so a change landing
    /// mid-capture keeps the tracker dirty.
    fn capture(&self, ctx: &OperationContext) -> Option<Vec<u8>> {
        let at = Utc::now();
        let snapshot = self.snapshot.capture();

        let mut state = self.state.lock();
        let active = state.active_for(ctx.generation)?;
        if ctx.is_cancelled() || active.operation.state != OperationState::Running {
            return None;
        }
        active.captured_at = Some(at);
        Some(snapshot)
    }

    fn progress(&self, generation: u64, current: u32, total: u32, label: Option<&str>) -> bool {
        let mut state = self.state.lock();
        let Some(active) = state.active_for(generation) else {
            return false;
        };
        if active.operation.state != OperationState::Running {
            return false;
        }
        self.publish(
            &active.operation,
            EventStage::Progress {
                current,
                total,
                label: label.map(str::to_owned),
            },
        );
        true
    }

    fn apply_restored(
        &self,
        ctx: &OperationContext,
        payload: RestoredPayload,
    ) -> OperationOutcome {
        if payload.is_empty() {
            info!(operation_id = %ctx.id, "Restore found no data");
            return OperationOutcome::no_data();
        }

        let total = payload.packages.len() as u32;
        ctx.report_progress(0, total, None);

        let mut outcome = OperationOutcome::default();
        for (index, package) in payload.packages.into_iter().enumerate() {
            let current = index as u32 + 1;
            if ctx.is_cancelled() || !ctx.report_progress(current, total, Some(&package.name)) {
                debug!(operation_id = %ctx.id, "Restore no longer active, stop applying");
                break;
            }
            match self.snapshot.apply(&package.data) {
                Ok(()) => {
                    outcome.packages += 1;
                    outcome.bytes += package.data.len() as u64;
                }
                Err(err) => {
                    warn!(
                        operation_id = %ctx.id,
                        package = %package.name,
                        error = %err,
                        "Failed to apply restored package"
                    );
                    outcome.apply_failed = Some(err.to_string());
                    break;
                }
            }
        }
        outcome
    }

    fn complete(&self, ctx: &OperationContext, result: Result<OperationOutcome, TransportError>) {
        let mut state = self.state.lock();
        let Some(active) = state.active_for(ctx.generation) else {
            debug!(operation_id = %ctx.id, "Discarding late transport result");
            return;
        };
        let captured_at = active.captured_at;

        match result {
            Ok(outcome) => {
                if let Some(at) = captured_at {
                    if !state.tracker.mark_backed_up(at) {
                        info!(operation_id = %ctx.id, "Backup superseded by a newer change");
                    }
                }
                self.finish(&mut state, Terminal::Succeeded(outcome));
            }
            Err(err) => {
                warn!(operation_id = %ctx.id, kind = %ctx.kind, error = %err, "Transport failed");
                self.finish(&mut state, Terminal::Failed(ErrorKind::Transport(err)));
            }
        }
    }

    fn expire(&self, generation: u64) {
        let mut state = self.state.lock();
        let Some(active) = state.active_for(generation) else {
            return;
        };
        active.cancel.store(true, Ordering::SeqCst);
        let id = active.operation.id;

        warn!(
            operation_id = %id,
            timeout = ?self.config.operation_timeout,
            "Operation timed out"
        );
        let timeout = ErrorKind::Transport(TransportError::Timeout);
        if self.finish(&mut state, Terminal::Failed(timeout)).is_none() {
            return;
        }
        drop(state);

        let aborted = self.transport.abort(id);
        debug!(operation_id = %id, aborted = aborted, "Aborted timed out transport call");
    }

    fn finish(&self, state: &mut CoordinatorState, terminal: Terminal) -> Option<Operation> {
        let mut active = state.active.take()?;

        let (moved, stage) = match terminal {
            Terminal::Succeeded(outcome) => (
                active
                    .operation
                    .finish(OperationState::Succeeded, Some(outcome.clone()), None),
                EventStage::Succeeded(outcome),
            ),
            Terminal::Failed(error) => (
                active
                    .operation
                    .finish(OperationState::Failed, None, Some(error.clone())),
                EventStage::Failed(error),
            ),
            Terminal::Cancelled => (
                active.operation.finish(OperationState::Cancelled, None, None),
                EventStage::Cancelled,
            ),
        };
        if !moved {
            warn!(
                operation_id = %active.operation.id,
                state = %active.operation.state,
                "Rejected illegal terminal transition"
            );
            state.active = Some(active);
            return None;
        }

        self.publish(&active.operation, stage);
        active.done.send_replace(Some(active.operation.clone()));

        let operation = active.operation;
        info!(
            operation_id = %operation.id,
            kind = %operation.kind,
            state = %operation.state,
            summary = %operation.summary(),
            "Operation finished"
        );

        state.history.push_back(operation.clone());
        state.prune_history(&self.config);
        Some(operation)
    }

    async fn drive(self: Arc<Self>, ctx: OperationContext) {
        let Some(launch) = self.begin(&ctx) else {
            debug!(operation_id = %ctx.id, "Operation ended before it started running");
            return;
        };

        let result = match launch {
            Launch::Skip => Ok(OperationOutcome::up_to_date()),
            Launch::Capture => {
                let Some(snapshot) = self.capture(&ctx) else {
                    debug!(operation_id = %ctx.id, "Backup ended during snapshot capture");
                    return;
                };
                let bytes = snapshot.len() as u64;
                self.transport
                    .send(&ctx, snapshot)
                    .await
                    .map(|()| OperationOutcome::transferred(bytes))
            }
            Launch::Fetch => match self.transport.fetch(&ctx).await {
                Ok(payload) => Ok(self.apply_restored(&ctx, payload)),
                Err(err) => Err(err),
            },
        };

        self.complete(&ctx, result);
    }

    async fn watchdog(
        self: Arc<Self>,
        generation: u64,
        mut done: watch::Receiver<Option<Operation>>,
    ) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.operation_timeout) => self.expire(generation),
            _ = done.wait_for(Option::is_some) => {}
        }
    }
}

/// Enforces at most one pending or running backup/restore
#[derive(Clone)]
pub struct OperationCoordinator {
    shared: Arc<Shared>,
}

impl OperationCoordinator {
    /// Create a coordinator with its own observer bus
    pub fn new(
        config: CoordinatorConfig,
        transport: Arc<dyn BackupTransport>,
        snapshot: Arc<dyn SnapshotProvider>,
    ) -> Self {
        Self::with_bus(config, transport, snapshot, ObserverBus::new())
    }

    /// Create a coordinator publishing on an existing bus
    pub fn with_bus(
        config: CoordinatorConfig,
        transport: Arc<dyn BackupTransport>,
        snapshot: Arc<dyn SnapshotProvider>,
        bus: ObserverBus,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(CoordinatorState::default()),
                bus,
                transport,
                snapshot,
            }),
        }
    }

    /// Start a backup. Must be called from within a Tokio runtime.
    pub fn request_backup(&self) -> Result<OperationHandle, BackupError> {
        self.request(OperationKind::Backup)
    }

    /// Start a restore. Must be called from within a Tokio runtime.
    pub fn request_restore(&self) -> Result<OperationHandle, BackupError> {
        self.request(OperationKind::Restore)
    }

    /// Cancel the operation behind `handle`
    pub fn cancel(&self, handle: &OperationHandle) -> Result<Operation, BackupError> {
        self.cancel_operation(handle.id())
    }

    /// Cancel a pending or running operation.
    ///
    /// The transport is asked to abort; whatever it returns later is discarded.
    pub fn cancel_operation(&self, id: OperationId) -> Result<Operation, BackupError> {
        let cancelled = {
            let mut state = self.shared.state.lock();

            let Some(active) = state.active.as_ref().filter(|a| a.operation.id == id) else {
                return if state.history.iter().any(|op| op.id == id) {
                    Err(BackupError::NotActive(id))
                } else {
                    Err(BackupError::NotFound(id))
                };
            };
            active.cancel.store(true, Ordering::SeqCst);
            info!(operation_id = %id, "Cancelling operation");

            self.shared
                .finish(&mut state, Terminal::Cancelled)
                .ok_or(BackupError::NotActive(id))?
        };

        let aborted = self.shared.transport.abort(id);
        debug!(operation_id = %id, aborted = aborted, "Aborted cancelled transport call");
        Ok(cancelled)
    }

    /// Record a local change now
    pub fn mark_changed(&self) {
        self.shared.state.lock().tracker.mark_changed();
    }

    /// Record a local change at `at`
    pub fn mark_changed_at(&self, at: DateTime<Utc>) {
        self.shared.state.lock().tracker.mark_changed_at(at);
    }

    /// Whether local state needs a backup
    pub fn is_dirty(&self) -> bool {
        self.shared.state.lock().tracker.is_dirty()
    }

    /// Copy of the change tracking state
    pub fn change_state(&self) -> ChangeState {
        self.shared.state.lock().tracker.state().clone()
    }

    /// The pending or running operation, if any
    pub fn active(&self) -> Option<Operation> {
        self.shared
            .state
            .lock()
            .active
            .as_ref()
            .map(|active| active.operation.clone())
    }

    /// No operation pending or running
    pub fn is_idle(&self) -> bool {
        self.shared.state.lock().active.is_none()
    }

    /// Look up an active or retained operation
    pub fn operation(&self, id: OperationId) -> Option<Operation> {
        let state = self.shared.state.lock();
        state
            .active
            .as_ref()
            .map(|active| &active.operation)
            .filter(|op| op.id == id)
            .or_else(|| state.history.iter().find(|op| op.id == id))
            .cloned()
    }

    /// Retained finished operations, oldest first
    pub fn history(&self) -> Vec<Operation> {
        self.shared.state.lock().history.iter().cloned().collect()
    }

    /// Lifecycle event bus
    pub fn bus(&self) -> &ObserverBus {
        &self.shared.bus
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.shared.bus.subscribe(filter)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    /// Host came to the foreground: back up dirty, settled state when enabled
    pub fn on_foreground(&self) -> Option<OperationHandle> {
        if !self.shared.config.foreground_backup {
            return None;
        }

        {
            let state = self.shared.state.lock();
            if state.active.is_some() || !state.tracker.is_dirty() {
                return None;
            }
            if !state.tracker.is_settled(Utc::now(), self.shared.config.debounce) {
                debug!("Changes still settling, deferring foreground backup");
                return None;
            }
        }

        match self.request_backup() {
            Ok(handle) => Some(handle),
            Err(err) => {
                debug!(error = %err, "Foreground backup not started");
                None
            }
        }
    }

    /// Host went to the background: drop transient listeners, back up when enabled
    pub fn on_background(&self) -> Option<OperationHandle> {
        let removed = self.shared.bus.unsubscribe_transient();
        info!(removed = removed, "Entered background");

        if !self.shared.config.background_backup || !self.is_dirty() {
            return None;
        }
        match self.request_backup() {
            Ok(handle) => Some(handle),
            Err(err) => {
                debug!(error = %err, "Background backup not started");
                None
            }
        }
    }

    fn request(&self, kind: OperationKind) -> Result<OperationHandle, BackupError> {
        let runtime = Handle::try_current().map_err(|_| BackupError::NoRuntime)?;

        let (handle, ctx, done) = {
            let mut state = self.shared.state.lock();
            if let Some(active) = &state.active {
                warn!(
                    requested = %kind,
                    active_id = %active.operation.id,
                    active_kind = %active.operation.kind,
                    "Rejected conflicting request"
                );
                return Err(BackupError::Conflict {
                    active: active.operation.id,
                    active_kind: active.operation.kind,
                });
            }

            state.prune_history(&self.shared.config);
            state.generation += 1;
            let operation = Operation::new(kind, state.generation);
            let cancel = Arc::new(AtomicBool::new(false));
            let (done_tx, done_rx) = watch::channel(None);

            self.shared.publish(&operation, EventStage::Pending);

            let handle = OperationHandle {
                id: operation.id,
                kind,
                done: done_rx.clone(),
            };
            let ctx = OperationContext {
                id: operation.id,
                kind,
                generation: operation.generation,
                cancel: Arc::clone(&cancel),
                shared: Some(Arc::clone(&self.shared)),
            };
            state.active = Some(ActiveOperation {
                operation,
                cancel,
                done: done_tx,
                captured_at: None,
            });
            (handle, ctx, done_rx)
        };

        info!(operation_id = %handle.id, kind = %kind, "Accepted operation");

        runtime.spawn(Arc::clone(&self.shared).watchdog(ctx.generation, done));
        runtime.spawn(Arc::clone(&self.shared).drive(ctx));
        Ok(handle)
    }
}

impl fmt::Debug for OperationCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationCoordinator")
            .field("config", &self.shared.config)
            .field("active", &self.active())
            .field("bus", &self.shared.bus)
            .finish()
    }
}
