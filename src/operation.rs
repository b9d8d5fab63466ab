//! Operation data structures

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

/// Unique identifier of a backup or restore operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What an operation does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Backup,
    Restore,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Backup => f.write_str("backup"),
            OperationKind::Restore => f.write_str("restore"),
        }
    }
}

/// Lifecycle state of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl OperationState {
    /// Pending or running
    pub fn is_active(self) -> bool {
        matches!(self, OperationState::Pending | OperationState::Running)
    }

    /// Succeeded, failed or cancelled
    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: OperationState) -> bool {
        use OperationState::*;
        match (self, next) {
            (Pending, Running) => true,
            // Pending may fail directly when the watchdog fires before the driver starts
            (Pending, Failed) | (Pending, Cancelled) => true,
            (Running, Succeeded) | (Running, Failed) | (Running, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationState::Pending => "pending",
            OperationState::Running => "running",
            OperationState::Succeeded => "succeeded",
            OperationState::Failed => "failed",
            OperationState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Details of a successful operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutcome {
    /// Restore found nothing to restore
    pub no_data: bool,
    /// Backup skipped because nothing changed since the last one
    pub up_to_date: bool,
    /// Packages sent or applied
    pub packages: usize,
    /// Payload bytes sent or applied
    pub bytes: u64,
    /// Restored data was fetched but could not be applied
    pub apply_failed: Option<String>,
}

impl OperationOutcome {
    /// Outcome of a restore that found no backup data
    pub fn no_data() -> Self {
        Self {
            no_data: true,
            ..Self::default()
        }
    }

    /// Outcome of a backup skipped on a clean tracker
    pub fn up_to_date() -> Self {
        Self {
            up_to_date: true,
            ..Self::default()
        }
    }

    /// Outcome of a single transferred payload
    pub fn transferred(bytes: u64) -> Self {
        Self {
            packages: 1,
            bytes,
            ..Self::default()
        }
    }
}

/// A single backup or restore attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique identifier
    pub id: OperationId,
    /// Backup or restore
    pub kind: OperationKind,
    /// Current lifecycle state
    pub state: OperationState,
    /// Coordinator generation that accepted this operation
    pub generation: u64,
    /// When the request was accepted
    pub started_at: DateTime<Utc>,
    /// When a terminal state was reached
    pub ended_at: Option<DateTime<Utc>>,
    /// Failure classification, set when failed
    pub error: Option<ErrorKind>,
    /// Success details, set when succeeded
    pub outcome: Option<OperationOutcome>,
}

impl Operation {
    /// Create a pending operation
    pub fn new(kind: OperationKind, generation: u64) -> Self {
        Self {
            id: OperationId::new(),
            kind,
            state: OperationState::Pending,
            generation,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
            outcome: None,
        }
    }

    /// Move to `next` if the transition is legal. Returns whether it moved.
    pub fn transition(&mut self, next: OperationState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        true
    }

    /// Enter a terminal state with its details
    pub fn finish(
        &mut self,
        terminal: OperationState,
        outcome: Option<OperationOutcome>,
        error: Option<ErrorKind>,
    ) -> bool {
        if !terminal.is_terminal() || !self.transition(terminal) {
            return false;
        }
        self.outcome = outcome;
        self.error = error;
        true
    }

    /// Whether the operation is still pending or running
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Whether a subscriber should retry this operation
    pub fn should_retry(&self) -> bool {
        match self.state {
            OperationState::Failed => self.error.as_ref().map_or(true, ErrorKind::is_retryable),
            OperationState::Succeeded => self
                .outcome
                .as_ref()
                .map_or(false, |o| o.apply_failed.is_some()),
            _ => false,
        }
    }

    /// Wall-clock time from acceptance to terminal state
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }

    /// Short human-readable description
    pub fn summary(&self) -> String {
        match (&self.state, &self.error, &self.outcome) {
            (OperationState::Failed, Some(err), _) if err.is_timeout() => {
                format!("{} timed out", self.kind)
            }
            (OperationState::Failed, Some(ErrorKind::Transport(e)), _) => {
                format!("{} failed: {}", self.kind, e)
            }
            (OperationState::Succeeded, _, Some(o)) if o.no_data => {
                format!("{} found no data", self.kind)
            }
            (OperationState::Succeeded, _, Some(o)) if o.up_to_date => {
                format!("{} skipped, already up to date", self.kind)
            }
            (OperationState::Succeeded, _, Some(o)) if o.apply_failed.is_some() => {
                format!("{} fetched {} bytes but apply failed", self.kind, o.bytes)
            }
            (OperationState::Succeeded, _, Some(o)) => {
                format!("{} of {} bytes succeeded", self.kind, o.bytes)
            }
            (state, _, _) => format!("{} {}", self.kind, state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[test]
    fn test_new_operation_is_pending() {
        let op = Operation::new(OperationKind::Backup, 1);
        assert_eq!(op.state, OperationState::Pending);
        assert!(op.is_active());
        assert!(op.ended_at.is_none());
        assert!(op.duration().is_none());
    }

    #[test]
    fn test_legal_lifecycle() {
        let mut op = Operation::new(OperationKind::Restore, 1);
        assert!(op.transition(OperationState::Running));
        assert!(op.finish(OperationState::Succeeded, Some(OperationOutcome::no_data()), None));
        assert!(!op.is_active());
        assert!(op.ended_at.is_some());
        assert!(op.duration().is_some());
    }

    #[test]
    fn test_terminal_is_final() {
        let mut op = Operation::new(OperationKind::Backup, 1);
        assert!(op.transition(OperationState::Running));
        assert!(op.finish(OperationState::Cancelled, None, None));

        assert!(!op.transition(OperationState::Running));
        assert!(!op.finish(
            OperationState::Failed,
            None,
            Some(ErrorKind::Transport(TransportError::Timeout)),
        ));
        assert_eq!(op.state, OperationState::Cancelled);
        assert!(op.error.is_none());
    }

    #[test]
    fn test_pending_cannot_succeed() {
        let mut op = Operation::new(OperationKind::Backup, 1);
        assert!(!op.finish(OperationState::Succeeded, None, None));
        assert_eq!(op.state, OperationState::Pending);
    }

    #[test]
    fn test_finish_rejects_active_state() {
        let mut op = Operation::new(OperationKind::Backup, 1);
        assert!(!op.finish(OperationState::Running, None, None));
        assert_eq!(op.state, OperationState::Pending);
    }

    #[test]
    fn test_should_retry() {
        let mut failed = Operation::new(OperationKind::Backup, 1);
        failed.transition(OperationState::Running);
        failed.finish(
            OperationState::Failed,
            None,
            Some(ErrorKind::Transport(TransportError::Unavailable("offline".into()))),
        );
        assert!(failed.should_retry());

        let mut partial = Operation::new(OperationKind::Restore, 2);
        partial.transition(OperationState::Running);
        partial.finish(
            OperationState::Succeeded,
            Some(OperationOutcome {
                apply_failed: Some("corrupt".into()),
                ..OperationOutcome::default()
            }),
            None,
        );
        assert!(partial.should_retry());

        let mut done = Operation::new(OperationKind::Restore, 3);
        done.transition(OperationState::Running);
        done.finish(OperationState::Succeeded, Some(OperationOutcome::no_data()), None);
        assert!(!done.should_retry());
    }

    #[test]
    fn test_summary() {
        let mut op = Operation::new(OperationKind::Backup, 1);
        assert_eq!(op.summary(), "backup pending");

        op.transition(OperationState::Running);
        op.finish(
            OperationState::Failed,
            None,
            Some(ErrorKind::Transport(TransportError::Timeout)),
        );
        assert_eq!(op.summary(), "backup timed out");

        let mut restore = Operation::new(OperationKind::Restore, 2);
        restore.transition(OperationState::Running);
        restore.finish(OperationState::Succeeded, Some(OperationOutcome::no_data()), None);
        assert_eq!(restore.summary(), "restore found no data");
    }

    #[test]
    fn test_operation_serialization() {
        let mut op = Operation::new(OperationKind::Restore, 7);
        op.transition(OperationState::Running);
        op.finish(OperationState::Succeeded, Some(OperationOutcome::transferred(42)), None);

        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"restore\""));
        let parsed: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, op);
    }
}
