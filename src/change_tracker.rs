//! Local change tracking

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether local state changed since the last successful backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeState {
    /// Changes exist that no backup has captured
    pub dirty: bool,
    /// Most recent change
    pub last_changed_at: Option<DateTime<Utc>>,
    /// Capture time of the most recent successful backup
    pub last_backed_up_at: Option<DateTime<Utc>>,
    /// Changes folded into the current dirty flag
    pub pending_changes: u64,
}

impl Default for ChangeState {
    fn default() -> Self {
        // Never backed up: nothing is known to be safe yet
        Self {
            dirty: true,
            last_changed_at: None,
            last_backed_up_at: None,
            pending_changes: 0,
        }
    }
}

/// Tracks changes between backups
#[derive(Debug, Clone, Default)]
pub struct ChangeTracker {
    state: ChangeState,
}

impl ChangeTracker {
    /// Create a tracker that has never seen a backup
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change now
    pub fn mark_changed(&mut self) {
        self.mark_changed_at(Utc::now());
    }

    /// Record a change at `at`.
    ///
    /// Successive changes collapse into the single dirty flag. The latest
    /// change time never moves backwards.
    pub fn mark_changed_at(&mut self, at: DateTime<Utc>) {
        self.state.dirty = true;
        self.state.pending_changes += 1;
        self.state.last_changed_at = Some(match self.state.last_changed_at {
            Some(prev) if prev > at => prev,
            _ => at,
        });
    }

    /// Whether a backup is needed
    pub fn is_dirty(&self) -> bool {
        self.state.dirty
    }

    /// Record a successful backup of state captured at `at`.
    ///
    /// A change stamped after `at` raced the backup, so the flag stays set.
    /// Returns whether the dirty flag was cleared.
    pub fn mark_backed_up(&mut self, at: DateTime<Utc>) -> bool {
        self.state.last_backed_up_at = Some(match self.state.last_backed_up_at {
            Some(prev) if prev > at => prev,
            _ => at,
        });

        let superseded = matches!(self.state.last_changed_at, Some(changed) if changed > at);
        if superseded {
            return false;
        }

        self.state.dirty = false;
        self.state.pending_changes = 0;
        true
    }

    /// No change happened within `quiet` before `now`
    pub fn is_settled(&self, now: DateTime<Utc>, quiet: Duration) -> bool {
        let Some(changed) = self.state.last_changed_at else {
            return true;
        };
        match chrono::Duration::from_std(quiet) {
            Ok(quiet) => now - changed >= quiet,
            Err(_) => false,
        }
    }

    /// Number of changes since the flag was last cleared
    pub fn pending_changes(&self) -> u64 {
        self.state.pending_changes
    }

    /// Current state
    pub fn state(&self) -> &ChangeState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    // === Creation Tests ===

    #[test]
    fn test_new_tracker_is_dirty() {
        let tracker = ChangeTracker::new();
        assert!(tracker.is_dirty());
        assert!(tracker.state().last_backed_up_at.is_none());
        assert!(tracker.state().last_changed_at.is_none());
        assert_eq!(tracker.pending_changes(), 0);
    }

    #[test]
    fn test_first_backup_cleans_untouched_tracker() {
        let mut tracker = ChangeTracker::new();
        assert!(tracker.mark_backed_up(ts(0)));
        assert!(!tracker.is_dirty());
        assert_eq!(tracker.state().last_backed_up_at, Some(ts(0)));
    }

    // === Change Tests ===

    #[test]
    fn test_mark_changed_sets_dirty() {
        let mut tracker = ChangeTracker::new();
        tracker.mark_backed_up(ts(0));

        tracker.mark_changed_at(ts(5));
        assert!(tracker.is_dirty());
        assert_eq!(tracker.state().last_changed_at, Some(ts(5)));
    }

    #[test]
    fn test_rapid_changes_collapse() {
        let mut tracker = ChangeTracker::new();
        for i in 0..10 {
            tracker.mark_changed_at(ts(i));
        }
        assert!(tracker.is_dirty());
        assert_eq!(tracker.pending_changes(), 10);
        assert_eq!(tracker.state().last_changed_at, Some(ts(9)));
    }

    #[test]
    fn test_change_time_is_monotonic() {
        let mut tracker = ChangeTracker::new();
        tracker.mark_changed_at(ts(10));
        tracker.mark_changed_at(ts(3));
        assert_eq!(tracker.state().last_changed_at, Some(ts(10)));
    }

    #[test]
    fn test_mark_changed_uses_now() {
        let before = Utc::now();
        let mut tracker = ChangeTracker::new();
        tracker.mark_changed();
        let changed = tracker.state().last_changed_at.unwrap();
        assert!(changed >= before);
    }

    // === Backup Tests ===

    #[test]
    fn test_backup_after_changes_clears() {
        let mut tracker = ChangeTracker::new();
        tracker.mark_changed_at(ts(1));
        tracker.mark_changed_at(ts(2));

        assert!(tracker.mark_backed_up(ts(2)));
        assert!(!tracker.is_dirty());
        assert_eq!(tracker.pending_changes(), 0);

        tracker.mark_changed_at(ts(3));
        assert!(tracker.mark_backed_up(ts(10)));
        assert!(!tracker.is_dirty());
    }

    #[test]
    fn test_change_racing_backup_keeps_dirty() {
        let mut tracker = ChangeTracker::new();
        tracker.mark_changed_at(ts(1));
        // Edit lands while a backup captured at ts(2) is in flight
        tracker.mark_changed_at(ts(3));

        assert!(!tracker.mark_backed_up(ts(2)));
        assert!(tracker.is_dirty());
        assert_eq!(tracker.state().last_backed_up_at, Some(ts(2)));
        assert_eq!(tracker.pending_changes(), 2);
    }

    #[test]
    fn test_change_after_backup_is_dirty() {
        let mut tracker = ChangeTracker::new();
        tracker.mark_changed_at(ts(1));
        tracker.mark_backed_up(ts(2));
        tracker.mark_changed_at(ts(4));
        assert!(tracker.is_dirty());
        assert_eq!(tracker.pending_changes(), 1);
    }

    #[test]
    fn test_backup_time_never_regresses() {
        let mut tracker = ChangeTracker::new();
        tracker.mark_backed_up(ts(10));
        tracker.mark_backed_up(ts(5));
        assert_eq!(tracker.state().last_backed_up_at, Some(ts(10)));
    }

    // === Debounce Tests ===

    #[test]
    fn test_settled_without_changes() {
        let tracker = ChangeTracker::new();
        assert!(tracker.is_settled(ts(0), Duration::from_secs(60)));
    }

    #[test]
    fn test_settled_after_quiet_period() {
        let mut tracker = ChangeTracker::new();
        tracker.mark_changed_at(ts(0));

        assert!(!tracker.is_settled(ts(1), Duration::from_secs(2)));
        assert!(tracker.is_settled(ts(2), Duration::from_secs(2)));
        assert!(tracker.is_settled(ts(0), Duration::ZERO));
    }

    // === State Tests ===

    #[test]
    fn test_state_serialization() {
        let mut tracker = ChangeTracker::new();
        tracker.mark_changed_at(ts(1));
        tracker.mark_backed_up(ts(1));

        let json = serde_json::to_string(tracker.state()).unwrap();
        let parsed: ChangeState = serde_json::from_str(&json).unwrap();
        assert_eq!(&parsed, tracker.state());
    }
}
