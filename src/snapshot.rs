//! Local state capture and restore

use parking_lot::RwLock;

use crate::error::ApplyError;

/// Bridge to the host's persistence layer
pub trait SnapshotProvider: Send + Sync {
    /// Serialize current local state
    fn capture(&self) -> Vec<u8>;

    /// Replace local state with restored data
    fn apply(&self, data: &[u8]) -> Result<(), ApplyError>;
}

/// Opaque in-memory state buffer
#[derive(Debug, Default)]
pub struct MemorySnapshot {
    data: RwLock<Vec<u8>>,
}

impl MemorySnapshot {
    /// Buffer holding `data`
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Replace the buffer. Callers still report the change to the coordinator.
    pub fn set(&self, data: Vec<u8>) {
        *self.data.write() = data;
    }

    /// Current contents
    pub fn get(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl SnapshotProvider for MemorySnapshot {
    fn capture(&self) -> Vec<u8> {
        self.get()
    }

    fn apply(&self, data: &[u8]) -> Result<(), ApplyError> {
        self.set(data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_reflects_set() {
        let snapshot = MemorySnapshot::new(b"one".to_vec());
        assert_eq!(snapshot.capture(), b"one".to_vec());

        snapshot.set(b"two".to_vec());
        assert_eq!(snapshot.capture(), b"two".to_vec());
    }

    #[test]
    fn test_apply_replaces_contents() {
        let snapshot = MemorySnapshot::default();
        snapshot.apply(b"restored").unwrap();
        assert_eq!(snapshot.get(), b"restored".to_vec());
    }
}
