//! Sync status snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use metapm_storage::{FailureRecord, PendingOperation};

/// Point-in-time view of the sync layer, for status indicators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_online: bool,
    /// A pass is currently running.
    pub syncing: bool,
    /// Unsynced queue entries, including stuck ones.
    pub pending: u64,
    pub stuck: u64,
    pub last_sync: Option<DateTime<Utc>>,
}

impl SyncStatus {
    /// Human-readable one-line summary.
    pub fn summary(&self) -> String {
        let connectivity = if self.is_online { "online" } else { "offline" };
        let mut line = format!("{}, {} pending", connectivity, self.pending);
        if self.stuck > 0 {
            line.push_str(&format!(" ({} stuck)", self.stuck));
        }
        if self.syncing {
            line.push_str(", syncing");
        }
        match self.last_sync {
            Some(ts) => line.push_str(&format!(", last sync {}", ts.to_rfc3339())),
            None => line.push_str(", never synced"),
        }
        line
    }

    /// True when nothing is waiting to be pushed.
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && !self.syncing
    }
}

/// An unsynced queue entry that reached the attempt limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckOperation {
    pub operation: PendingOperation,
    pub failure: FailureRecord,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(pending: u64, stuck: u64, syncing: bool) -> SyncStatus {
        SyncStatus {
            is_online: true,
            syncing,
            pending,
            stuck,
            last_sync: None,
        }
    }

    #[test]
    fn test_summary() {
        assert_eq!(status(0, 0, false).summary(), "online, 0 pending, never synced");
        assert_eq!(
            status(3, 1, true).summary(),
            "online, 3 pending (1 stuck), syncing, never synced"
        );
    }

    #[test]
    fn test_idle() {
        assert!(status(0, 0, false).is_idle());
        assert!(!status(0, 0, true).is_idle());
        assert!(!status(2, 0, false).is_idle());
    }
}
