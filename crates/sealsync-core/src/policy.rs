//! Snapshot policy
//!
//! Decides when the op log has grown enough to be compacted into a
//! snapshot. Either dimension trips it: many tiny ops bound replay cost for
//! new peers, a few huge ops bound local storage growth.

use crate::models::OpStats;

/// Op count since the last snapshot that triggers compaction
pub const SNAPSHOT_OP_THRESHOLD: u64 = 500;

/// Op bytes since the last snapshot that trigger compaction (5 MiB)
pub const SNAPSHOT_BYTE_THRESHOLD: u64 = 5 * 1024 * 1024;

/// Stateless compaction thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotPolicy {
    pub op_threshold: u64,
    pub byte_threshold: u64,
}

impl SnapshotPolicy {
    pub fn new(op_threshold: u64, byte_threshold: u64) -> Self {
        Self {
            op_threshold,
            byte_threshold,
        }
    }

    pub fn should_compact(&self, op_count: u64, op_bytes: u64) -> bool {
        op_count >= self.op_threshold || op_bytes >= self.byte_threshold
    }

    pub fn should_compact_stats(&self, stats: OpStats) -> bool {
        self.should_compact(stats.count, stats.bytes)
    }
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self::new(SNAPSHOT_OP_THRESHOLD, SNAPSHOT_BYTE_THRESHOLD)
    }
}
