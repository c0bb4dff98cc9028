use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::poll::PollResult;

/// Bookkeeping for one blocked task.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockedRecord {
    pub task_id: String,
    pub last_result: PollResult,
    pub retry_count: u32,
    pub blocked_at: DateTime<Utc>,
}

/// Thread-safe registry of blocked tasks. A passive data structure: the
/// scheduler drives every update and reads results back explicitly.
#[derive(Debug, Default)]
pub struct BlockedTracker {
    records: Mutex<HashMap<String, BlockedRecord>>,
}

impl BlockedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a block. The first block of a task sets retry_count to 0;
    /// each repeat increments it. Returns the updated record.
    pub fn block(&self, task_id: &str, result: PollResult) -> BlockedRecord {
        let mut records = self.records.lock().expect("tracker mutex poisoned");
        let record = records
            .entry(task_id.to_string())
            .and_modify(|r| {
                r.retry_count += 1;
                r.last_result = result.clone();
            })
            .or_insert_with(|| BlockedRecord {
                task_id: task_id.to_string(),
                last_result: result,
                retry_count: 0,
                blocked_at: Utc::now(),
            });
        record.clone()
    }

    /// Remove a task from the registry; returns its record if present.
    pub fn unblock(&self, task_id: &str) -> Option<BlockedRecord> {
        self.records
            .lock()
            .expect("tracker mutex poisoned")
            .remove(task_id)
    }

    pub fn get(&self, task_id: &str) -> Option<BlockedRecord> {
        self.records
            .lock()
            .expect("tracker mutex poisoned")
            .get(task_id)
            .cloned()
    }

    /// All records, sorted by task id for stable iteration.
    pub fn all(&self) -> Vec<BlockedRecord> {
        let records = self.records.lock().expect("tracker mutex poisoned");
        let mut out: Vec<BlockedRecord> = records.values().cloned().collect();
        out.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        out
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("tracker mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the registry, returning every record. Used on cancellation,
    /// where drained tasks must not escalate.
    pub fn drain(&self) -> Vec<BlockedRecord> {
        let mut records = self.records.lock().expect("tracker mutex poisoned");
        let mut out: Vec<BlockedRecord> = records.drain().map(|(_, r)| r).collect();
        out.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::PollResult;

    fn need_info(reason: &str) -> PollResult {
        PollResult::need_info(reason, vec![])
    }

    #[test]
    fn first_block_sets_zero_retries() {
        let tracker = BlockedTracker::new();
        let record = tracker.block("t1", need_info("waiting"));
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.task_id, "t1");
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn repeat_blocks_increment_retries() {
        let tracker = BlockedTracker::new();
        tracker.block("t1", need_info("first"));
        tracker.block("t1", need_info("second"));
        let record = tracker.block("t1", need_info("third"));
        assert_eq!(record.retry_count, 2);
        assert_eq!(record.last_result.reason, "third");
    }

    #[test]
    fn blocked_at_survives_repeat_blocks() {
        let tracker = BlockedTracker::new();
        let first = tracker.block("t1", need_info("first"));
        let second = tracker.block("t1", need_info("second"));
        assert_eq!(first.blocked_at, second.blocked_at);
    }

    #[test]
    fn unblock_removes_record() {
        let tracker = BlockedTracker::new();
        tracker.block("t1", need_info("waiting"));
        let record = tracker.unblock("t1").unwrap();
        assert_eq!(record.task_id, "t1");
        assert!(tracker.get("t1").is_none());
        assert!(tracker.unblock("t1").is_none());
    }

    #[test]
    fn all_sorted_by_task_id() {
        let tracker = BlockedTracker::new();
        tracker.block("zeta", need_info("z"));
        tracker.block("alpha", need_info("a"));
        let ids: Vec<String> = tracker.all().into_iter().map(|r| r.task_id).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }

    #[test]
    fn drain_empties_registry() {
        let tracker = BlockedTracker::new();
        tracker.block("a", need_info("a"));
        tracker.block("b", need_info("b"));
        let drained = tracker.drain();
        assert_eq!(drained.len(), 2);
        assert!(tracker.is_empty());
    }

    #[test]
    fn shared_across_threads() {
        use std::sync::Arc;

        let tracker = Arc::new(BlockedTracker::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let tracker = Arc::clone(&tracker);
            handles.push(std::thread::spawn(move || {
                tracker.block(&format!("t{}", i % 4), need_info("contended"));
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.len(), 4);
    }
}
