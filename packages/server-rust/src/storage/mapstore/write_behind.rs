//! Write-behind queue: pending backend mutations, coalesced per key.
//!
//! Each key holds at most one entry. A newer mutation replaces the pending
//! one in place and takes a fresh sequence number. Entries are indexed by
//! `(due_time, sequence)` so the flush scheduler drains only what is due.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use harbor_core::Value;

use super::config::{DueTimePolicy, RetryConfig};

/// Pending backend mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOperation {
    Store(Value),
    Delete,
}

/// One coalesced queue entry.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteBehindEntry {
    pub key: String,
    pub operation: WriteOperation,
    /// Strictly increasing per map; orders entries within a flush batch.
    pub sequence: u64,
    /// Millis since epoch at which the entry becomes eligible for flushing.
    pub due_time: i64,
    /// Version of the in-memory record this entry was created from.
    pub record_version: u64,
    /// Failed flush attempts so far.
    pub attempts: u32,
}

impl WriteBehindEntry {
    #[must_use]
    pub fn is_delete(&self) -> bool {
        matches!(self.operation, WriteOperation::Delete)
    }
}

/// Shared sequence source for one map.
///
/// Every record store of the map draws from the same counter so that
/// sequence numbers stay monotonic across partition ownership changes.
#[derive(Debug, Default)]
pub struct SequenceGenerator(AtomicU64);

impl SequenceGenerator {
    /// Returns the next sequence number, starting at 1.
    pub fn next_sequence(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Per-record-store write-behind queue.
///
/// Not internally synchronized; the owning record store guards it with a
/// mutex that is never held across an await point.
#[derive(Debug)]
pub struct WriteBehindQueue {
    entries: HashMap<String, WriteBehindEntry>,
    due_index: BTreeMap<(i64, u64), String>,
    write_delay_millis: i64,
    policy: DueTimePolicy,
    sequencer: Arc<SequenceGenerator>,
}

impl WriteBehindQueue {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(write_delay: Duration, policy: DueTimePolicy, sequencer: Arc<SequenceGenerator>) -> Self {
        Self {
            entries: HashMap::new(),
            due_index: BTreeMap::new(),
            write_delay_millis: write_delay.as_millis() as i64,
            policy,
            sequencer,
        }
    }

    /// Queues a store. Returns `true` if the key had no pending entry.
    pub fn enqueue_store(&mut self, key: &str, value: Value, record_version: u64, now: i64) -> bool {
        self.enqueue(key, WriteOperation::Store(value), record_version, now)
    }

    /// Queues a delete. Returns `true` if the key had no pending entry.
    pub fn enqueue_delete(&mut self, key: &str, record_version: u64, now: i64) -> bool {
        self.enqueue(key, WriteOperation::Delete, record_version, now)
    }

    fn enqueue(&mut self, key: &str, operation: WriteOperation, record_version: u64, now: i64) -> bool {
        let sequence = self.sequencer.next_sequence();
        let fresh_due = now.saturating_add(self.write_delay_millis);

        let (due_time, is_new) = match self.entries.remove(key) {
            Some(prev) => {
                self.due_index.remove(&(prev.due_time, prev.sequence));
                let due = match self.policy {
                    DueTimePolicy::KeepOriginal => prev.due_time,
                    DueTimePolicy::Refresh => fresh_due,
                };
                (due, false)
            }
            None => (fresh_due, true),
        };

        self.insert(WriteBehindEntry {
            key: key.to_string(),
            operation,
            sequence,
            due_time,
            record_version,
            attempts: 0,
        });
        is_new
    }

    fn insert(&mut self, entry: WriteBehindEntry) {
        self.due_index
            .insert((entry.due_time, entry.sequence), entry.key.clone());
        self.entries.insert(entry.key.clone(), entry);
    }

    /// Removes and returns every entry with `due_time <= now`, ordered by
    /// sequence.
    pub fn drain_due(&mut self, now: i64) -> Vec<WriteBehindEntry> {
        let not_due = self.due_index.split_off(&(now.saturating_add(1), 0));
        let due = std::mem::replace(&mut self.due_index, not_due);
        self.take_sorted(due.into_values())
    }

    /// Removes and returns every entry regardless of due time, ordered by
    /// sequence.
    pub fn drain_all(&mut self) -> Vec<WriteBehindEntry> {
        let all = std::mem::take(&mut self.due_index);
        self.take_sorted(all.into_values())
    }

    fn take_sorted(&mut self, keys: impl Iterator<Item = String>) -> Vec<WriteBehindEntry> {
        let mut drained: Vec<WriteBehindEntry> =
            keys.filter_map(|k| self.entries.remove(&k)).collect();
        drained.sort_by_key(|e| e.sequence);
        drained
    }

    /// Puts entries of a failed flush back with exponential backoff.
    ///
    /// An entry whose key was mutated again while the flush was in flight is
    /// dropped: the newer pending entry supersedes it. Returns the number of
    /// dropped entries.
    pub fn requeue_failed(&mut self, failed: Vec<WriteBehindEntry>, now: i64, retry: &RetryConfig) -> usize {
        let mut superseded = 0;
        for mut entry in failed {
            if self.entries.contains_key(&entry.key) {
                superseded += 1;
                continue;
            }
            let backoff = i64::try_from(retry.backoff(entry.attempts).as_millis()).unwrap_or(i64::MAX);
            entry.due_time = now.saturating_add(backoff);
            entry.attempts = entry.attempts.saturating_add(1);
            self.insert(entry);
        }
        superseded
    }

    /// The pending entry for a key, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&WriteBehindEntry> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Whether the key has a pending delete.
    #[must_use]
    pub fn has_pending_delete(&self, key: &str) -> bool {
        self.entries.get(key).is_some_and(WriteBehindEntry::is_delete)
    }

    /// Earliest due time among pending entries.
    #[must_use]
    pub fn next_due_time(&self) -> Option<i64> {
        self.due_index.keys().next().map(|(due, _)| *due)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Discards every pending entry. Returns how many were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        self.due_index.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn queue(delay_secs: u64, policy: DueTimePolicy) -> WriteBehindQueue {
        WriteBehindQueue::new(
            Duration::from_secs(delay_secs),
            policy,
            Arc::new(SequenceGenerator::default()),
        )
    }

    #[test]
    fn entries_become_due_after_write_delay() {
        let mut q = queue(5, DueTimePolicy::KeepOriginal);
        assert!(q.enqueue_store("a", Value::Int(1), 1, 1_000));

        assert!(q.drain_due(5_999).is_empty());
        let due = q.drain_due(6_000);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key, "a");
        assert!(q.is_empty());
    }

    #[test]
    fn replacement_coalesces_and_keeps_original_due_time() {
        let mut q = queue(5, DueTimePolicy::KeepOriginal);
        assert!(q.enqueue_store("a", Value::Int(1), 1, 1_000));
        assert!(!q.enqueue_store("a", Value::Int(2), 2, 4_000));
        assert_eq!(q.len(), 1);

        let due = q.drain_due(6_000);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].operation, WriteOperation::Store(Value::Int(2)));
        assert_eq!(due[0].record_version, 2);
    }

    #[test]
    fn refresh_policy_restarts_the_delay() {
        let mut q = queue(5, DueTimePolicy::Refresh);
        q.enqueue_store("a", Value::Int(1), 1, 1_000);
        q.enqueue_store("a", Value::Int(2), 2, 4_000);

        assert!(q.drain_due(6_000).is_empty());
        assert_eq!(q.drain_due(9_000).len(), 1);
    }

    #[test]
    fn delete_replaces_pending_store() {
        let mut q = queue(1, DueTimePolicy::KeepOriginal);
        q.enqueue_store("a", Value::Int(1), 1, 0);
        assert!(!q.enqueue_delete("a", 1, 10));
        assert!(q.has_pending_delete("a"));

        let all = q.drain_all();
        assert_eq!(all.len(), 1);
        assert!(all[0].is_delete());
    }

    #[test]
    fn drained_entries_are_ordered_by_sequence() {
        let mut q = queue(0, DueTimePolicy::Refresh);
        q.enqueue_store("b", Value::Int(1), 1, 100);
        q.enqueue_store("a", Value::Int(1), 1, 50);
        q.enqueue_store("c", Value::Int(1), 1, 75);

        let keys: Vec<String> = q.drain_all().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn requeue_applies_backoff_and_counts_attempts() {
        let mut q = queue(1, DueTimePolicy::KeepOriginal);
        q.enqueue_store("a", Value::Int(1), 1, 0);
        let failed = q.drain_all();

        let retry = RetryConfig::default();
        assert_eq!(q.requeue_failed(failed, 10_000, &retry), 0);
        let entry = q.get("a").unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.due_time, 11_000);

        let failed = q.drain_all();
        q.requeue_failed(failed, 20_000, &retry);
        assert_eq!(q.get("a").unwrap().due_time, 22_000);
        assert_eq!(q.next_due_time(), Some(22_000));
    }

    #[test]
    fn requeue_skips_keys_with_newer_entries() {
        let mut q = queue(1, DueTimePolicy::KeepOriginal);
        q.enqueue_store("a", Value::Int(1), 1, 0);
        let failed = q.drain_all();

        q.enqueue_store("a", Value::Int(2), 2, 500);
        assert_eq!(q.requeue_failed(failed, 1_000, &RetryConfig::default()), 1);
        assert_eq!(q.len(), 1);
        assert_eq!(
            q.get("a").unwrap().operation,
            WriteOperation::Store(Value::Int(2))
        );
    }

    #[test]
    fn shared_sequencer_is_monotonic_across_queues() {
        let seq = Arc::new(SequenceGenerator::default());
        let mut q1 = WriteBehindQueue::new(Duration::ZERO, DueTimePolicy::KeepOriginal, Arc::clone(&seq));
        let mut q2 = WriteBehindQueue::new(Duration::ZERO, DueTimePolicy::KeepOriginal, Arc::clone(&seq));
        q1.enqueue_store("a", Value::Null, 1, 0);
        q2.enqueue_store("b", Value::Null, 1, 0);

        let s1 = q1.drain_all()[0].sequence;
        let s2 = q2.drain_all()[0].sequence;
        assert!(s2 > s1);
    }

    #[test]
    fn clear_reports_discarded_entries() {
        let mut q = queue(1, DueTimePolicy::KeepOriginal);
        q.enqueue_store("a", Value::Null, 1, 0);
        q.enqueue_delete("b", 1, 0);
        assert_eq!(q.clear(), 2);
        assert!(q.is_empty());
        assert_eq!(q.next_due_time(), None);
    }

    proptest! {
        /// Whatever the mutation interleaving, the queue holds one entry per
        /// key and that entry carries the last operation.
        #[test]
        fn one_entry_per_key_with_last_operation(
            ops in prop::collection::vec((0u8..5, any::<bool>(), 0i64..10_000), 1..200)
        ) {
            let mut q = queue(3, DueTimePolicy::KeepOriginal);
            let mut last: HashMap<String, bool> = HashMap::new();
            let mut now = 0;
            for (k, is_delete, dt) in ops {
                now += dt;
                let key = format!("k{k}");
                if is_delete {
                    q.enqueue_delete(&key, 1, now);
                } else {
                    q.enqueue_store(&key, Value::Int(now), 1, now);
                }
                last.insert(key, is_delete);
            }

            prop_assert_eq!(q.len(), last.len());
            let drained = q.drain_all();
            prop_assert_eq!(drained.len(), last.len());
            for pair in drained.windows(2) {
                prop_assert!(pair[0].sequence < pair[1].sequence);
            }
            for entry in drained {
                prop_assert_eq!(entry.is_delete(), last[&entry.key]);
            }
        }
    }
}
