//! Per-flow tracking tables
//!
//! Every queue owns one table keyed by a header-hash flow key. A key lives
//! in exactly one table at any instant; moving flows between two queues'
//! tables holds both table locks, taken in ascending queue-index order so a
//! concurrent reverse migration cannot deadlock and no lookup ever observes
//! a flow as present in neither or both tables.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;

/// Flow identifier derived from a packet-header hash
pub type FlowKey = u32;

/// Derive the flow key from a frame, folding the header hash the way the
/// device RSS hash is folded
pub fn flow_key_for(frame: &[u8]) -> FlowKey {
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in frame.iter().take(64) {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash % 0xFFFF
}

/// Per-flow counters and ownership
#[derive(Debug, Clone)]
pub struct FlowEntry {
    pub queue_id: usize,
    pub packets: u64,
    pub bytes: u64,
    pub last_seen: Instant,
    latency_sum_ns: u64,
    latency_samples: u64,
}

impl FlowEntry {
    pub fn avg_latency_ns(&self) -> u64 {
        if self.latency_samples == 0 {
            0
        } else {
            self.latency_sum_ns / self.latency_samples
        }
    }
}

/// One queue's flow table
pub struct FlowTable {
    inner: Mutex<HashMap<FlowKey, FlowEntry>>,
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Find-or-create the entry for `key` and account one packet
    pub fn record(&self, key: FlowKey, queue_id: usize, bytes: usize, latency_ns: u64) {
        let mut table = self.inner.lock();
        let entry = table.entry(key).or_insert_with(|| FlowEntry {
            queue_id,
            packets: 0,
            bytes: 0,
            last_seen: Instant::now(),
            latency_sum_ns: 0,
            latency_samples: 0,
        });
        entry.packets += 1;
        entry.bytes += bytes as u64;
        entry.last_seen = Instant::now();
        entry.latency_sum_ns += latency_ns;
        entry.latency_samples += 1;
    }

    pub fn lookup(&self, key: FlowKey) -> Option<FlowEntry> {
        self.inner.lock().get(&key).cloned()
    }

    pub fn contains(&self, key: FlowKey) -> bool {
        self.inner.lock().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Drop every entry; only queue teardown prunes flows, idle flows are
    /// otherwise retained indefinitely
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn snapshot(&self) -> Vec<(FlowKey, FlowEntry)> {
        self.inner
            .lock()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }
}

/// Move every flow from `src` to `dst`, reassigning ownership.
///
/// Both locks are held for the whole move, acquired in ascending queue-index
/// order. Returns the number of flows moved.
pub fn migrate_all(src: &FlowTable, src_id: usize, dst: &FlowTable, dst_id: usize) -> usize {
    debug_assert_ne!(src_id, dst_id);

    let (mut src_guard, mut dst_guard) = if src_id < dst_id {
        let s = src.inner.lock();
        let d = dst.inner.lock();
        (s, d)
    } else {
        let d = dst.inner.lock();
        let s = src.inner.lock();
        (s, d)
    };

    let moved = src_guard.len();
    for (key, mut entry) in src_guard.drain() {
        entry.queue_id = dst_id;
        dst_guard.insert(key, entry);
    }
    moved
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_record_and_lookup() {
        let table = FlowTable::new();
        table.record(7, 0, 1500, 250);
        table.record(7, 0, 500, 150);

        let entry = table.lookup(7).unwrap();
        assert_eq!(entry.queue_id, 0);
        assert_eq!(entry.packets, 2);
        assert_eq!(entry.bytes, 2000);
        assert_eq!(entry.avg_latency_ns(), 200);
        assert!(table.lookup(8).is_none());
    }

    #[test]
    fn test_migrate_reassigns_ownership() {
        let a = FlowTable::new();
        let b = FlowTable::new();
        a.record(1, 0, 100, 0);
        a.record(2, 0, 100, 0);
        b.record(3, 1, 100, 0);

        let moved = migrate_all(&a, 0, &b, 1);
        assert_eq!(moved, 2);
        assert!(a.is_empty());
        assert_eq!(b.len(), 3);
        assert_eq!(b.lookup(1).unwrap().queue_id, 1);
        assert_eq!(b.lookup(2).unwrap().queue_id, 1);
    }

    #[test]
    fn test_concurrent_reverse_migrations_do_not_deadlock() {
        let a = Arc::new(FlowTable::new());
        let b = Arc::new(FlowTable::new());
        for key in 0..64 {
            a.record(key, 0, 10, 0);
            b.record(key + 1000, 1, 10, 0);
        }

        let (a2, b2) = (a.clone(), b.clone());
        let fwd = thread::spawn(move || {
            for _ in 0..100 {
                migrate_all(&a2, 0, &b2, 1);
            }
        });
        let (a3, b3) = (a.clone(), b.clone());
        let rev = thread::spawn(move || {
            for _ in 0..100 {
                migrate_all(&b3, 1, &a3, 0);
            }
        });
        fwd.join().unwrap();
        rev.join().unwrap();

        // Nothing lost and nothing duplicated
        assert_eq!(a.len() + b.len(), 128);
    }

    #[test]
    fn test_flow_key_is_stable_and_bounded() {
        let frame = vec![0xAAu8; 80];
        let key = flow_key_for(&frame);
        assert_eq!(key, flow_key_for(&frame));
        assert!(key < 0xFFFF);
    }
}
