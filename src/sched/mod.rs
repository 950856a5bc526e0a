//! Adaptive queue scheduling: load-driven CPU rebinding and interrupt
//! coalescing adjustment
//!
//! The scheduler never moves a queue across locality domains; rebinding
//! picks the next CPU inside the queue's own domain, round-robin per
//! domain. Coalescing is adjusted for all queues at once from the
//! aggregate in-flight load.

use crate::queue::NicQueue;
use crate::topo::Topology;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Aggregate load above which coalescing halves (latency mode)
pub const LOAD_HIGH: usize = 1000;
/// Aggregate load below which coalescing doubles (throughput mode)
pub const LOAD_LOW: usize = 100;

pub struct Scheduler {
    /// Aggregate in-flight level that triggers a rebalance pass
    high_water: usize,
    min_coalesce: u64,
    max_coalesce: u64,
    coalesce_usecs: AtomicU64,
    /// Round-robin CPU cursor per locality domain
    cursors: Mutex<Vec<usize>>,
}

impl Scheduler {
    pub fn new(high_water: usize, coalesce_usecs: u64, min: u64, max: u64, domains: usize) -> Self {
        Self {
            high_water,
            min_coalesce: min,
            max_coalesce: max,
            coalesce_usecs: AtomicU64::new(coalesce_usecs),
            cursors: Mutex::new(vec![0; domains]),
        }
    }

    pub fn coalesce_usecs(&self) -> u64 {
        self.coalesce_usecs.load(Ordering::Relaxed)
    }

    /// Pin every queue's coalescing to an operator-chosen value
    pub fn set_coalesce_usecs(&self, queues: &[Arc<NicQueue>], usecs: u64) {
        let clamped = usecs.clamp(self.min_coalesce, self.max_coalesce);
        self.coalesce_usecs.store(clamped, Ordering::Relaxed);
        for q in queues {
            q.set_coalesce_usecs(clamped);
        }
    }

    /// One rebalance pass. When the aggregate in-flight count exceeds the
    /// high-water mark, queues carrying more than their share of that mark
    /// are rebound to the next CPU of their own domain. Returns how many
    /// queues moved.
    pub fn rebalance(&self, queues: &[Arc<NicQueue>], topo: &Topology) -> usize {
        if queues.is_empty() {
            return 0;
        }
        let total: usize = queues.iter().map(|q| q.in_flight()).sum();
        if total <= self.high_water {
            return 0;
        }

        let per_queue_share = self.high_water / queues.len();
        let mut moved = 0;
        let mut cursors = self.cursors.lock();
        for q in queues.iter().filter(|q| q.is_active()) {
            if q.in_flight() <= per_queue_share {
                continue;
            }
            let domain = match topo.domain(q.numa_node()) {
                Some(d) => d,
                None => continue,
            };
            if domain.cpus.len() < 2 {
                continue;
            }
            let cursor = &mut cursors[domain.id];
            *cursor = (*cursor + 1) % domain.cpus.len();
            let cpu = domain.cpus[*cursor];
            if cpu != q.cpu_id() {
                log::debug!("rebinding queue {} to cpu {}", q.id(), cpu);
                q.bind_cpu(cpu);
                moved += 1;
            }
        }
        moved
    }

    /// One coalescing pass: halve under heavy aggregate load, double under
    /// light load, bounded to the configured window. All queues get the
    /// same value.
    pub fn adjust_coalescing(&self, queues: &[Arc<NicQueue>]) {
        let total: usize = queues.iter().map(|q| q.in_flight()).sum();
        let current = self.coalesce_usecs.load(Ordering::Relaxed);
        let next = if total > LOAD_HIGH {
            (current / 2).max(self.min_coalesce)
        } else if total < LOAD_LOW {
            (current * 2).min(self.max_coalesce)
        } else {
            return;
        };
        if next == current {
            return;
        }
        self.coalesce_usecs.store(next, Ordering::Relaxed);
        log::debug!("coalescing {} -> {} usecs (load {})", current, next, total);
        for q in queues {
            q.set_coalesce_usecs(next);
        }
    }
}
