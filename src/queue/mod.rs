//! Multi-queue packet channels with locality placement and flow tracking
//!
//! A `NicQueue` owns one descriptor ring, its locality and CPU binding, its
//! statistics, and its flow table. Ring access and the counter updates that
//! must stay consistent with ring state share one lock; everything else is
//! atomics or the flow table's own lock.

use crate::dma::{build_segments, Direction, PayloadHandle, PoolSet, Segment};
use crate::flow::{FlowKey, FlowTable};
use crate::ring::{Completion, DescFlags, DescRing, RingSlot};
use crate::{Error, Result};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Queue lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Active,
    Draining,
    Failed,
}

/// Per-queue counters, cache-line padded to keep hot queues off each
/// other's lines
#[derive(Debug, Default)]
pub struct QueueStats {
    pub rx_packets: AtomicU64,
    pub tx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub rx_errors: AtomicU64,
    pub tx_errors: AtomicU64,
    pub rx_dropped: AtomicU64,
    pub tx_dropped: AtomicU64,
}

/// Point-in-time view of one queue, consumed by telemetry
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStatsSnapshot {
    pub id: usize,
    pub numa_node: usize,
    pub cpu_id: usize,
    pub state: &'static str,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    pub in_flight: usize,
    pub coalesce_usecs: u64,
}

/// One send/receive channel
pub struct NicQueue {
    id: usize,
    numa_node: usize,
    cpu_id: AtomicUsize,
    state: Mutex<QueueState>,
    ring: Mutex<DescRing>,
    in_flight: AtomicUsize,
    coalesce_usecs: AtomicU64,
    stats: CachePadded<QueueStats>,
    flows: FlowTable,
    pools: Arc<PoolSet>,
}

impl NicQueue {
    pub fn new(
        id: usize,
        numa_node: usize,
        cpu_id: usize,
        ring_size: usize,
        coalesce_usecs: u64,
        pools: Arc<PoolSet>,
    ) -> Self {
        Self {
            id,
            numa_node,
            cpu_id: AtomicUsize::new(cpu_id),
            state: Mutex::new(QueueState::Active),
            ring: Mutex::new(DescRing::new(ring_size)),
            in_flight: AtomicUsize::new(0),
            coalesce_usecs: AtomicU64::new(coalesce_usecs),
            stats: CachePadded::new(QueueStats::default()),
            flows: FlowTable::new(),
            pools,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn numa_node(&self) -> usize {
        self.numa_node
    }

    pub fn cpu_id(&self) -> usize {
        self.cpu_id.load(Ordering::Relaxed)
    }

    /// Rebind the queue to another execution context
    pub fn bind_cpu(&self, cpu: usize) {
        self.cpu_id.store(cpu, Ordering::Relaxed);
    }

    pub fn state(&self) -> QueueState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: QueueState) {
        *self.state.lock() = state;
    }

    pub fn is_active(&self) -> bool {
        self.state() == QueueState::Active
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn coalesce_usecs(&self) -> u64 {
        self.coalesce_usecs.load(Ordering::Relaxed)
    }

    pub fn set_coalesce_usecs(&self, usecs: u64) {
        self.coalesce_usecs.store(usecs, Ordering::Relaxed);
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    pub fn flows(&self) -> &FlowTable {
        &self.flows
    }

    pub fn ring_capacity(&self) -> usize {
        self.ring.lock().capacity()
    }

    /// Submit one packet's segment list to the ring and track its flow.
    ///
    /// Fails with `ResourceExhausted` when the ring has no free descriptor;
    /// the payload is reclaimed and the caller drops or retries, nothing is
    /// queued internally.
    pub fn enqueue(
        &self,
        segments: Vec<Segment>,
        payload: PayloadHandle,
        key: FlowKey,
    ) -> Result<()> {
        if self.state() != QueueState::Active {
            self.stats.tx_dropped.fetch_add(1, Ordering::Relaxed);
            self.pools.reclaim(payload);
            return Err(Error::QueueError(format!("queue {} not active", self.id)));
        }

        let bytes = payload.len();
        let start = Instant::now();

        let rejected = {
            let mut ring = self.ring.lock();
            match ring.submit(RingSlot {
                segments,
                payload,
                direction: Direction::ToDevice,
                flags: DescFlags::for_direction(Direction::ToDevice),
            }) {
                Ok(()) => {
                    self.in_flight.fetch_add(1, Ordering::Relaxed);
                    self.stats.tx_packets.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .tx_bytes
                        .fetch_add(bytes as u64, Ordering::Relaxed);
                    // Submission kicks the device; suppress notifications
                    // until a poll run starves
                    ring.disable_notify();
                    None
                }
                Err(slot) => Some(slot.payload),
            }
        };

        if let Some(payload) = rejected {
            self.stats.tx_dropped.fetch_add(1, Ordering::Relaxed);
            self.pools.reclaim(payload);
            return Err(Error::ResourceExhausted(format!(
                "queue {} ring full",
                self.id
            )));
        }

        self.flows
            .record(key, self.id, bytes, start.elapsed().as_nanos() as u64);
        Ok(())
    }

    /// Retrieve one completed transfer, oldest first. Receive counters are
    /// updated in the same critical section as the ring operation.
    pub fn dequeue(&self) -> Option<Completion> {
        let mut ring = self.ring.lock();
        let completion = ring.reap()?;
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        if completion.direction == Direction::FromDevice {
            self.stats.rx_packets.fetch_add(1, Ordering::Relaxed);
            self.stats
                .rx_bytes
                .fetch_add(completion.len as u64, Ordering::Relaxed);
        }
        Some(completion)
    }

    /// Drain up to `budget` completions, delivering received frames through
    /// `on_rx` and returning buffers to their owners.
    ///
    /// Re-arms device notifications when the budget is not exhausted (work
    /// starved first); otherwise notifications stay suppressed and the
    /// caller is expected to poll again.
    pub fn poll<F: FnMut(&[u8])>(&self, budget: usize, mut on_rx: F) -> usize {
        let mut work_done = 0;
        while work_done < budget {
            let completion = match self.dequeue() {
                Some(c) => c,
                None => break,
            };
            if completion.direction == Direction::FromDevice {
                on_rx(&completion.payload.data()[..completion.len]);
            }
            self.pools.reclaim(completion.payload);
            work_done += 1;
        }

        if work_done < budget {
            self.ring.lock().enable_notify();
        }
        work_done
    }

    /// Device side: consume up to `n` pending transmissions
    pub fn complete_tx(&self, n: usize) -> usize {
        self.ring.lock().complete(n)
    }

    /// Device side: deposit one received frame into a pool buffer.
    ///
    /// Frames arriving on a non-active queue or past the ring capacity are
    /// dropped and counted.
    pub fn device_receive(&self, frame: &[u8]) -> Result<()> {
        if self.state() != QueueState::Active {
            self.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
            return Err(Error::QueueError(format!("queue {} not active", self.id)));
        }

        let mut buf = match self
            .pools
            .acquire(self.numa_node, frame.len(), Direction::FromDevice)
        {
            Ok(buf) => buf,
            Err(e) => {
                self.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        buf.data_mut().copy_from_slice(frame);

        let len = frame.len();
        let rejected = {
            let mut ring = self.ring.lock();
            match ring.push_used(Completion {
                payload: PayloadHandle::Pooled(buf),
                len,
                direction: Direction::FromDevice,
                flags: DescFlags::for_direction(Direction::FromDevice) | DescFlags::USED,
            }) {
                Ok(()) => {
                    self.in_flight.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Err(completion) => Some(completion.payload),
            }
        };

        if let Some(payload) = rejected {
            self.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
            self.pools.reclaim(payload);
            return Err(Error::ResourceExhausted(format!(
                "queue {} ring full",
                self.id
            )));
        }
        Ok(())
    }

    /// Notification state, read by the device side to decide whether to
    /// signal completions
    pub fn notify_enabled(&self) -> bool {
        self.ring.lock().notify_enabled()
    }

    /// Force-complete and discard every in-flight transfer, then mark the
    /// queue failed. In-flight reaches zero before the transition.
    pub fn drain_to_failed(&self) {
        self.set_state(QueueState::Draining);

        for completion in self.drain_ring() {
            if completion.direction == Direction::FromDevice {
                self.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
            }
            self.pools.reclaim(completion.payload);
        }

        self.set_state(QueueState::Failed);
    }

    /// Release every ring-held buffer and prune the flow table
    pub fn teardown(&self) {
        for completion in self.drain_ring() {
            self.pools.reclaim(completion.payload);
        }
        self.flows.clear();
    }

    fn drain_ring(&self) -> Vec<Completion> {
        let mut ring = self.ring.lock();
        ring.complete_all();
        let mut drained = Vec::with_capacity(ring.used_len());
        while let Some(completion) = ring.reap() {
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
            drained.push(completion);
        }
        drained
    }

    /// Zero the error counters (failover resets them post-migration)
    pub fn reset_errors(&self) {
        self.stats.rx_errors.store(0, Ordering::Relaxed);
        self.stats.tx_errors.store(0, Ordering::Relaxed);
    }

    pub fn total_errors(&self) -> u64 {
        self.stats.rx_errors.load(Ordering::Relaxed) + self.stats.tx_errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            id: self.id,
            numa_node: self.numa_node,
            cpu_id: self.cpu_id(),
            state: match self.state() {
                QueueState::Active => "active",
                QueueState::Draining => "draining",
                QueueState::Failed => "failed",
            },
            rx_packets: self.stats.rx_packets.load(Ordering::Relaxed),
            tx_packets: self.stats.tx_packets.load(Ordering::Relaxed),
            rx_bytes: self.stats.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.stats.tx_bytes.load(Ordering::Relaxed),
            rx_errors: self.stats.rx_errors.load(Ordering::Relaxed),
            tx_errors: self.stats.tx_errors.load(Ordering::Relaxed),
            rx_dropped: self.stats.rx_dropped.load(Ordering::Relaxed),
            tx_dropped: self.stats.tx_dropped.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
            coalesce_usecs: self.coalesce_usecs(),
        }
    }
}

/// Build the transmit payload for one frame: a zero-copy mapping of the
/// caller's bytes, or a copy into a pool buffer on the queue's node.
pub fn prepare_tx_payload(
    pools: &PoolSet,
    numa_node: usize,
    frame: Vec<u8>,
    zero_copy: bool,
) -> Result<(Vec<Segment>, PayloadHandle)> {
    if zero_copy {
        let mapped = pools.map_external(frame);
        let segments = build_segments(mapped.iova(), mapped.len());
        Ok((segments, PayloadHandle::External(mapped)))
    } else {
        let mut buf = pools.acquire(numa_node, frame.len(), Direction::ToDevice)?;
        buf.data_mut().copy_from_slice(&frame);
        let segments = build_segments(buf.iova(), buf.size());
        Ok((segments, PayloadHandle::Pooled(buf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_queue(ring_size: usize) -> (Arc<PoolSet>, NicQueue) {
        let pools = Arc::new(PoolSet::new(1, 64, 1024));
        let q = NicQueue::new(0, 0, 0, ring_size, 64, pools.clone());
        (pools, q)
    }

    fn send(q: &NicQueue, pools: &PoolSet, bytes: usize, key: FlowKey) -> Result<()> {
        let (segments, payload) = prepare_tx_payload(pools, q.numa_node(), vec![0u8; bytes], true)?;
        q.enqueue(segments, payload, key)
    }

    #[test]
    fn test_enqueue_updates_flow_and_stats() {
        let (pools, q) = test_queue(16);
        send(&q, &pools, 1000, 5).unwrap();
        send(&q, &pools, 500, 5).unwrap();

        assert_eq!(q.in_flight(), 2);
        assert_eq!(q.stats().tx_packets.load(Ordering::Relaxed), 2);
        assert_eq!(q.stats().tx_bytes.load(Ordering::Relaxed), 1500);
        let flow = q.flows().lookup(5).unwrap();
        assert_eq!(flow.packets, 2);
        assert_eq!(flow.bytes, 1500);
        assert_eq!(flow.queue_id, 0);
    }

    #[test]
    fn test_ring_full_is_busy_and_reclaims() {
        let (pools, q) = test_queue(2);
        send(&q, &pools, 10, 1).unwrap();
        send(&q, &pools, 10, 2).unwrap();
        assert!(matches!(
            send(&q, &pools, 10, 3),
            Err(Error::ResourceExhausted(_))
        ));
        assert_eq!(q.in_flight(), 2);
        assert_eq!(q.stats().tx_dropped.load(Ordering::Relaxed), 1);

        q.teardown();
        assert_eq!(q.in_flight(), 0);
        assert_eq!(pools.outstanding(), 0);
    }

    #[test]
    fn test_poll_rearms_when_starved() {
        let (pools, q) = test_queue(16);
        send(&q, &pools, 100, 1).unwrap();
        send(&q, &pools, 100, 2).unwrap();
        assert!(!q.notify_enabled());

        q.complete_tx(2);
        let done = q.poll(8, |_| {});
        assert_eq!(done, 2);
        // Budget not exhausted: notifications re-armed
        assert!(q.notify_enabled());
        assert_eq!(q.in_flight(), 0);

        // Exact-budget run leaves notifications suppressed
        send(&q, &pools, 100, 3).unwrap();
        q.complete_tx(1);
        let done = q.poll(1, |_| {});
        assert_eq!(done, 1);
        assert!(!q.notify_enabled());
    }

    #[test]
    fn test_device_receive_delivers_frame() {
        let (pools, q) = test_queue(16);
        q.device_receive(&[1, 2, 3, 4]).unwrap();
        assert_eq!(q.in_flight(), 1);

        let mut received = Vec::new();
        q.poll(8, |frame| received.push(frame.to_vec()));
        assert_eq!(received, vec![vec![1, 2, 3, 4]]);
        assert_eq!(q.stats().rx_packets.load(Ordering::Relaxed), 1);
        assert_eq!(q.stats().rx_bytes.load(Ordering::Relaxed), 4);
        assert_eq!(pools.outstanding(), 0);
    }

    #[test]
    fn test_in_flight_bounded_by_ring_capacity() {
        let (pools, q) = test_queue(4);
        for key in 0..8 {
            let _ = send(&q, &pools, 10, key);
        }
        assert_eq!(q.in_flight(), 4);
        assert!(q.in_flight() <= q.ring_capacity());
    }

    #[test]
    fn test_drain_to_failed_zeroes_in_flight() {
        let (pools, q) = test_queue(16);
        send(&q, &pools, 10, 1).unwrap();
        q.device_receive(&[9, 9]).unwrap();
        assert_eq!(q.in_flight(), 2);

        q.drain_to_failed();
        assert_eq!(q.state(), QueueState::Failed);
        assert_eq!(q.in_flight(), 0);
        assert_eq!(pools.outstanding(), 0);
        // The discarded rx frame is accounted
        assert_eq!(q.stats().rx_dropped.load(Ordering::Relaxed), 1);

        // A failed queue accepts no traffic
        assert!(send(&q, &pools, 10, 2).is_err());
        assert!(q.device_receive(&[1]).is_err());
    }

    #[test]
    fn test_copy_path_uses_pool_buffer() {
        let pools = Arc::new(PoolSet::new(1, 8, 64));
        let q = NicQueue::new(0, 0, 0, 8, 64, pools.clone());
        let (segments, payload) =
            prepare_tx_payload(&pools, 0, vec![7u8; 256], false).unwrap();
        assert!(matches!(payload, PayloadHandle::Pooled(_)));
        assert_eq!(payload.data(), &[7u8; 256][..]);
        q.enqueue(segments, payload, 1).unwrap();
        assert_eq!(pools.outstanding(), 1);

        q.complete_tx(1);
        q.poll(4, |_| {});
        assert_eq!(pools.outstanding(), 0);
    }
}
