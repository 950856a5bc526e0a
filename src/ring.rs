//! Bounded descriptor ring modeling one hardware send/receive channel
//!
//! Submitted descriptors wait in the pending chain until the device side
//! marks them used; `reap` hands completed transfers back to the queue. The
//! ring also carries the notification-suppression flag that the poll path
//! toggles to trade interrupts for batching.

use crate::dma::{Direction, PayloadHandle, Segment};
use std::collections::VecDeque;

bitflags::bitflags! {
    /// Per-descriptor state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u32 {
        /// Device writes into the buffer (receive direction)
        const WRITE = 0x1;
        /// Descriptor has been consumed by the device
        const USED = 0x2;
    }
}

impl DescFlags {
    pub fn for_direction(direction: Direction) -> Self {
        match direction {
            Direction::ToDevice => DescFlags::empty(),
            Direction::FromDevice => DescFlags::WRITE,
        }
    }
}

/// A transfer submitted to the ring, awaiting device completion
pub struct RingSlot {
    pub segments: Vec<Segment>,
    pub payload: PayloadHandle,
    pub direction: Direction,
    pub flags: DescFlags,
}

/// A completed transfer ready for `dequeue`
pub struct Completion {
    pub payload: PayloadHandle,
    pub len: usize,
    pub direction: Direction,
    pub flags: DescFlags,
}

/// One hardware-style ring: a pending chain plus a used chain, with a
/// shared capacity bound across both.
pub struct DescRing {
    capacity: usize,
    pending: VecDeque<RingSlot>,
    used: VecDeque<Completion>,
    notify_enabled: bool,
}

impl DescRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pending: VecDeque::with_capacity(capacity),
            used: VecDeque::with_capacity(capacity),
            notify_enabled: true,
        }
    }

    fn occupied(&self) -> usize {
        self.pending.len() + self.used.len()
    }

    /// Submit one transfer. When no descriptor slot is free the slot is
    /// handed back so the caller can reclaim its payload; the ring never
    /// queues beyond its capacity.
    pub fn submit(&mut self, slot: RingSlot) -> std::result::Result<(), RingSlot> {
        if self.occupied() >= self.capacity {
            return Err(slot);
        }
        self.pending.push_back(slot);
        Ok(())
    }

    /// Device side: mark up to `n` pending descriptors used, in order
    pub fn complete(&mut self, n: usize) -> usize {
        let mut done = 0;
        while done < n {
            match self.pending.pop_front() {
                Some(slot) => {
                    let len = slot.payload.len();
                    self.used.push_back(Completion {
                        payload: slot.payload,
                        len,
                        direction: slot.direction,
                        flags: slot.flags | DescFlags::USED,
                    });
                    done += 1;
                }
                None => break,
            }
        }
        done
    }

    /// Device side: mark every pending descriptor used
    pub fn complete_all(&mut self) -> usize {
        self.complete(usize::MAX)
    }

    /// Device side: deposit an already-completed transfer (the receive
    /// path, where the device fills a posted buffer). Handed back when the
    /// ring is full so the buffer can go back to its pool.
    pub fn push_used(&mut self, completion: Completion) -> std::result::Result<(), Completion> {
        if self.occupied() >= self.capacity {
            return Err(completion);
        }
        self.used.push_back(completion);
        Ok(())
    }

    /// Pop one completed transfer, oldest first
    pub fn reap(&mut self) -> Option<Completion> {
        self.used.pop_front()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn used_len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied() == 0
    }

    pub fn enable_notify(&mut self) {
        self.notify_enabled = true;
    }

    pub fn disable_notify(&mut self) {
        self.notify_enabled = false;
    }

    pub fn notify_enabled(&self) -> bool {
        self.notify_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::PoolSet;

    fn tx_slot(pools: &PoolSet, bytes: usize) -> RingSlot {
        let payload = pools.map_external(vec![0u8; bytes]);
        RingSlot {
            segments: crate::dma::build_segments(payload.iova(), bytes),
            payload: PayloadHandle::External(payload),
            direction: Direction::ToDevice,
            flags: DescFlags::for_direction(Direction::ToDevice),
        }
    }

    #[test]
    fn test_submit_complete_reap() {
        let pools = PoolSet::new(1, 4, 16);
        let mut ring = DescRing::new(8);

        assert!(ring.submit(tx_slot(&pools, 100)).is_ok());
        assert!(ring.submit(tx_slot(&pools, 200)).is_ok());
        assert_eq!(ring.pending_len(), 2);

        assert_eq!(ring.complete(1), 1);
        let c = ring.reap().unwrap();
        assert_eq!(c.len, 100);
        assert_eq!(c.direction, Direction::ToDevice);
        assert!(c.flags.contains(DescFlags::USED));
        pools.reclaim(c.payload);

        assert_eq!(ring.complete_all(), 1);
        pools.reclaim(ring.reap().unwrap().payload);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_capacity_bound_spans_both_chains() {
        let pools = PoolSet::new(1, 8, 64);
        let mut ring = DescRing::new(2);

        assert!(ring.submit(tx_slot(&pools, 10)).is_ok());
        ring.complete_all();
        assert!(ring.submit(tx_slot(&pools, 10)).is_ok());

        // One used + one pending: the ring is full
        let rejected = ring.submit(tx_slot(&pools, 10));
        let slot = rejected.expect_err("ring should be full");
        pools.reclaim(slot.payload);
    }

    #[test]
    fn test_notify_toggle() {
        let mut ring = DescRing::new(4);
        assert!(ring.notify_enabled());
        ring.disable_notify();
        assert!(!ring.notify_enabled());
        ring.enable_notify();
        assert!(ring.notify_enabled());
    }
}
