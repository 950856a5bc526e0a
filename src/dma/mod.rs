//! NUMA-local DMA buffer management with zero-copy payload mapping
//!
//! Each locality domain owns a fixed-capacity pool of buffer slots backed by
//! a page budget. Buffers are pinned and mapped lazily on `acquire` and fully
//! unmapped on `release`; a buffer handle is move-only, so at any instant it
//! is owned by exactly one of the pool, an in-flight transfer, or the caller.

use crate::{Error, Result};
use libc::{c_void, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use nix::unistd::{sysconf, SysconfVar};
use parking_lot::Mutex;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Transfer chunk ceiling for segment lists (64KB, matching device limits)
pub const DMA_CHUNK_SIZE: usize = 64 * 1024;

/// Transfer direction relative to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToDevice,
    FromDevice,
}

/// One device-visible segment of a mapped payload
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub iova: u64,
    pub len: usize,
}

static_assertions::const_assert!(std::mem::size_of::<Segment>() <= 16);

/// Split a contiguous mapping into device-sized segments
pub fn build_segments(iova: u64, len: usize) -> Vec<Segment> {
    let mut segments = Vec::with_capacity(len / DMA_CHUNK_SIZE + 1);
    let mut offset = 0usize;
    while offset < len {
        let chunk = (len - offset).min(DMA_CHUNK_SIZE);
        segments.push(Segment {
            iova: iova + offset as u64,
            len: chunk,
        });
        offset += chunk;
    }
    segments
}

/// Get the system page size
pub fn page_size() -> usize {
    sysconf(SysconfVar::PAGE_SIZE)
        .unwrap_or(Some(4096))
        .unwrap_or(4096) as usize
}

/// A pinned, contiguous run of locality-local pages
pub struct PinnedPages {
    base: *mut u8,
    nr_pages: usize,
    page_size: usize,
}

unsafe impl Send for PinnedPages {}

impl PinnedPages {
    /// Map and pin `nr_pages` pages. On any failure the partial mapping is
    /// torn down before the error is returned.
    pub fn pin(nr_pages: usize, page_size: usize) -> Result<Self> {
        let len = nr_pages * page_size;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == MAP_FAILED {
            return Err(Error::MappingFailure(format!(
                "failed to map {} pages",
                nr_pages
            )));
        }

        // Pinning is best-effort: RLIMIT_MEMLOCK may forbid it in
        // unprivileged environments, and the mapping stays usable either way.
        if unsafe { libc::mlock(ptr, len) } != 0 {
            log::debug!("mlock failed for {} pages, continuing unpinned", nr_pages);
        }

        Ok(Self {
            base: ptr as *mut u8,
            nr_pages,
            page_size,
        })
    }

    pub fn nr_pages(&self) -> usize {
        self.nr_pages
    }

    pub fn len(&self) -> usize {
        self.nr_pages * self.page_size
    }

    pub fn is_empty(&self) -> bool {
        self.nr_pages == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base, self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base, self.len()) }
    }
}

impl Drop for PinnedPages {
    fn drop(&mut self) {
        unsafe {
            libc::munlock(self.base as *mut c_void, self.len());
            libc::munmap(self.base as *mut c_void, self.len());
        }
    }
}

/// A DMA buffer owned by exactly one holder at a time.
///
/// Acquired from a [`BufferPool`]; the handle is move-only, so handing it to
/// an in-flight transfer transfers ownership out of the pool and `release`
/// transfers it back.
pub struct DmaBuffer {
    pages: PinnedPages,
    iova: u64,
    size: usize,
    direction: Direction,
    numa_node: usize,
    slot: usize,
}

impl DmaBuffer {
    pub fn iova(&self) -> u64 {
        self.iova
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn numa_node(&self) -> usize {
        self.numa_node
    }

    /// The requested portion of the backing pages
    pub fn data(&self) -> &[u8] {
        &self.pages.as_slice()[..self.size]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let size = self.size;
        &mut self.pages.as_mut_slice()[..size]
    }
}

/// A caller-supplied payload mapped for zero-copy transmit.
///
/// Owned by the caller side of a transfer, never by a pool; the mapping is
/// dropped on transfer completion or failure.
pub struct MappedPayload {
    data: Vec<u8>,
    iova: u64,
}

impl MappedPayload {
    pub fn iova(&self) -> u64 {
        self.iova
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Payload attached to an in-flight transfer
pub enum PayloadHandle {
    /// A pool-owned DMA buffer, returned to its pool on completion
    Pooled(DmaBuffer),
    /// A zero-copy caller payload, unmapped on completion
    External(MappedPayload),
}

impl PayloadHandle {
    pub fn len(&self) -> usize {
        match self {
            PayloadHandle::Pooled(buf) => buf.size(),
            PayloadHandle::External(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &[u8] {
        match self {
            PayloadHandle::Pooled(buf) => buf.data(),
            PayloadHandle::External(m) => m.data(),
        }
    }
}

/// Per-pool accounting, read by telemetry and leak checks
#[derive(Debug, Default)]
pub struct PoolStats {
    pub acquired: AtomicU64,
    pub released: AtomicU64,
    pub in_use: AtomicUsize,
    pub peak_usage: AtomicUsize,
    pub exhausted: AtomicU64,
}

struct PoolInner {
    slot_used: Vec<bool>,
    pages_avail: usize,
}

/// Fixed-capacity DMA buffer pool for one locality domain
pub struct BufferPool {
    numa_node: usize,
    capacity: usize,
    page_budget: usize,
    page_size: usize,
    inner: Mutex<PoolInner>,
    next_iova: AtomicU64,
    stats: PoolStats,
}

impl BufferPool {
    pub fn new(numa_node: usize, capacity: usize, page_budget: usize) -> Self {
        Self {
            numa_node,
            capacity,
            page_budget,
            page_size: page_size(),
            inner: Mutex::new(PoolInner {
                slot_used: vec![false; capacity],
                pages_avail: page_budget,
            }),
            // High bits tag the locality domain so IOVAs never collide
            next_iova: AtomicU64::new((numa_node as u64) << 48),
            stats: PoolStats::default(),
        }
    }

    /// Acquire a buffer of at least `size` bytes.
    ///
    /// Fails with `ResourceExhausted` when no slot or not enough budgeted
    /// pages are free, and with `MappingFailure` when pinning fails; in both
    /// cases the pool is left exactly as it was.
    pub fn acquire(&self, size: usize, direction: Direction) -> Result<DmaBuffer> {
        let nr_pages = (size + self.page_size - 1) / self.page_size;
        let nr_pages = nr_pages.max(1);

        let slot = {
            let mut inner = self.inner.lock();
            let slot = match inner.slot_used.iter().position(|used| !used) {
                Some(slot) => slot,
                None => {
                    self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                    return Err(Error::ResourceExhausted(format!(
                        "no free buffer slot on node {}",
                        self.numa_node
                    )));
                }
            };
            if inner.pages_avail < nr_pages {
                self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                return Err(Error::ResourceExhausted(format!(
                    "node {} pool has {} pages free, {} needed",
                    self.numa_node, inner.pages_avail, nr_pages
                )));
            }
            inner.slot_used[slot] = true;
            inner.pages_avail -= nr_pages;
            slot
        };

        let pages = match PinnedPages::pin(nr_pages, self.page_size) {
            Ok(pages) => pages,
            Err(e) => {
                // Roll back the reservation so no partial allocation remains
                let mut inner = self.inner.lock();
                inner.slot_used[slot] = false;
                inner.pages_avail += nr_pages;
                return Err(e);
            }
        };

        let iova = self
            .next_iova
            .fetch_add(pages.len() as u64, Ordering::Relaxed);

        self.stats.acquired.fetch_add(1, Ordering::Relaxed);
        let in_use = self.stats.in_use.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats.peak_usage.fetch_max(in_use, Ordering::Relaxed);

        Ok(DmaBuffer {
            pages,
            iova,
            size,
            direction,
            numa_node: self.numa_node,
            slot,
        })
    }

    /// Unmap, unpin, and mark the buffer's slot free for reuse
    pub fn release(&self, buf: DmaBuffer) {
        let nr_pages = buf.pages.nr_pages();
        let slot = buf.slot;
        drop(buf); // munmap/munlock via PinnedPages

        let mut inner = self.inner.lock();
        inner.slot_used[slot] = false;
        inner.pages_avail += nr_pages;
        drop(inner);

        self.stats.released.fetch_add(1, Ordering::Relaxed);
        self.stats.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn numa_node(&self) -> usize {
        self.numa_node
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_slots(&self) -> usize {
        let inner = self.inner.lock();
        inner.slot_used.iter().filter(|used| !**used).count()
    }

    pub fn pages_avail(&self) -> usize {
        self.inner.lock().pages_avail
    }

    pub fn page_budget(&self) -> usize {
        self.page_budget
    }

    pub fn stats(&self) -> PoolStatsView {
        PoolStatsView {
            numa_node: self.numa_node,
            capacity: self.capacity,
            in_use: self.stats.in_use.load(Ordering::Relaxed),
            acquired: self.stats.acquired.load(Ordering::Relaxed),
            released: self.stats.released.load(Ordering::Relaxed),
            peak_usage: self.stats.peak_usage.load(Ordering::Relaxed),
            exhausted: self.stats.exhausted.load(Ordering::Relaxed),
        }
    }
}

/// Pool statistics snapshot
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStatsView {
    pub numa_node: usize,
    pub capacity: usize,
    pub in_use: usize,
    pub acquired: u64,
    pub released: u64,
    pub peak_usage: usize,
    pub exhausted: u64,
}

/// One buffer pool per locality domain, plus the zero-copy mapping space
pub struct PoolSet {
    pools: Vec<BufferPool>,
    external_iova: AtomicU64,
}

impl PoolSet {
    pub fn new(num_nodes: usize, slots_per_node: usize, pages_per_node: usize) -> Self {
        let pools = (0..num_nodes.max(1))
            .map(|node| BufferPool::new(node, slots_per_node, pages_per_node))
            .collect();
        Self {
            pools,
            // External mappings live above every pool's tagged range
            external_iova: AtomicU64::new(1u64 << 63),
        }
    }

    pub fn acquire(&self, numa_node: usize, size: usize, direction: Direction) -> Result<DmaBuffer> {
        let pool = self.pools.get(numa_node).unwrap_or(&self.pools[0]);
        pool.acquire(size, direction)
    }

    pub fn release(&self, buf: DmaBuffer) {
        let node = buf.numa_node().min(self.pools.len() - 1);
        self.pools[node].release(buf);
    }

    /// Map a caller-supplied payload for zero-copy transmit
    pub fn map_external(&self, data: Vec<u8>) -> MappedPayload {
        let iova = self
            .external_iova
            .fetch_add(data.len().max(1) as u64, Ordering::Relaxed);
        MappedPayload { data, iova }
    }

    /// Return a transfer's payload to its owner: pooled buffers to their
    /// pool, external mappings unmapped on the spot
    pub fn reclaim(&self, payload: PayloadHandle) {
        match payload {
            PayloadHandle::Pooled(buf) => self.release(buf),
            PayloadHandle::External(m) => drop(m),
        }
    }

    pub fn pool(&self, numa_node: usize) -> Option<&BufferPool> {
        self.pools.get(numa_node)
    }

    pub fn num_pools(&self) -> usize {
        self.pools.len()
    }

    /// Buffers currently out of every pool; zero after a full teardown
    pub fn outstanding(&self) -> u64 {
        self.pools
            .iter()
            .map(|p| {
                p.stats.acquired.load(Ordering::Relaxed) - p.stats.released.load(Ordering::Relaxed)
            })
            .sum()
    }

    pub fn stats(&self) -> Vec<PoolStatsView> {
        self.pools.iter().map(|p| p.stats()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_roundtrip() {
        let pool = BufferPool::new(0, 4, 16);
        let mut buf = pool.acquire(1500, Direction::ToDevice).unwrap();
        assert_eq!(buf.size(), 1500);
        assert_eq!(buf.data().len(), 1500);
        buf.data_mut()[0] = 0xAB;
        assert_eq!(buf.data()[0], 0xAB);

        assert_eq!(pool.free_slots(), 3);
        pool.release(buf);
        assert_eq!(pool.free_slots(), 4);
        assert_eq!(pool.pages_avail(), 16);
    }

    #[test]
    fn test_slot_exhaustion() {
        let pool = BufferPool::new(0, 2, 64);
        let a = pool.acquire(100, Direction::ToDevice).unwrap();
        let b = pool.acquire(100, Direction::ToDevice).unwrap();
        match pool.acquire(100, Direction::ToDevice) {
            Err(Error::ResourceExhausted(_)) => {}
            other => panic!("expected ResourceExhausted, got {:?}", other.map(|_| ())),
        }
        pool.release(a);
        pool.release(b);
    }

    #[test]
    fn test_page_budget_failure_leaves_pool_unchanged() {
        // 2 pages budgeted, request needs 3: must fail without retaining
        // any partial reservation
        let ps = page_size();
        let pool = BufferPool::new(0, 4, 2);
        let err = pool.acquire(3 * ps, Direction::FromDevice);
        assert!(matches!(err, Err(Error::ResourceExhausted(_))));
        assert_eq!(pool.pages_avail(), 2);
        assert_eq!(pool.free_slots(), 4);

        // The budget still serves smaller requests
        let buf = pool.acquire(ps, Direction::FromDevice).unwrap();
        pool.release(buf);
    }

    #[test]
    fn test_no_buffer_leak_accounting() {
        let set = PoolSet::new(2, 8, 64);
        let a = set.acquire(0, 512, Direction::ToDevice).unwrap();
        let b = set.acquire(1, 512, Direction::FromDevice).unwrap();
        assert_eq!(set.outstanding(), 2);
        set.reclaim(PayloadHandle::Pooled(a));
        set.reclaim(PayloadHandle::Pooled(b));
        assert_eq!(set.outstanding(), 0);
    }

    #[test]
    fn test_segment_chunking() {
        let segments = build_segments(0x1000, DMA_CHUNK_SIZE * 2 + 100);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].len, DMA_CHUNK_SIZE);
        assert_eq!(segments[1].iova, 0x1000 + DMA_CHUNK_SIZE as u64);
        assert_eq!(segments[2].len, 100);
    }

    #[test]
    fn test_external_mapping() {
        let set = PoolSet::new(1, 4, 16);
        let payload = set.map_external(vec![1, 2, 3]);
        assert_eq!(payload.len(), 3);
        assert_eq!(payload.data(), &[1, 2, 3]);
        set.reclaim(PayloadHandle::External(payload));
        assert_eq!(set.outstanding(), 0);
    }
}
