//! vndp: multi-queue paravirtual NIC data-plane engine
//!
//! The engine owns a set of send/receive queues placed across locality
//! domains, hands each packet to a queue by flow hash, tracks per-flow and
//! per-queue statistics, and keeps the set healthy: a background worker
//! fails over error-prone queues, recovers quiet ones, rebalances CPU
//! bindings under load and adapts interrupt coalescing to the aggregate
//! in-flight level. Payloads ride in NUMA-local pinned buffer pools or in
//! zero-copy mappings of caller memory.
//!
//! ```no_run
//! use vndp::{Engine, EngineConfig};
//!
//! let mut engine = Engine::new(EngineConfig::default()).unwrap();
//! engine.start();
//! engine.transmit(vec![0u8; 1500]).unwrap();
//! engine.stop();
//! ```

pub mod dma;
pub mod failover;
pub mod flow;
pub mod queue;
pub mod ring;
pub mod sched;
pub mod telemetry;
pub mod topo;

pub use dma::{BufferPool, Direction, DmaBuffer, PayloadHandle, PoolSet, Segment};
pub use failover::{FailoverSnapshot, FailoverState};
pub use flow::{flow_key_for, FlowKey, FlowTable};
pub use queue::{NicQueue, QueueState, QueueStatsSnapshot};
pub use ring::{Completion, DescRing, RingSlot};
pub use sched::Scheduler;
pub use telemetry::{AggregateSnapshot, FlowSnapshot, LocalitySnapshot};
pub use topo::Topology;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("mapping failure: {0}")]
    MappingFailure(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("queue error: {0}")]
    QueueError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("parse error: {0}")]
    ParseError(#[from] std::num::ParseIntError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Install the process-wide logger, honoring `RUST_LOG`. Later calls are
/// no-ops, so library consumers and tests can both call it freely.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .try_init();
}

/// Engine-wide tuning knobs. `Default` matches the values the engine ships
/// with; `validate` rejects inconsistent combinations before any resource
/// is allocated.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub num_queues: usize,
    pub ring_size: usize,
    /// Pinned-buffer slots per locality domain
    pub pool_slots: usize,
    /// Page budget per locality domain
    pub pool_pages: usize,
    pub locality_aware: bool,
    pub zero_copy: bool,
    pub coalesce_usecs: u64,
    pub min_coalesce_usecs: u64,
    pub max_coalesce_usecs: u64,
    pub adaptive_sched: bool,
    /// Aggregate in-flight level that triggers rebalancing
    pub load_threshold: usize,
    pub failover: bool,
    pub health_check_interval_ms: u64,
    pub error_threshold: u64,
    pub max_failover_attempts: u32,
    pub recovery_window_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_queues: 4,
            ring_size: 256,
            pool_slots: 64,
            pool_pages: 1024,
            locality_aware: true,
            zero_copy: true,
            coalesce_usecs: 64,
            min_coalesce_usecs: 8,
            max_coalesce_usecs: 128,
            adaptive_sched: true,
            load_threshold: 1000,
            failover: true,
            health_check_interval_ms: 1000,
            error_threshold: 1000,
            max_failover_attempts: 3,
            recovery_window_ms: 5000,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_queues == 0 {
            return Err(Error::InvalidConfig("num_queues must be nonzero".into()));
        }
        if self.ring_size == 0 {
            return Err(Error::InvalidConfig("ring_size must be nonzero".into()));
        }
        if self.min_coalesce_usecs > self.max_coalesce_usecs {
            return Err(Error::InvalidConfig(format!(
                "coalesce bounds inverted: min {} > max {}",
                self.min_coalesce_usecs, self.max_coalesce_usecs
            )));
        }
        if self.coalesce_usecs < self.min_coalesce_usecs
            || self.coalesce_usecs > self.max_coalesce_usecs
        {
            return Err(Error::InvalidConfig(format!(
                "coalesce_usecs {} outside [{}, {}]",
                self.coalesce_usecs, self.min_coalesce_usecs, self.max_coalesce_usecs
            )));
        }
        Ok(())
    }
}

/// The data-plane engine: queue set, buffer pools, failover state and the
/// background maintenance worker.
pub struct Engine {
    config: EngineConfig,
    topology: Arc<Topology>,
    pools: Arc<PoolSet>,
    queues: Vec<Arc<NicQueue>>,
    failover: Arc<FailoverState>,
    scheduler: Arc<Scheduler>,
    worker: Option<thread::JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl Engine {
    /// Build an engine on the detected machine topology.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let topology = Topology::detect()?;
        Self::with_topology(config, topology)
    }

    /// Build an engine on an explicit topology. Queues are striped across
    /// domains in contiguous blocks and pinned round-robin onto the
    /// domain's CPUs; validation requires queues to divide evenly.
    pub fn with_topology(config: EngineConfig, topology: Topology) -> Result<Self> {
        config.validate()?;

        let topology = if config.locality_aware {
            topology
        } else {
            Topology::uniform(1, num_cpus::get())
        };

        if config.num_queues % topology.num_domains() != 0 {
            return Err(Error::InvalidConfig(format!(
                "{} queues do not divide across {} locality domains",
                config.num_queues,
                topology.num_domains()
            )));
        }

        let pools = Arc::new(PoolSet::new(
            topology.num_domains(),
            config.pool_slots,
            config.pool_pages,
        ));

        let queues_per_domain = config.num_queues / topology.num_domains();
        let queues: Vec<Arc<NicQueue>> = (0..config.num_queues)
            .map(|i| {
                let node = i / queues_per_domain;
                let cpus = topology
                    .domain(node)
                    .map(|d| d.cpus.as_slice())
                    .unwrap_or(&[]);
                let cpu = if cpus.is_empty() {
                    0
                } else {
                    cpus[i % cpus.len()]
                };
                Arc::new(NicQueue::new(
                    i,
                    node,
                    cpu,
                    config.ring_size,
                    config.coalesce_usecs,
                    pools.clone(),
                ))
            })
            .collect();

        let failover = Arc::new(FailoverState::new(
            config.failover,
            config.num_queues,
            config.error_threshold,
            config.max_failover_attempts,
            Duration::from_millis(config.recovery_window_ms),
        ));

        let scheduler = Arc::new(Scheduler::new(
            config.load_threshold,
            config.coalesce_usecs,
            config.min_coalesce_usecs,
            config.max_coalesce_usecs,
            topology.num_domains(),
        ));

        log::info!(
            "engine up: {} queues across {} locality domains, ring size {}",
            config.num_queues,
            topology.num_domains(),
            config.ring_size
        );

        Ok(Self {
            config,
            topology: Arc::new(topology),
            pools,
            queues,
            failover,
            scheduler,
            worker: None,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }

    pub fn queue(&self, idx: usize) -> Option<&Arc<NicQueue>> {
        self.queues.get(idx)
    }

    /// Queue index traffic hashed to `frame` would land on, redirects
    /// included
    pub fn route(&self, frame: &[u8]) -> usize {
        let idx = flow_key_for(frame) as usize % self.queues.len();
        self.failover.serving(idx)
    }

    /// Hand one frame to the data plane. The owning queue is chosen by
    /// flow hash, then redirected past any failed queue.
    pub fn transmit(&self, frame: Vec<u8>) -> Result<()> {
        let key = flow_key_for(&frame);
        let idx = self.failover.serving(key as usize % self.queues.len());
        let q = &self.queues[idx];
        let (segments, payload) =
            queue::prepare_tx_payload(&self.pools, q.numa_node(), frame, self.config.zero_copy)?;
        q.enqueue(segments, payload, key)
    }

    /// Drain completions on one queue, delivering received frames to
    /// `on_rx`. Returns the number of completions processed.
    pub fn poll_queue<F: FnMut(&[u8])>(&self, idx: usize, budget: usize, on_rx: F) -> Result<usize> {
        let q = self
            .queues
            .get(idx)
            .ok_or_else(|| Error::QueueError(format!("no queue {}", idx)))?;
        Ok(q.poll(budget, on_rx))
    }

    /// Device side: acknowledge up to `n` pending transmissions on queue
    /// `idx`.
    pub fn complete_tx(&self, idx: usize, n: usize) -> Result<usize> {
        let q = self
            .queues
            .get(idx)
            .ok_or_else(|| Error::QueueError(format!("no queue {}", idx)))?;
        Ok(q.complete_tx(n))
    }

    /// Device side: deposit one received frame on queue `idx`.
    pub fn device_receive(&self, idx: usize, frame: &[u8]) -> Result<()> {
        let q = self
            .queues
            .get(idx)
            .ok_or_else(|| Error::QueueError(format!("no queue {}", idx)))?;
        q.device_receive(frame)
    }

    /// Start the background maintenance worker: health checks, recovery
    /// sweeps, rebalancing and coalescing adjustment, one pass per
    /// configured interval. Idempotent.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let queues = self.queues.clone();
        let failover = self.failover.clone();
        let scheduler = self.scheduler.clone();
        let topology = self.topology.clone();
        let running = self.running.clone();
        let interval = Duration::from_millis(self.config.health_check_interval_ms);
        let adaptive = self.config.adaptive_sched;

        self.worker = Some(thread::spawn(move || {
            log::debug!("maintenance worker started");
            while running.load(Ordering::SeqCst) {
                failover.health_check(&queues);
                failover.recovery_sweep(&queues);
                if adaptive {
                    scheduler.rebalance(&queues, &topology);
                    scheduler.adjust_coalescing(&queues);
                }
                thread::sleep(interval);
            }
            log::debug!("maintenance worker stopped");
        }));
    }

    /// Stop the maintenance worker and wait for it to exit. Idempotent.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    /// Run one maintenance pass inline, without the background worker.
    pub fn maintenance_tick(&self) {
        self.failover.health_check(&self.queues);
        self.failover.recovery_sweep(&self.queues);
        if self.config.adaptive_sched {
            self.scheduler.rebalance(&self.queues, &self.topology);
            self.scheduler.adjust_coalescing(&self.queues);
        }
    }

    /// Pin interrupt coalescing on every queue, clamped to the configured
    /// bounds.
    pub fn set_coalesce_usecs(&self, usecs: u64) {
        self.scheduler.set_coalesce_usecs(&self.queues, usecs);
    }

    pub fn stats(&self) -> AggregateSnapshot {
        telemetry::aggregate(&self.queues)
    }

    pub fn queue_stats(&self) -> Vec<QueueStatsSnapshot> {
        telemetry::queue_table(&self.queues)
    }

    pub fn flow_stats(&self) -> Vec<FlowSnapshot> {
        telemetry::flow_table(&self.queues)
    }

    pub fn locality_stats(&self) -> Vec<LocalitySnapshot> {
        telemetry::locality_table(&self.queues)
    }

    pub fn failover_stats(&self) -> FailoverSnapshot {
        self.failover.snapshot(&self.queues)
    }

    pub fn pool_stats(&self) -> Vec<dma::PoolStatsView> {
        self.pools.stats()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
        for q in &self.queues {
            q.teardown();
        }
        let outstanding = self.pools.outstanding();
        if outstanding != 0 {
            log::warn!("{} buffers still outstanding at engine drop", outstanding);
        }
    }
}
