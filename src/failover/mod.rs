//! Queue health monitoring, failover and recovery
//!
//! A queue whose error counters breach the configured threshold is failed
//! over: its flows migrate to the healthiest peer, a redirect entry steers
//! subsequent transmissions, and the queue drains to `Failed`. Recovered
//! queues (quiet past the recovery window, errors confirmed zero) return
//! to service and their redirect entry is cleared. Once the global attempt
//! budget is spent, further failures are terminal: the queue drains with
//! no migration target and its errors are never reset, so the recovery
//! sweep will not resurrect it.

use crate::flow::migrate_all;
use crate::queue::{NicQueue, QueueState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bookkeeping for one queue that has failed at least once
#[derive(Debug, Clone)]
pub struct FailoverRecord {
    pub queue_id: usize,
    pub failure_count: u32,
    pub last_failure: Instant,
}

/// Serializable failover counters for telemetry
#[derive(Debug, Clone, serde::Serialize)]
pub struct FailoverSnapshot {
    pub enabled: bool,
    pub failover_count: u32,
    pub active_queues: usize,
    pub failed_queues: Vec<usize>,
    pub max_failure_count: u32,
    pub redirects: Vec<usize>,
}

pub struct FailoverState {
    enabled: bool,
    error_threshold: u64,
    max_attempts: u32,
    recovery_window: Duration,
    failover_count: AtomicU32,
    records: Mutex<Vec<FailoverRecord>>,
    /// Transmit redirect map: `remap[i]` is the queue actually serving
    /// traffic hashed to queue `i`
    remap: Vec<AtomicUsize>,
}

impl FailoverState {
    pub fn new(
        enabled: bool,
        num_queues: usize,
        error_threshold: u64,
        max_attempts: u32,
        recovery_window: Duration,
    ) -> Self {
        Self {
            enabled,
            error_threshold,
            max_attempts,
            recovery_window,
            failover_count: AtomicU32::new(0),
            records: Mutex::new(Vec::new()),
            remap: (0..num_queues).map(AtomicUsize::new).collect(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn failover_count(&self) -> u32 {
        self.failover_count.load(Ordering::Relaxed)
    }

    /// Queue index actually serving traffic hashed to `idx`
    pub fn serving(&self, idx: usize) -> usize {
        self.remap[idx].load(Ordering::Relaxed)
    }

    /// Inspect every active queue's error counters and fail over those past
    /// the threshold. Non-active queues are skipped, which makes repeated
    /// passes over an already-failed queue no-ops.
    pub fn health_check(&self, queues: &[Arc<NicQueue>]) {
        if !self.enabled {
            return;
        }
        for q in queues {
            if q.state() != QueueState::Active {
                continue;
            }
            if q.total_errors() > self.error_threshold {
                log::warn!(
                    "queue {} exceeded error threshold ({} > {})",
                    q.id(),
                    q.total_errors(),
                    self.error_threshold
                );
                self.queue_failed(q, queues);
            }
        }
    }

    /// Fail one queue over. While the engine-wide migration budget lasts,
    /// its flows migrate to the active peer with the fewest total errors
    /// and every redirect aimed at it is rewritten to that peer; past the
    /// budget the queue drains with nothing migrated.
    pub fn queue_failed(&self, failing: &Arc<NicQueue>, queues: &[Arc<NicQueue>]) {
        {
            let mut records = self.records.lock();
            match records.iter_mut().find(|r| r.queue_id == failing.id()) {
                Some(r) => {
                    r.failure_count += 1;
                    r.last_failure = Instant::now();
                }
                None => {
                    records.push(FailoverRecord {
                        queue_id: failing.id(),
                        failure_count: 1,
                        last_failure: Instant::now(),
                    });
                }
            }
        }

        // The migration budget is global, shared by every queue
        if self.failover_count.load(Ordering::Relaxed) >= self.max_attempts {
            log::error!(
                "failover budget of {} spent, marking queue {} permanently failed",
                self.max_attempts,
                failing.id()
            );
            failing.drain_to_failed();
            return;
        }

        let target = queues
            .iter()
            .filter(|q| q.id() != failing.id() && q.state() == QueueState::Active)
            .min_by_key(|q| q.total_errors());

        failing.set_state(QueueState::Draining);

        if let Some(target) = target {
            let migrated =
                migrate_all(failing.flows(), failing.id(), target.flows(), target.id());
            // Rewrite every redirect aimed at the failing queue, its own
            // entry included, so earlier failovers never chain through it
            for entry in &self.remap {
                if entry.load(Ordering::Relaxed) == failing.id() {
                    entry.store(target.id(), Ordering::Relaxed);
                }
            }
            self.failover_count.fetch_add(1, Ordering::Relaxed);
            log::info!(
                "failover: queue {} -> queue {} ({} flows migrated)",
                failing.id(),
                target.id(),
                migrated
            );
        } else {
            log::error!("no failover target for queue {}", failing.id());
        }

        // Errors are cleared so a later recovery sweep can confirm the
        // queue has gone quiet
        failing.reset_errors();
        failing.drain_to_failed();
    }

    /// Return failed queues to service once their last failure is older
    /// than the recovery window and their error counters are still zero.
    pub fn recovery_sweep(&self, queues: &[Arc<NicQueue>]) {
        if !self.enabled {
            return;
        }
        let mut records = self.records.lock();
        records.retain(|record| {
            if record.last_failure.elapsed() < self.recovery_window {
                return true;
            }
            let q = match queues.iter().find(|q| q.id() == record.queue_id) {
                Some(q) => q,
                None => return false,
            };
            if q.state() != QueueState::Failed || q.total_errors() != 0 {
                // Terminal failures keep their error counters, so they
                // never pass this gate
                return true;
            }
            q.set_state(QueueState::Active);
            self.remap[q.id()].store(q.id(), Ordering::Relaxed);
            log::info!("queue {} recovered", q.id());
            false
        });
    }

    pub fn records(&self) -> Vec<FailoverRecord> {
        self.records.lock().clone()
    }

    pub fn snapshot(&self, queues: &[Arc<NicQueue>]) -> FailoverSnapshot {
        FailoverSnapshot {
            enabled: self.enabled,
            failover_count: self.failover_count(),
            active_queues: queues
                .iter()
                .filter(|q| q.state() == QueueState::Active)
                .count(),
            failed_queues: queues
                .iter()
                .filter(|q| q.state() == QueueState::Failed)
                .map(|q| q.id())
                .collect(),
            max_failure_count: self
                .records
                .lock()
                .iter()
                .map(|r| r.failure_count)
                .max()
                .unwrap_or(0),
            redirects: self.remap.iter().map(|r| r.load(Ordering::Relaxed)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::PoolSet;
    use crate::queue::prepare_tx_payload;

    fn make_queues(n: usize) -> Vec<Arc<NicQueue>> {
        let pools = Arc::new(PoolSet::new(1, 64, 1024));
        (0..n)
            .map(|i| Arc::new(NicQueue::new(i, 0, i, 64, 64, pools.clone())))
            .collect()
    }

    fn push_flow(q: &Arc<NicQueue>, key: u32) {
        let pools = Arc::new(PoolSet::new(1, 8, 64));
        let (segments, payload) =
            prepare_tx_payload(&pools, 0, vec![0u8; 16], true).unwrap();
        q.enqueue(segments, payload, key).unwrap();
    }

    fn breach(q: &Arc<NicQueue>, threshold: u64) {
        q.stats()
            .tx_errors
            .store(threshold + 1, Ordering::Relaxed);
    }

    #[test]
    fn test_failover_migrates_flows_and_redirects() {
        let queues = make_queues(3);
        let fo = FailoverState::new(true, 3, 10, 3, Duration::from_secs(5));

        push_flow(&queues[0], 1);
        push_flow(&queues[0], 2);
        // Queue 2 carries errors, so queue 1 is the healthiest target
        queues[2].stats().tx_errors.store(5, Ordering::Relaxed);

        breach(&queues[0], 10);
        fo.health_check(&queues);

        assert_eq!(queues[0].state(), QueueState::Failed);
        assert_eq!(fo.serving(0), 1);
        assert_eq!(fo.failover_count(), 1);
        assert_eq!(queues[0].flows().len(), 0);
        assert_eq!(queues[1].flows().len(), 2);
        assert_eq!(queues[1].flows().lookup(1).unwrap().queue_id, 1);
        // Errors cleared so recovery can later confirm quiet
        assert_eq!(queues[0].total_errors(), 0);
    }

    #[test]
    fn test_health_check_is_idempotent_on_failed_queue() {
        let queues = make_queues(2);
        let fo = FailoverState::new(true, 2, 10, 3, Duration::from_secs(5));

        breach(&queues[0], 10);
        fo.health_check(&queues);
        fo.health_check(&queues);
        fo.health_check(&queues);

        assert_eq!(fo.failover_count(), 1);
        assert_eq!(fo.records()[0].failure_count, 1);
    }

    #[test]
    fn test_recovery_restores_queue_and_redirect() {
        let queues = make_queues(2);
        let fo = FailoverState::new(true, 2, 10, 3, Duration::from_millis(20));

        breach(&queues[0], 10);
        fo.health_check(&queues);
        assert_eq!(queues[0].state(), QueueState::Failed);
        assert_eq!(fo.serving(0), 1);

        // Too early: still failed
        fo.recovery_sweep(&queues);
        assert_eq!(queues[0].state(), QueueState::Failed);

        std::thread::sleep(Duration::from_millis(30));
        fo.recovery_sweep(&queues);
        assert_eq!(queues[0].state(), QueueState::Active);
        assert_eq!(fo.serving(0), 0);
        assert!(fo.records().is_empty());
    }

    #[test]
    fn test_exhausted_attempts_are_terminal() {
        let queues = make_queues(2);
        let fo = FailoverState::new(true, 2, 10, 2, Duration::from_millis(10));

        for _ in 0..3 {
            queues[0].set_state(QueueState::Active);
            breach(&queues[0], 10);
            fo.health_check(&queues);
            std::thread::sleep(Duration::from_millis(15));
        }
        // Third failure blew the budget: errors were not reset, so the
        // sweep refuses to recover
        assert_eq!(queues[0].state(), QueueState::Failed);
        assert!(queues[0].total_errors() > 0);
        fo.recovery_sweep(&queues);
        assert_eq!(queues[0].state(), QueueState::Failed);
        assert_eq!(fo.records()[0].failure_count, 3);
    }

    #[test]
    fn test_attempt_budget_is_shared_across_queues() {
        let queues = make_queues(3);
        let fo = FailoverState::new(true, 3, 10, 1, Duration::from_secs(5));

        breach(&queues[0], 10);
        fo.health_check(&queues);
        assert_eq!(fo.failover_count(), 1);

        // The single budgeted migration is spent engine-wide: a different
        // queue failing next gets no migration
        breach(&queues[1], 10);
        fo.health_check(&queues);
        assert_eq!(fo.failover_count(), 1);
        assert_eq!(queues[1].state(), QueueState::Failed);
        assert!(queues[1].total_errors() > 0);
        assert_eq!(fo.serving(1), 1);
    }

    #[test]
    fn test_cascaded_failover_rewrites_stale_redirects() {
        let queues = make_queues(3);
        let fo = FailoverState::new(true, 3, 10, 5, Duration::from_millis(20));

        push_flow(&queues[0], 1);
        // Queue 2 carries errors, so queue 1 is the first target
        queues[2].stats().tx_errors.store(5, Ordering::Relaxed);
        breach(&queues[0], 10);
        fo.health_check(&queues);
        assert_eq!(fo.serving(0), 1);

        // The target itself fails: the redirect installed for queue 0 must
        // follow the flows to the new target instead of pointing at a
        // failed queue
        breach(&queues[1], 10);
        fo.health_check(&queues);
        assert_eq!(fo.serving(1), 2);
        assert_eq!(fo.serving(0), 2);
        assert_eq!(queues[2].flows().len(), 1);

        // Recovering queue 1 restores only its own entry; queue 0 is still
        // failed and keeps pointing at queue 2
        queues[0]
            .stats()
            .tx_errors
            .store(1, Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(30));
        fo.recovery_sweep(&queues);
        assert_eq!(queues[1].state(), QueueState::Active);
        assert_eq!(fo.serving(1), 1);
        assert_eq!(queues[0].state(), QueueState::Failed);
        assert_eq!(fo.serving(0), 2);
    }

    #[test]
    fn test_no_target_still_drains() {
        let queues = make_queues(1);
        let fo = FailoverState::new(true, 1, 10, 3, Duration::from_secs(5));

        push_flow(&queues[0], 7);
        breach(&queues[0], 10);
        fo.health_check(&queues);

        assert_eq!(queues[0].state(), QueueState::Failed);
        assert_eq!(fo.failover_count(), 0);
        assert_eq!(fo.serving(0), 0);
    }

    #[test]
    fn test_disabled_failover_does_nothing() {
        let queues = make_queues(2);
        let fo = FailoverState::new(false, 2, 10, 3, Duration::from_secs(5));

        breach(&queues[0], 10);
        fo.health_check(&queues);
        assert_eq!(queues[0].state(), QueueState::Active);
    }
}
