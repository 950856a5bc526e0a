//! Serializable engine-wide views: aggregate counters, per-queue tables,
//! flow listings and per-locality rollups. Snapshots are point-in-time and
//! built from relaxed counter reads, so totals can be momentarily
//! inconsistent with each other under load.

use crate::queue::{NicQueue, QueueStatsSnapshot};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Summed counters across every queue
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateSnapshot {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    pub in_flight: usize,
}

/// One tracked flow as seen at snapshot time
#[derive(Debug, Clone, Serialize)]
pub struct FlowSnapshot {
    pub flow_id: u32,
    pub queue_id: usize,
    pub packets: u64,
    pub bytes: u64,
    pub avg_latency_ns: u64,
    /// Nanoseconds since the flow was last seen
    pub idle_ns: u64,
}

/// Rollup of every queue placed on one locality domain
#[derive(Debug, Clone, Serialize)]
pub struct LocalitySnapshot {
    pub numa_node: usize,
    pub queues: Vec<usize>,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub errors: u64,
    pub in_flight: usize,
}

pub fn aggregate(queues: &[Arc<NicQueue>]) -> AggregateSnapshot {
    let mut agg = AggregateSnapshot::default();
    for q in queues {
        let s = q.snapshot();
        agg.rx_packets += s.rx_packets;
        agg.tx_packets += s.tx_packets;
        agg.rx_bytes += s.rx_bytes;
        agg.tx_bytes += s.tx_bytes;
        agg.rx_errors += s.rx_errors;
        agg.tx_errors += s.tx_errors;
        agg.rx_dropped += s.rx_dropped;
        agg.tx_dropped += s.tx_dropped;
        agg.in_flight += s.in_flight;
    }
    agg
}

pub fn queue_table(queues: &[Arc<NicQueue>]) -> Vec<QueueStatsSnapshot> {
    queues.iter().map(|q| q.snapshot()).collect()
}

pub fn flow_table(queues: &[Arc<NicQueue>]) -> Vec<FlowSnapshot> {
    let mut flows = Vec::new();
    for q in queues {
        for (key, entry) in q.flows().snapshot() {
            flows.push(FlowSnapshot {
                flow_id: key,
                queue_id: entry.queue_id,
                packets: entry.packets,
                bytes: entry.bytes,
                avg_latency_ns: entry.avg_latency_ns(),
                idle_ns: entry.last_seen.elapsed().as_nanos() as u64,
            });
        }
    }
    flows.sort_by_key(|f| f.flow_id);
    flows
}

pub fn locality_table(queues: &[Arc<NicQueue>]) -> Vec<LocalitySnapshot> {
    let mut by_node: BTreeMap<usize, LocalitySnapshot> = BTreeMap::new();
    for q in queues {
        let s = q.snapshot();
        let entry = by_node
            .entry(q.numa_node())
            .or_insert_with(|| LocalitySnapshot {
                numa_node: q.numa_node(),
                queues: Vec::new(),
                rx_packets: 0,
                tx_packets: 0,
                rx_bytes: 0,
                tx_bytes: 0,
                errors: 0,
                in_flight: 0,
            });
        entry.queues.push(q.id());
        entry.rx_packets += s.rx_packets;
        entry.tx_packets += s.tx_packets;
        entry.rx_bytes += s.rx_bytes;
        entry.tx_bytes += s.tx_bytes;
        entry.errors += s.rx_errors + s.tx_errors;
        entry.in_flight += s.in_flight;
    }
    by_node.into_values().collect()
}
