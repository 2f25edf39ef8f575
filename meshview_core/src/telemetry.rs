//! Telemetry heartbeat: node state drift and synthetic packet traffic.
//!
//! The two ticks are plain functions over the store. The engine schedules
//! them on independent timers and only reschedules a timer after its tick
//! returned, so ticks of one timer never overlap.

use meshview_env::{PacketId, RandomSource};

use crate::config::TelemetryConfig;
use crate::messages::{MonitoringSnapshot, PacketEvent, PacketKind};
use crate::model::{NodeId, NodeKind, NodeStatus};
use crate::store::EntityStore;

/// Start/stop state of the heartbeat timers.
///
/// Every tick carries the generation it was scheduled under; stopping or
/// restarting bumps the generation so outstanding ticks become no-ops.
#[derive(Debug, Clone, Default)]
pub struct Heartbeat {
    generation: u64,
    running: bool,
}

impl Heartbeat {
    /// Starts a new generation and returns it.
    pub fn start(&mut self) -> u64 {
        self.generation += 1;
        self.running = true;
        self.generation
    }

    pub fn stop(&mut self) {
        self.generation += 1;
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.running && self.generation == generation
    }
}

/// Drifts heights, latencies and mempool gauges, then snapshots the network.
pub fn state_tick<R: RandomSource + ?Sized>(
    store: &mut EntityStore,
    config: &TelemetryConfig,
    rng: &mut R,
    timestamp_ms: u64,
) -> MonitoringSnapshot {
    let (nodes, mempool) = store.network_mut();

    for node in nodes.iter_mut().filter(|n| n.status == NodeStatus::Active) {
        if rng.chance(config.height_advance_probability) {
            node.height += 1;
        }
        let step = config.latency_step_ms as i64;
        let latency = node.latency_ms as i64 + rng.between(-step, step);
        node.latency_ms = latency.clamp(config.latency_min_ms as i64, config.latency_max_ms as i64) as u32;
    }

    for gauge in mempool.iter_mut() {
        let step = config.mempool_step as i64;
        let pending = (gauge.pending_count as i64).saturating_add(rng.between(-step, step));
        gauge.pending_count = pending.max(0) as u64;
        if let Some(node) = nodes.iter_mut().find(|n| n.id == gauge.node) {
            node.pending_tx_count = gauge.pending_count;
        }
    }

    MonitoringSnapshot {
        nodes: store.nodes().to_vec(),
        mempool: store.mempool().to_vec(),
        replica_count: store.replica_count(),
        timestamp_ms,
    }
}

/// Maybe synthesizes one packet from the control node to a data node.
pub fn packet_tick<R: RandomSource + ?Sized>(
    store: &EntityStore,
    config: &TelemetryConfig,
    rng: &mut R,
    timestamp_ms: u64,
) -> Option<PacketEvent> {
    if !rng.chance(config.packet_probability) {
        return None;
    }
    let data: Vec<NodeId> = store
        .nodes()
        .iter()
        .filter(|n| n.kind == NodeKind::Data)
        .map(|n| n.id)
        .collect();
    if data.is_empty() {
        return None;
    }
    let to = data[rng.pick(data.len())];
    let kind = PacketKind::ALL[rng.pick(PacketKind::ALL.len())];
    Some(PacketEvent {
        id: PacketId::generate(rng),
        from: NodeId::CONTROL,
        to,
        kind,
        timestamp_ms,
    })
}
