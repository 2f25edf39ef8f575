//! Topic names of the bus contract.
//!
//! Topics are opaque strings. Anything after the first `?` is a query suffix
//! that identifies one job, execution or batch; it is ignored for routing.

use meshview_env::{BatchId, ExecutionId, JobId};

/// Full network snapshot. Stateful.
pub const MONITORING: &str = "monitoring";
/// Discrete inter-node packet events.
pub const MONITORING_PACKETS: &str = "monitoring/packets";
/// Build and deploy job logs. Use [`deployment_logs`] to address one job.
pub const DEPLOYMENT_LOGS: &str = "deployment/logs";
/// Execution progress. Use [`experiment_progress`] to address one run.
pub const EXPERIMENT_PROGRESS: &str = "experiment/progress";
/// Classification updates. Use [`experiment_scenarios`] to address one batch.
pub const EXPERIMENT_SCENARIOS: &str = "experiment/scenarios";

/// Whether a topic retains its last message for late subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// Retains the most recent message and pushes it on subscribe.
    Stateful,
    /// Fire and forget.
    Event,
}

pub fn deployment_logs(job: JobId) -> String {
    format!("{DEPLOYMENT_LOGS}?job={job}")
}

pub fn experiment_progress(exec: ExecutionId) -> String {
    format!("{EXPERIMENT_PROGRESS}?exec={exec}")
}

pub fn experiment_scenarios(batch: BatchId) -> String {
    format!("{EXPERIMENT_SCENARIOS}?batch={batch}")
}

/// Prefix of `topic` up to the first `?`.
pub fn routing_key(topic: &str) -> &str {
    topic.split_once('?').map_or(topic, |(key, _)| key)
}
