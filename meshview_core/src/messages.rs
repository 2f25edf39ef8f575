//! Typed payloads carried on the bus, one variant per topic family.

use meshview_env::{BatchId, ExecutionId, JobId, PacketId};
use serde::{Deserialize, Serialize};

use crate::model::{FailureReason, MempoolGauge, Node, NodeId, ScenarioStatus};
use crate::topics;

/// Closed set of messages the engine publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BusMessage {
    Monitoring(MonitoringSnapshot),
    Packet(PacketEvent),
    Deployment(DeploymentLog),
    Experiment(ExperimentProgress),
    Scenario(ScenarioUpdate),
}

impl BusMessage {
    /// Routing key this message is published under.
    pub fn base_topic(&self) -> &'static str {
        match self {
            BusMessage::Monitoring(_) => topics::MONITORING,
            BusMessage::Packet(_) => topics::MONITORING_PACKETS,
            BusMessage::Deployment(_) => topics::DEPLOYMENT_LOGS,
            BusMessage::Experiment(_) => topics::EXPERIMENT_PROGRESS,
            BusMessage::Scenario(_) => topics::EXPERIMENT_SCENARIOS,
        }
    }

    pub fn as_monitoring(&self) -> Option<&MonitoringSnapshot> {
        match self {
            BusMessage::Monitoring(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_packet(&self) -> Option<&PacketEvent> {
        match self {
            BusMessage::Packet(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_deployment(&self) -> Option<&DeploymentLog> {
        match self {
            BusMessage::Deployment(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_experiment(&self) -> Option<&ExperimentProgress> {
        match self {
            BusMessage::Experiment(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_scenario(&self) -> Option<&ScenarioUpdate> {
        match self {
            BusMessage::Scenario(s) => Some(s),
            _ => None,
        }
    }
}

/// A delivered message together with the exact topic it was published on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub message: BusMessage,
}

// ============================================================================
// MONITORING
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSnapshot {
    pub nodes: Vec<Node>,
    pub mempool: Vec<MempoolGauge>,
    pub replica_count: u32,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    Upload,
    Replicate,
    Proof,
}

impl PacketKind {
    pub const ALL: [PacketKind; 3] = [PacketKind::Upload, PacketKind::Replicate, PacketKind::Proof];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketEvent {
    pub id: PacketId,
    pub from: NodeId,
    pub to: NodeId,
    pub kind: PacketKind,
    pub timestamp_ms: u64,
}

// ============================================================================
// JOBS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Build,
    Deploy,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Build => f.write_str("build"),
            JobKind::Deploy => f.write_str("deploy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Log,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentLog {
    pub job_id: JobId,
    pub job: JobKind,
    pub kind: LogKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DeploymentLog {
    pub fn line(job_id: JobId, job: JobKind, message: impl Into<String>) -> Self {
        Self {
            job_id,
            job,
            kind: LogKind::Log,
            message: Some(message.into()),
        }
    }

    pub fn complete(job_id: JobId, job: JobKind) -> Self {
        Self {
            job_id,
            job,
            kind: LogKind::Complete,
            message: None,
        }
    }

    pub fn failed(job_id: JobId, job: JobKind, reason: impl Into<String>) -> Self {
        Self {
            job_id,
            job,
            kind: LogKind::Failed,
            message: Some(reason.into()),
        }
    }
}

// ============================================================================
// EXPERIMENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressKind {
    AllComplete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentProgress {
    pub execution_id: ExecutionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ScenarioStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ProgressKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub succeeded: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<u32>,
}

impl ExperimentProgress {
    /// Per-element status change with its log line.
    pub fn step(
        execution_id: ExecutionId,
        scenario_id: &str,
        status: ScenarioStatus,
        log: impl Into<String>,
    ) -> Self {
        Self {
            execution_id,
            scenario_id: Some(scenario_id.to_string()),
            status: Some(status),
            log: Some(log.into()),
            kind: None,
            succeeded: None,
            failed: None,
        }
    }

    /// Log line about an element without a status change.
    pub fn note(execution_id: ExecutionId, scenario_id: &str, log: impl Into<String>) -> Self {
        Self {
            execution_id,
            scenario_id: Some(scenario_id.to_string()),
            status: None,
            log: Some(log.into()),
            kind: None,
            succeeded: None,
            failed: None,
        }
    }

    pub fn all_complete(execution_id: ExecutionId, succeeded: u32, failed: u32) -> Self {
        Self {
            execution_id,
            scenario_id: None,
            status: None,
            log: None,
            kind: Some(ProgressKind::AllComplete),
            succeeded: Some(succeeded),
            failed: Some(failed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioUpdateKind {
    Classified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioUpdate {
    pub batch_id: BatchId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ScenarioStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ScenarioUpdateKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<u32>,
}

impl ScenarioUpdate {
    pub fn element(
        batch_id: BatchId,
        sequence_id: u32,
        status: ScenarioStatus,
        reason: Option<FailureReason>,
    ) -> Self {
        Self {
            batch_id,
            sequence_id: Some(sequence_id),
            status: Some(status),
            reason,
            kind: None,
            total: None,
            failed: None,
        }
    }

    pub fn classified(batch_id: BatchId, total: u32, failed: u32) -> Self {
        Self {
            batch_id,
            sequence_id: None,
            status: None,
            reason: None,
            kind: Some(ScenarioUpdateKind::Classified),
            total: Some(total),
            failed: Some(failed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_json_shape() {
        let exec = ExecutionId::from_seed(9);
        let msg = ExperimentProgress::all_complete(exec, 3, 1);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "ALL_COMPLETE");
        assert_eq!(json["succeeded"], 3);
        assert_eq!(json["failed"], 1);
        assert!(json.get("scenarioId").is_none());
    }

    #[test]
    fn test_deployment_log_json_shape() {
        let job = JobId::from_seed(4);
        let json = serde_json::to_value(DeploymentLog::complete(job, JobKind::Build)).unwrap();
        assert_eq!(json["job"], "build");
        assert_eq!(json["kind"], "complete");
        assert!(json.get("message").is_none());
    }

    #[test]
    fn test_message_tagging() {
        let msg = BusMessage::Scenario(ScenarioUpdate::classified(BatchId::from_seed(1), 4, 1));
        assert_eq!(msg.base_topic(), topics::EXPERIMENT_SCENARIOS);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "scenario");
        assert_eq!(json["payload"]["kind"], "CLASSIFIED");

        let back: BusMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
        assert!(back.as_scenario().is_some());
        assert!(back.as_packet().is_none());
    }
}
