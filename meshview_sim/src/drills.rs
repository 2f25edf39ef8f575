//! Named end-to-end drills.

use serde::{Serialize, Serializer};

/// Drill identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrillId {
    /// DRL-001: many faucet transfers, some larger than the pool
    FaucetStorm,

    /// DRL-002: generate, classify and execute one batch
    BatchRun,

    /// DRL-003: resize the network up and down with funded relayers
    ScaleCycle,

    /// DRL-004: build and deploy jobs with duplicate requests
    BuildDeploy,

    /// DRL-005: heartbeat only, checking telemetry bounds
    TelemetrySoak,

    /// DRL-006: random mix of every operation
    Churn,
}

impl DrillId {
    /// Returns a list of all drills.
    pub fn all() -> Vec<DrillId> {
        vec![
            DrillId::FaucetStorm,
            DrillId::BatchRun,
            DrillId::ScaleCycle,
            DrillId::BuildDeploy,
            DrillId::TelemetrySoak,
            DrillId::Churn,
        ]
    }

    /// Returns the drill name.
    pub fn name(&self) -> &'static str {
        match self {
            DrillId::FaucetStorm => "faucet_storm",
            DrillId::BatchRun => "batch_run",
            DrillId::ScaleCycle => "scale_cycle",
            DrillId::BuildDeploy => "build_deploy",
            DrillId::TelemetrySoak => "telemetry_soak",
            DrillId::Churn => "churn",
        }
    }

    /// Returns a description of the drill.
    pub fn description(&self) -> &'static str {
        match self {
            DrillId::FaucetStorm => "Random faucet transfers against a small pool, rejected ones change nothing",
            DrillId::BatchRun => "One batch from generation to ALL_COMPLETE, refunds and archive checked",
            DrillId::ScaleCycle => "Deploy 5, reset, deploy 3 and 8 with funded relayers, supply conserved",
            DrillId::BuildDeploy => "Concurrent build and deploy, duplicates rejected, one completion each",
            DrillId::TelemetrySoak => "Heartbeat only: heights monotonic, latency and mempool in bounds",
            DrillId::Churn => "Random users, transfers, batches, executions and resizes interleaved",
        }
    }
}

impl std::fmt::Display for DrillId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Serialize for DrillId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl std::str::FromStr for DrillId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "faucet_storm" | "faucetstorm" | "drl-001" => Ok(DrillId::FaucetStorm),
            "batch_run" | "batchrun" | "drl-002" => Ok(DrillId::BatchRun),
            "scale_cycle" | "scalecycle" | "drl-003" => Ok(DrillId::ScaleCycle),
            "build_deploy" | "builddeploy" | "drl-004" => Ok(DrillId::BuildDeploy),
            "telemetry_soak" | "telemetrysoak" | "drl-005" => Ok(DrillId::TelemetrySoak),
            "churn" | "drl-006" => Ok(DrillId::Churn),
            _ => Err(format!("Unknown drill: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for drill in DrillId::all() {
            assert_eq!(drill.name().parse::<DrillId>(), Ok(drill));
            assert!(!drill.description().is_empty());
        }
    }

    #[test]
    fn test_aliases() {
        assert_eq!("DRL-003".parse::<DrillId>(), Ok(DrillId::ScaleCycle));
        assert_eq!("BatchRun".parse::<DrillId>(), Ok(DrillId::BatchRun));
        assert!("meltdown".parse::<DrillId>().is_err());
    }
}
