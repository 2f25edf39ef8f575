//! Engine configuration.
//!
//! Every knob has a default, so an empty JSON object is a valid config.

use std::path::Path;
use std::time::Duration;

use meshview_env::EnvError;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::model::Amount;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Data node count at start-up.
    pub replicas: u32,
    /// Upper bound accepted by deploy requests.
    pub max_replicas: u32,
    /// Whole tokens minted into the faucet source at start-up.
    pub genesis_supply_tokens: u64,
    pub telemetry: TelemetryConfig,
    pub scenarios: ScenarioConfig,
    pub jobs: JobConfig,
    pub execution: ExecutionConfig,
    pub economy: EconomyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            replicas: 3,
            max_replicas: 64,
            genesis_supply_tokens: 1_000_000,
            telemetry: TelemetryConfig::default(),
            scenarios: ScenarioConfig::default(),
            jobs: JobConfig::default(),
            execution: ExecutionConfig::default(),
            economy: EconomyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub state_interval_ms: u64,
    pub packet_interval_ms: u64,
    /// Chance an active node grows by one block per state tick.
    pub height_advance_probability: f64,
    pub latency_step_ms: u32,
    pub latency_min_ms: u32,
    pub latency_max_ms: u32,
    pub mempool_step: u64,
    pub initial_mempool_max: u64,
    pub packet_probability: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            state_interval_ms: 1_000,
            packet_interval_ms: 1_000,
            height_advance_probability: 0.7,
            latency_step_ms: 5,
            latency_min_ms: 5,
            latency_max_ms: 500,
            mempool_step: 3,
            initial_mempool_max: 20,
            packet_probability: 0.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Delay between two classified elements.
    pub classify_step_ms: u64,
    pub timeout_probability: f64,
    /// Cost above this share of the budget (basis points) is "near budget".
    pub near_budget_bps: u32,
    /// Chance a near-budget element fails with "insufficient balance".
    pub insufficient_balance_probability: f64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            classify_step_ms: 300,
            timeout_probability: 0.05,
            near_budget_bps: 8_000,
            insufficient_balance_probability: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub build_step_ms: u64,
    pub deploy_initial_delay_ms: u64,
    pub deploy_stagger_ms: u64,
    /// Per-step chance a build aborts. Off by default.
    pub build_failure_probability: f64,
    /// Per-node chance a deploy aborts before committing. Off by default.
    pub deploy_failure_probability: f64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            build_step_ms: 500,
            deploy_initial_delay_ms: 1_000,
            deploy_stagger_ms: 300,
            build_failure_probability: 0.0,
            deploy_failure_probability: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub broadcast_delay_ms: u64,
    pub outcome_delay_ms: u64,
    pub connection_loss_probability: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            broadcast_delay_ms: 1_000,
            outcome_delay_ms: 1_500,
            connection_loss_probability: 0.1,
        }
    }
}

/// Refund policy, in basis points of the estimated cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EconomyConfig {
    /// Share kept when an element fails.
    pub failure_consumed_bps: u32,
    /// Share kept when an element succeeds.
    pub success_actual_bps: u32,
}

impl Default for EconomyConfig {
    fn default() -> Self {
        Self {
            failure_consumed_bps: 1_000,
            success_actual_bps: 8_500,
        }
    }
}

impl EngineConfig {
    /// Parses a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> CoreResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> CoreResult<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn genesis_supply(&self) -> Amount {
        Amount::from_tokens(self.genesis_supply_tokens)
    }

    pub fn validate(&self) -> CoreResult<()> {
        for p in [
            self.telemetry.height_advance_probability,
            self.telemetry.packet_probability,
            self.scenarios.timeout_probability,
            self.scenarios.insufficient_balance_probability,
            self.jobs.build_failure_probability,
            self.jobs.deploy_failure_probability,
            self.execution.connection_loss_probability,
        ] {
            EnvError::check_probability(p)?;
        }
        if self.replicas > self.max_replicas {
            return Err(CoreError::Config(format!(
                "replicas {} exceeds max_replicas {}",
                self.replicas, self.max_replicas
            )));
        }
        if self.telemetry.latency_min_ms > self.telemetry.latency_max_ms {
            return Err(CoreError::Config("latency_min_ms > latency_max_ms".into()));
        }
        if self.telemetry.state_interval_ms == 0 || self.telemetry.packet_interval_ms == 0 {
            return Err(CoreError::Config("telemetry intervals must be non-zero".into()));
        }
        if self.economy.failure_consumed_bps > 10_000 || self.economy.success_actual_bps > 10_000 {
            return Err(CoreError::Config("economy shares are capped at 10000 bps".into()));
        }
        if self.scenarios.near_budget_bps > 10_000 {
            return Err(CoreError::Config("near_budget_bps is capped at 10000".into()));
        }
        Ok(())
    }
}

impl TelemetryConfig {
    pub fn state_interval(&self) -> Duration {
        Duration::from_millis(self.state_interval_ms)
    }

    pub fn packet_interval(&self) -> Duration {
        Duration::from_millis(self.packet_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.genesis_supply(), Amount::from_tokens(1_000_000));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            EngineConfig::from_json_str(r#"{"replicas": 5, "scenarios": {"timeout_probability": 0.0}}"#)
                .unwrap();
        assert_eq!(config.replicas, 5);
        assert_eq!(config.scenarios.timeout_probability, 0.0);
        assert_eq!(config.scenarios.classify_step_ms, 300);
        assert_eq!(config.execution, ExecutionConfig::default());
    }

    #[test]
    fn test_rejects_bad_probability() {
        let err = EngineConfig::from_json_str(r#"{"telemetry": {"packet_probability": 1.5}}"#)
            .unwrap_err();
        assert!(matches!(err, CoreError::Env(EnvError::InvalidProbability(_))));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            EngineConfig::from_json_str("{replicas:"),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_inverted_latency_bounds() {
        let mut config = EngineConfig::default();
        config.telemetry.latency_min_ms = 900;
        assert!(config.validate().is_err());
    }
}
