//! Domain model: accounts, nodes, scenarios and archived results.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use meshview_env::{AccountId, BatchId, ExecutionId, RandomSource, ResultId};
use serde::{Deserialize, Serialize};

// ============================================================================
// AMOUNT
// ============================================================================

/// Non-negative token amount in micro-tokens (1 token = 1 000 000 micro).
///
/// There is no way to build a negative amount, and every arithmetic helper
/// is checked, so a balance can never go below zero silently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);
    pub const MICROS_PER_TOKEN: u64 = 1_000_000;

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Whole tokens. Saturates at `u64::MAX` micro-tokens.
    pub const fn from_tokens(tokens: u64) -> Self {
        Self(tokens.saturating_mul(Self::MICROS_PER_TOKEN))
    }

    pub const fn micros(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    /// `self × bps / 10 000`, rounded down.
    pub fn basis_points(self, bps: u32) -> Amount {
        let scaled = self.0 as u128 * bps as u128 / 10_000;
        Amount(scaled.min(u64::MAX as u128) as u64)
    }

    /// Lossy conversion for display and metrics.
    pub fn as_tokens_f64(self) -> f64 {
        self.0 as f64 / Self::MICROS_PER_TOKEN as f64
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06}",
            self.0 / Self::MICROS_PER_TOKEN,
            self.0 % Self::MICROS_PER_TOKEN
        )
    }
}

impl FromStr for Amount {
    type Err = String;

    /// Parses a decimal token amount such as `"12"` or `"0.25"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(format!("invalid amount: {s:?}"));
        }
        if frac.len() > 6 {
            return Err(format!("amount {s:?} has more than 6 decimal places"));
        }
        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| format!("invalid amount: {s:?}"))?
        };
        let frac_micros: u64 = if frac.is_empty() {
            0
        } else {
            let digits: u64 = frac.parse().map_err(|_| format!("invalid amount: {s:?}"))?;
            digits * 10u64.pow(6 - frac.len() as u32)
        };
        whole
            .checked_mul(Self::MICROS_PER_TOKEN)
            .and_then(|m| m.checked_add(frac_micros))
            .map(Amount)
            .ok_or_else(|| format!("amount {s:?} overflows"))
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        Amount(iter.map(|a| a.0).fold(0u64, u64::saturating_add))
    }
}

// ============================================================================
// ACCOUNTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountRole {
    Client,
    Admin,
    FaucetSource,
    Relayer,
}

impl AccountRole {
    /// System accounts are owned by the engine and cannot be deleted.
    pub fn is_system(self) -> bool {
        matches!(self, AccountRole::FaucetSource | AccountRole::Relayer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Display identifier, `0x` followed by 40 hex digits.
    pub address: String,
    pub balance: Amount,
    pub role: AccountRole,
}

impl Account {
    pub(crate) fn generate<R: RandomSource + ?Sized>(role: AccountRole, rng: &mut R) -> Self {
        Self {
            id: AccountId::generate(rng),
            address: generate_address(rng),
            balance: Amount::ZERO,
            role,
        }
    }
}

/// Random `0x`-prefixed 20-byte hex address.
pub fn generate_address<R: RandomSource + ?Sized>(rng: &mut R) -> String {
    let mut bytes = [0u8; 20];
    rng.fill_bytes(&mut bytes);
    let mut address = String::with_capacity(42);
    address.push_str("0x");
    for b in bytes {
        address.push_str(&format!("{b:02x}"));
    }
    address
}

// ============================================================================
// NODES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Control,
    Meta,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Inactive,
    Error,
}

/// Node identity, rendered as `control-0`, `meta-0`, `data-1` .. `data-N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct NodeId {
    pub kind: NodeKind,
    pub index: u32,
}

impl NodeId {
    pub const CONTROL: NodeId = NodeId {
        kind: NodeKind::Control,
        index: 0,
    };
    pub const META: NodeId = NodeId {
        kind: NodeKind::Meta,
        index: 0,
    };

    /// Data node ids are 1-based.
    pub const fn data(index: u32) -> Self {
        Self {
            kind: NodeKind::Data,
            index,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            NodeKind::Control => "control",
            NodeKind::Meta => "meta",
            NodeKind::Data => "data",
        };
        write!(f, "{prefix}-{}", self.index)
    }
}

impl FromStr for NodeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, index) = s
            .rsplit_once('-')
            .ok_or_else(|| format!("invalid node id: {s:?}"))?;
        let kind = match prefix {
            "control" => NodeKind::Control,
            "meta" => NodeKind::Meta,
            "data" => NodeKind::Data,
            _ => return Err(format!("unknown node kind in {s:?}")),
        };
        let index = index
            .parse()
            .map_err(|_| format!("invalid node index in {s:?}"))?;
        Ok(NodeId { kind, index })
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for NodeId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub status: NodeStatus,
    pub height: u64,
    pub pending_tx_count: u64,
    pub latency_ms: u32,
}

/// Pending-transaction gauge of one data node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MempoolGauge {
    pub node: NodeId,
    pub pending_count: u64,
}

// ============================================================================
// SCENARIOS
// ============================================================================

/// Target chain of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u32);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioStatus {
    Pending,
    Ready,
    Running,
    Complete,
    Fail,
}

impl ScenarioStatus {
    /// `COMPLETE` and `FAIL` end an execution.
    pub fn is_terminal(self) -> bool {
        matches!(self, ScenarioStatus::Complete | ScenarioStatus::Fail)
    }
}

impl fmt::Display for ScenarioStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScenarioStatus::Pending => "PENDING",
            ScenarioStatus::Ready => "READY",
            ScenarioStatus::Running => "RUNNING",
            ScenarioStatus::Complete => "COMPLETE",
            ScenarioStatus::Fail => "FAIL",
        };
        f.write_str(s)
    }
}

/// Why a scenario ended in `FAIL`. Simulated outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    SimulatedTimeout,
    SimulatedInsufficientBalance,
    ConnectionLost,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::SimulatedTimeout => "system timeout",
            FailureReason::SimulatedInsufficientBalance => "insufficient balance",
            FailureReason::ConnectionLost => "connection lost",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioDescriptor {
    /// 1-based position in product order.
    pub sequence_id: u32,
    /// `<project>-<batch short id>-<seq:03>`.
    pub unique_id: String,
    #[serde(rename = "dataSizeMB")]
    pub data_size_mb: u64,
    #[serde(rename = "chunkSizeKB")]
    pub chunk_size_kb: u64,
    pub allocator_strategy: String,
    pub transmitter_strategy: String,
    pub target_chain_ids: BTreeSet<ChainId>,
    pub budget_limit: Amount,
    pub estimated_cost: Amount,
    pub status: ScenarioStatus,
    pub failure_reason: Option<FailureReason>,
    pub log_lines: Vec<String>,
}

impl ScenarioDescriptor {
    pub(crate) fn log(&mut self, line: impl Into<String>) {
        self.log_lines.push(line.into());
    }
}

/// One generation run: every descriptor shares account, chains and budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioBatch {
    pub batch_id: BatchId,
    pub project: String,
    pub account: AccountId,
    pub created_at_ms: u64,
    pub scenarios: Vec<ScenarioDescriptor>,
}

impl ScenarioBatch {
    pub fn scenario(&self, sequence_id: u32) -> Option<&ScenarioDescriptor> {
        self.scenarios.iter().find(|s| s.sequence_id == sequence_id)
    }

    pub(crate) fn scenario_mut(&mut self, sequence_id: u32) -> Option<&mut ScenarioDescriptor> {
        self.scenarios
            .iter_mut()
            .find(|s| s.sequence_id == sequence_id)
    }

    pub fn count(&self, status: ScenarioStatus) -> usize {
        self.scenarios.iter().filter(|s| s.status == status).count()
    }

    /// Sum of estimated costs of the `READY` elements.
    pub fn ready_cost(&self) -> Amount {
        self.scenarios
            .iter()
            .filter(|s| s.status == ScenarioStatus::Ready)
            .map(|s| s.estimated_cost)
            .sum()
    }
}

// ============================================================================
// RESULTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub upload_ms: u64,
    pub download_ms: u64,
    pub throughput_mbps: f64,
}

impl PerformanceMetrics {
    /// Derives the metrics of a finished element.
    ///
    /// Upload takes three fifths of the elapsed time and download the rest.
    /// A failed element never downloaded anything and has zero throughput.
    pub fn derive(data_size_mb: u64, elapsed_ms: u64, succeeded: bool) -> Self {
        let upload_ms = elapsed_ms * 3 / 5;
        if !succeeded {
            return Self {
                upload_ms,
                download_ms: 0,
                throughput_mbps: 0.0,
            };
        }
        let throughput_mbps = if elapsed_ms == 0 {
            0.0
        } else {
            data_size_mb as f64 / (elapsed_ms as f64 / 1000.0)
        };
        Self {
            upload_ms,
            download_ms: elapsed_ms - upload_ms,
            throughput_mbps,
        }
    }
}

/// Immutable archive record of one terminal scenario execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentResult {
    pub id: ResultId,
    pub batch_id: BatchId,
    pub sequence_id: u32,
    pub scenario_id: String,
    pub execution_id: ExecutionId,
    pub project: String,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub status: ScenarioStatus,
    pub failure_reason: Option<FailureReason>,
    #[serde(rename = "dataSizeMB")]
    pub data_size_mb: u64,
    #[serde(rename = "chunkSizeKB")]
    pub chunk_size_kb: u64,
    pub allocator_strategy: String,
    pub transmitter_strategy: String,
    pub chains: Vec<ChainId>,
    /// Estimated cost minus the refund.
    pub charged: Amount,
    pub metrics: PerformanceMetrics,
}
