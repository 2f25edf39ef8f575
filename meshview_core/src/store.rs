//! Authoritative in-memory state.
//!
//! The store is a plain container; balances are only changed through the
//! [`Ledger`](crate::ledger::Ledger) view, which keeps the supply
//! accounting (`balances + held + consumed == genesis`) intact.

use std::collections::BTreeMap;

use meshview_env::{AccountId, BatchId, RandomSource, ResultId};
use tracing::{debug, info};

use crate::config::TelemetryConfig;
use crate::error::{CoreError, CoreResult};
use crate::model::{
    Account, AccountRole, Amount, ExperimentResult, MempoolGauge, Node, NodeId, NodeKind,
    NodeStatus, ScenarioBatch, ScenarioStatus,
};

pub struct EntityStore {
    faucet: Account,
    relayers: Vec<Account>,
    users: Vec<Account>,
    nodes: Vec<Node>,
    mempool: Vec<MempoolGauge>,
    replica_count: u32,
    batches: Vec<ScenarioBatch>,
    results: Vec<ExperimentResult>,
    genesis_supply: Amount,
    /// Deducted for running executions and not yet refunded or consumed,
    /// per deducted account. Entries outlive a deleted account.
    pub(crate) held: BTreeMap<AccountId, Amount>,
    /// Kept by the network after executions settled.
    pub(crate) consumed: Amount,
}

impl EntityStore {
    /// Mints `genesis_supply` into a fresh faucet source and builds the node
    /// set for `replicas` data nodes.
    pub fn new<R: RandomSource + ?Sized>(
        genesis_supply: Amount,
        replicas: u32,
        telemetry: &TelemetryConfig,
        rng: &mut R,
    ) -> Self {
        let mut faucet = Account::generate(AccountRole::FaucetSource, rng);
        faucet.balance = genesis_supply;
        let mut store = Self {
            faucet,
            relayers: Vec::new(),
            users: Vec::new(),
            nodes: Vec::new(),
            mempool: Vec::new(),
            replica_count: 0,
            batches: Vec::new(),
            results: Vec::new(),
            genesis_supply,
            held: BTreeMap::new(),
            consumed: Amount::ZERO,
        };
        store.resize(replicas, telemetry, rng);
        store
    }

    // ------------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------------

    /// Faucet source first, then relayers, then user accounts in creation
    /// order.
    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        std::iter::once(&self.faucet)
            .chain(self.relayers.iter())
            .chain(self.users.iter())
    }

    pub fn users(&self) -> &[Account] {
        &self.users
    }

    pub fn relayers(&self) -> &[Account] {
        &self.relayers
    }

    pub fn faucet_source(&self) -> &Account {
        &self.faucet
    }

    pub fn account(&self, id: AccountId) -> CoreResult<&Account> {
        self.accounts()
            .find(|a| a.id == id)
            .ok_or(CoreError::AccountNotFound(id))
    }

    pub(crate) fn account_mut(&mut self, id: AccountId) -> CoreResult<&mut Account> {
        if self.faucet.id == id {
            return Ok(&mut self.faucet);
        }
        self.relayers
            .iter_mut()
            .chain(self.users.iter_mut())
            .find(|a| a.id == id)
            .ok_or(CoreError::AccountNotFound(id))
    }

    pub(crate) fn faucet_mut(&mut self) -> &mut Account {
        &mut self.faucet
    }

    pub(crate) fn push_user(&mut self, account: Account) {
        self.users.push(account);
    }

    pub(crate) fn remove_user(&mut self, id: AccountId) -> Option<Account> {
        let pos = self.users.iter().position(|a| a.id == id)?;
        Some(self.users.remove(pos))
    }

    // ------------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------------

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn mempool(&self) -> &[MempoolGauge] {
        &self.mempool
    }

    pub fn replica_count(&self) -> u32 {
        self.replica_count
    }

    pub(crate) fn network_mut(&mut self) -> (&mut [Node], &mut [MempoolGauge]) {
        (&mut self.nodes, &mut self.mempool)
    }

    /// Regenerates the node set, mempool gauges and relayers for `replicas`
    /// data nodes.
    ///
    /// New nodes start at the highest height seen so far. Relayer slot `i`
    /// keeps its balance under a fresh id; slots that disappear are swept
    /// into the faucet source, so total supply is unchanged.
    pub(crate) fn resize<R: RandomSource + ?Sized>(
        &mut self,
        replicas: u32,
        telemetry: &TelemetryConfig,
        rng: &mut R,
    ) {
        let height = self.nodes.iter().map(|n| n.height).max().unwrap_or(0);
        let previous = self.replica_count;

        let mut nodes = Vec::with_capacity(replicas as usize + 2);
        let mut mempool = Vec::with_capacity(replicas as usize);
        nodes.push(fresh_node(NodeId::CONTROL, height, 0, telemetry, rng));
        nodes.push(fresh_node(NodeId::META, height, 0, telemetry, rng));
        for index in 1..=replicas {
            let id = NodeId::data(index);
            let pending = rng.between(0, telemetry.initial_mempool_max as i64) as u64;
            nodes.push(fresh_node(id, height, pending, telemetry, rng));
            mempool.push(MempoolGauge {
                node: id,
                pending_count: pending,
            });
        }

        let old = std::mem::take(&mut self.relayers);
        let mut swept = Amount::ZERO;
        for (slot, relayer) in old.iter().enumerate() {
            if slot >= replicas as usize {
                swept = swept.checked_add(relayer.balance).unwrap_or(swept);
            }
        }
        for slot in 0..replicas as usize {
            let mut relayer = Account::generate(AccountRole::Relayer, rng);
            relayer.balance = old.get(slot).map_or(Amount::ZERO, |r| r.balance);
            self.relayers.push(relayer);
        }
        if !swept.is_zero() {
            // Sum of existing balances already fits in u64, so this cannot overflow.
            self.faucet.balance = self.faucet.balance.checked_add(swept).unwrap_or(self.faucet.balance);
            debug!(swept = %swept, "relayer balances returned to faucet");
        }

        self.nodes = nodes;
        self.mempool = mempool;
        self.replica_count = replicas;
        info!(from = previous, to = replicas, "node set regenerated");
    }

    // ------------------------------------------------------------------------
    // Batches and results
    // ------------------------------------------------------------------------

    pub fn batches(&self) -> &[ScenarioBatch] {
        &self.batches
    }

    pub fn batch(&self, id: BatchId) -> CoreResult<&ScenarioBatch> {
        self.batches
            .iter()
            .find(|b| b.batch_id == id)
            .ok_or(CoreError::BatchNotFound(id))
    }

    pub(crate) fn batch_mut(&mut self, id: BatchId) -> CoreResult<&mut ScenarioBatch> {
        self.batches
            .iter_mut()
            .find(|b| b.batch_id == id)
            .ok_or(CoreError::BatchNotFound(id))
    }

    pub(crate) fn push_batch(&mut self, batch: ScenarioBatch) {
        self.batches.push(batch);
    }

    pub fn results(&self) -> &[ExperimentResult] {
        &self.results
    }

    pub fn result(&self, id: ResultId) -> CoreResult<&ExperimentResult> {
        self.results
            .iter()
            .find(|r| r.id == id)
            .ok_or(CoreError::ResultNotFound(id))
    }

    pub(crate) fn push_result(&mut self, result: ExperimentResult) {
        self.results.push(result);
    }

    pub(crate) fn remove_result(&mut self, id: ResultId) -> CoreResult<ExperimentResult> {
        let pos = self
            .results
            .iter()
            .position(|r| r.id == id)
            .ok_or(CoreError::ResultNotFound(id))?;
        Ok(self.results.remove(pos))
    }

    // ------------------------------------------------------------------------
    // Supply accounting
    // ------------------------------------------------------------------------

    pub fn genesis_supply(&self) -> Amount {
        self.genesis_supply
    }

    /// Sum of every account balance.
    pub fn total_supply(&self) -> Amount {
        self.accounts().map(|a| a.balance).sum()
    }

    /// Total value held across all accounts.
    pub fn held(&self) -> Amount {
        self.held.values().copied().sum()
    }

    /// Value still held from deductions against `id`.
    pub fn held_by(&self, id: AccountId) -> Amount {
        self.held.get(&id).copied().unwrap_or(Amount::ZERO)
    }

    /// Accounts with value held, in id order.
    pub fn holders(&self) -> impl Iterator<Item = (AccountId, Amount)> + '_ {
        self.held.iter().map(|(id, amount)| (*id, *amount))
    }

    pub fn consumed(&self) -> Amount {
        self.consumed
    }

    /// Stores `id`'s held amount, dropping the entry once it reaches zero.
    pub(crate) fn set_held(&mut self, id: AccountId, amount: Amount) {
        if amount.is_zero() {
            self.held.remove(&id);
        } else {
            self.held.insert(id, amount);
        }
    }

    /// Checks the structural invariants and returns every violation found.
    pub fn audit(&self) -> Vec<String> {
        let mut violations = Vec::new();

        let held = self
            .held
            .values()
            .try_fold(Amount::ZERO, |acc, a| acc.checked_add(*a));
        let accounted = held
            .zip(self.total_supply().checked_add(self.consumed))
            .and_then(|(h, rest)| h.checked_add(rest));
        if accounted != Some(self.genesis_supply) {
            violations.push(format!(
                "supply drift: balances {} + held {} + consumed {} != genesis {}",
                self.total_supply(),
                self.held(),
                self.consumed,
                self.genesis_supply
            ));
        }

        if let Some((id, _)) = self.held.iter().find(|(_, amount)| amount.is_zero()) {
            violations.push(format!("empty held entry for {id}"));
        }

        if self.faucet.role != AccountRole::FaucetSource {
            violations.push("faucet source has the wrong role".to_string());
        }
        if let Some(user) = self.users.iter().find(|u| u.role.is_system()) {
            violations.push(format!("user account {} has a system role", user.id));
        }
        if self.relayers.len() != self.replica_count as usize {
            violations.push(format!(
                "{} relayers for {} replicas",
                self.relayers.len(),
                self.replica_count
            ));
        }

        let expected: Vec<NodeId> = [NodeId::CONTROL, NodeId::META]
            .into_iter()
            .chain((1..=self.replica_count).map(NodeId::data))
            .collect();
        let actual: Vec<NodeId> = self.nodes.iter().map(|n| n.id).collect();
        if actual != expected {
            violations.push(format!("node set {actual:?} != {expected:?}"));
        }
        if let Some(node) = self.nodes.iter().find(|n| n.kind != n.id.kind) {
            violations.push(format!("node {} has kind {:?}", node.id, node.kind));
        }
        let gauges: Vec<NodeId> = self.mempool.iter().map(|g| g.node).collect();
        if gauges.as_slice() != &expected[2..] {
            violations.push(format!("mempool gauges {gauges:?} do not match data nodes"));
        }

        for batch in &self.batches {
            let running = batch.count(ScenarioStatus::Running);
            if running > 1 {
                violations.push(format!(
                    "batch {} has {running} RUNNING scenarios",
                    batch.batch_id
                ));
            }
        }
        violations
    }
}

fn fresh_node<R: RandomSource + ?Sized>(
    id: NodeId,
    height: u64,
    pending: u64,
    telemetry: &TelemetryConfig,
    rng: &mut R,
) -> Node {
    let min = telemetry.latency_min_ms;
    let spread = telemetry.latency_max_ms.saturating_sub(min) / 5;
    Node {
        id,
        kind: id.kind,
        status: NodeStatus::Active,
        height,
        pending_tx_count: if id.kind == NodeKind::Data { pending } else { 0 },
        latency_ms: rng.between(min as i64, (min + spread) as i64) as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshview_env::SeededRandom;

    fn store(replicas: u32) -> (EntityStore, SeededRandom) {
        let mut rng = SeededRandom::new(11);
        let store = EntityStore::new(
            Amount::from_tokens(1_000),
            replicas,
            &TelemetryConfig::default(),
            &mut rng,
        );
        (store, rng)
    }

    #[test]
    fn test_initial_shape() {
        let (store, _) = store(3);
        let ids: Vec<String> = store.nodes().iter().map(|n| n.id.to_string()).collect();
        assert_eq!(ids, vec!["control-0", "meta-0", "data-1", "data-2", "data-3"]);
        assert_eq!(store.mempool().len(), 3);
        assert_eq!(store.relayers().len(), 3);
        assert_eq!(store.faucet_source().balance, Amount::from_tokens(1_000));
        assert!(store.audit().is_empty());
    }

    #[test]
    fn test_mempool_mirrors_data_nodes_initially() {
        let (store, _) = store(4);
        for gauge in store.mempool() {
            let node = store.node(gauge.node).unwrap();
            assert_eq!(node.pending_tx_count, gauge.pending_count);
        }
    }

    #[test]
    fn test_resize_to_zero_keeps_control_and_meta() {
        let (mut store, mut rng) = store(5);
        let faucet_before = store.faucet_source().balance;
        store.resize(0, &TelemetryConfig::default(), &mut rng);

        let ids: Vec<NodeId> = store.nodes().iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![NodeId::CONTROL, NodeId::META]);
        assert!(store.mempool().is_empty());
        assert_eq!(store.faucet_source().balance, faucet_before);
        assert!(store.audit().is_empty());
    }

    #[test]
    fn test_resize_carries_and_sweeps_relayer_balances() {
        let (mut store, mut rng) = store(3);
        store.faucet.balance = Amount::from_tokens(940);
        store.relayers[0].balance = Amount::from_tokens(10);
        store.relayers[2].balance = Amount::from_tokens(50);
        let old_id = store.relayers[0].id;

        store.resize(2, &TelemetryConfig::default(), &mut rng);

        assert_eq!(store.relayers().len(), 2);
        assert_ne!(store.relayers()[0].id, old_id);
        assert_eq!(store.relayers()[0].balance, Amount::from_tokens(10));
        assert_eq!(store.faucet_source().balance, Amount::from_tokens(990));
        assert_eq!(store.total_supply(), Amount::from_tokens(1_000));
        assert!(store.audit().is_empty());
    }

    #[test]
    fn test_resize_keeps_height_baseline() {
        let (mut store, mut rng) = store(1);
        store.nodes[2].height = 42;
        store.resize(3, &TelemetryConfig::default(), &mut rng);
        assert!(store.nodes().iter().all(|n| n.height == 42));
    }

    #[test]
    fn test_audit_detects_drift() {
        let (mut store, _) = store(1);
        store.faucet.balance = Amount::from_tokens(1);
        let violations = store.audit();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].starts_with("supply drift"));
    }

    #[test]
    fn test_audit_flags_held_bookkeeping() {
        let (mut store, _) = store(1);
        let holder = AccountId::from_seed(7);
        store.faucet.balance = Amount::from_tokens(990);
        store.held.insert(holder, Amount::from_tokens(10));
        assert!(store.audit().is_empty());
        assert_eq!(store.held(), Amount::from_tokens(10));
        assert_eq!(store.held_by(holder), Amount::from_tokens(10));
        assert_eq!(store.held_by(AccountId::from_seed(8)), Amount::ZERO);

        store.held.insert(AccountId::from_seed(8), Amount::ZERO);
        assert_eq!(store.audit(), vec![format!("empty held entry for {}", AccountId::from_seed(8))]);
    }

    #[test]
    fn test_lookups_report_missing_ids() {
        let (store, _) = store(1);
        let missing = AccountId::from_seed(404);
        assert_eq!(store.account(missing), Err(CoreError::AccountNotFound(missing)));
        assert!(matches!(
            store.batch(BatchId::from_seed(1)),
            Err(CoreError::BatchNotFound(_))
        ));
        assert!(matches!(
            store.result(ResultId::from_seed(1)),
            Err(CoreError::ResultNotFound(_))
        ));
    }
}
