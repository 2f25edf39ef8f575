//! Drill runner - executes the named drills against a [`SimWorld`].

use std::collections::BTreeSet;
use std::time::Duration;

use meshview_core::jobs::BUILD_STEPS;
use meshview_core::messages::{JobKind, LogKind, ProgressKind, ScenarioUpdateKind};
use meshview_core::model::{ChainId, NodeId, NodeKind};
use meshview_core::topics;
use meshview_core::{
    AccountRole, Amount, Axis, BusMessage, CoreError, EngineConfig, GenerationRequest, JobStart,
    JobState, ScenarioStatus,
};
use meshview_env::{AccountId, BatchId};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::drills::DrillId;
use crate::error::{ensure, SimError, SimResult};
use crate::world::{SimConfig, SimWorld};

/// Results from running a drill.
#[derive(Debug, Clone, Serialize)]
pub struct DrillResult {
    /// Drill that was run
    pub drill: DrillId,

    /// Seed used
    pub seed: u64,

    /// Whether the drill passed all assertions and invariant checks
    pub passed: bool,

    /// Timers dispatched by the engine
    pub dispatched: u64,

    /// Final virtual time in seconds
    pub final_time_secs: f64,

    /// Number of oracle checks performed
    pub oracle_checks: u64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during the run
    pub metrics: DrillMetrics,
}

/// Metrics collected during a drill.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DrillMetrics {
    /// Engine operations issued by the workload
    pub actions: u64,

    /// Operations the engine refused with an error
    pub rejected: u64,

    pub snapshots: usize,
    pub packets: usize,
    pub deploy_logs: usize,
    pub progress_events: usize,

    /// Archived experiment results at the end
    pub results: usize,
    pub succeeded: u32,
    pub failed: u32,

    /// Value consumed by the network, in micro-tokens
    pub consumed_micros: u64,
}

impl DrillResult {
    fn new(drill: DrillId, seed: u64) -> Self {
        Self {
            drill,
            seed,
            passed: true,
            dispatched: 0,
            final_time_secs: 0.0,
            oracle_checks: 0,
            failure_reason: None,
            metrics: DrillMetrics::default(),
        }
    }

    fn fail(&mut self, err: SimError) {
        self.passed = false;
        self.failure_reason = Some(err.to_string());
    }
}

/// Runs drills.
pub struct DrillRunner {
    /// Configuration seed
    seed: u64,

    /// Data node count at start-up
    replicas: u32,

    /// Workload length in virtual seconds
    max_duration_secs: f64,

    engine: EngineConfig,
}

impl DrillRunner {
    /// Creates a new drill runner.
    pub fn new(seed: u64, replicas: u32) -> Self {
        Self {
            seed,
            replicas,
            max_duration_secs: 30.0,
            engine: EngineConfig::default(),
        }
    }

    /// Sets the workload length.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    /// Uses `config` as the base engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.engine = config;
        self
    }

    fn world(&self, drill: DrillId) -> SimResult<SimWorld> {
        let mut engine = self.engine.clone();
        if drill == DrillId::FaucetStorm {
            // Small pool so the storm runs it dry
            engine.genesis_supply_tokens = engine.genesis_supply_tokens.min(1_000);
        }
        SimWorld::new(SimConfig {
            seed: self.seed,
            replicas: self.replicas,
            max_duration_secs: self.max_duration_secs,
            engine,
            ..Default::default()
        })
    }

    /// Runs a drill and returns the result.
    pub fn run(&self, drill: DrillId) -> DrillResult {
        info!("Starting drill: {} (seed={})", drill.name(), self.seed);
        let mut result = DrillResult::new(drill, self.seed);

        let mut world = match self.world(drill) {
            Ok(world) => world,
            Err(err) => {
                result.fail(err);
                return result;
            }
        };

        let mut metrics = DrillMetrics::default();
        let outcome = match drill {
            DrillId::FaucetStorm => run_faucet_storm(&mut world, &mut metrics),
            DrillId::BatchRun => run_batch_run(&mut world, &mut metrics),
            DrillId::ScaleCycle => run_scale_cycle(&mut world, &mut metrics),
            DrillId::BuildDeploy => run_build_deploy(&mut world, &mut metrics),
            DrillId::TelemetrySoak => run_telemetry_soak(&mut world, &mut metrics),
            DrillId::Churn => run_churn(&mut world, &mut metrics),
        }
        .and_then(|()| world.check());

        metrics.snapshots = world.recorder.count(topics::MONITORING);
        metrics.packets = world.recorder.count(topics::MONITORING_PACKETS);
        metrics.deploy_logs = world.recorder.count(topics::DEPLOYMENT_LOGS);
        metrics.progress_events = world.recorder.count(topics::EXPERIMENT_PROGRESS);
        metrics.results = world.engine.results().len();
        metrics.consumed_micros = world.engine.store().consumed().micros();

        result.dispatched = world.engine.dispatched();
        result.final_time_secs = world.now_secs();
        result.oracle_checks = world.oracle.checks();
        result.metrics = metrics;
        if let Err(err) = outcome {
            warn!(drill = %drill, error = %err, "drill failed");
            result.fail(err);
        }
        result
    }
}

// ============================================================================
// DRILLS
// ============================================================================

/// DRL-001: FaucetStorm - random transfers against a small pool.
fn run_faucet_storm(world: &mut SimWorld, m: &mut DrillMetrics) -> SimResult<()> {
    world.engine.start();
    let users = (0..5)
        .map(|_| world.engine.create_user(AccountRole::Client).map(|a| a.id))
        .collect::<Result<Vec<_>, _>>()?;

    ensure!(
        matches!(world.engine.faucet(users[0], Amount::ZERO), Err(CoreError::Validation(_))),
        "zero transfer was accepted"
    );

    let rounds = ((world.config.max_duration_secs * 10.0) as u32).max(20);
    for _ in 0..rounds {
        let target = users[world.workload().gen_range(0..users.len())];
        let amount = Amount::from_tokens(world.workload().gen_range(1..=400));
        let faucet_before = world.engine.store().faucet_source().balance;
        let target_before = world.balance(target)?;

        m.actions += 1;
        match world.engine.faucet(target, amount) {
            Ok(transfer) => {
                ensure!(transfer.amount == amount, "transfer moved {} not {}", transfer.amount, amount);
                ensure!(
                    world.engine.store().faucet_source().balance.checked_add(amount) == Some(faucet_before),
                    "faucet did not drop by {}",
                    amount
                );
                ensure!(
                    target_before.checked_add(amount) == Some(world.balance(target)?),
                    "target did not grow by {}",
                    amount
                );
            }
            Err(CoreError::PoolExhausted { requested, available }) => {
                m.rejected += 1;
                ensure!(
                    requested == amount && available == faucet_before,
                    "exhaustion reported {} of {}, expected {} of {}",
                    requested,
                    available,
                    amount,
                    faucet_before
                );
                ensure!(
                    world.engine.store().faucet_source().balance == faucet_before
                        && world.balance(target)? == target_before,
                    "rejected transfer changed balances"
                );
            }
            Err(other) => return Err(other.into()),
        }
        world.run_for(Duration::from_millis(100))?;
    }

    ensure!(m.rejected > 0, "pool of {} never ran dry", world.engine.store().genesis_supply());
    ensure!(
        world.engine.store().total_supply() == world.engine.store().genesis_supply(),
        "balances no longer add up to genesis"
    );
    Ok(())
}

fn drill_request(account: AccountId) -> GenerationRequest {
    GenerationRequest {
        project: "drill".to_string(),
        account,
        data_size_mb: Axis::List(vec![100, 200]),
        chunk_size_kb: Axis::Range {
            start: 128,
            end: 256,
            step: 128,
        },
        allocators: vec!["round_robin".to_string(), "greedy".to_string()],
        transmitters: vec!["direct".to_string()],
        target_chains: [ChainId(1), ChainId(2)].into_iter().collect(),
    }
}

/// DRL-002: BatchRun - one batch from generation to ALL_COMPLETE.
fn run_batch_run(world: &mut SimWorld, m: &mut DrillMetrics) -> SimResult<()> {
    world.engine.start();
    let user = world.funded_user(1_000)?;
    let batch_id = world.engine.generate_batch(drill_request(user))?;
    m.actions += 1;

    let batch = world.engine.batch(batch_id)?;
    let total = batch.scenarios.len();
    ensure!(total == 8, "expected 8 scenarios, got {}", total);
    let ids: BTreeSet<&str> = batch.scenarios.iter().map(|s| s.unique_id.as_str()).collect();
    ensure!(ids.len() == total, "unique ids collide");
    ensure!(
        batch.scenarios.iter().zip(1u32..).all(|(s, seq)| s.sequence_id == seq),
        "sequence ids are not 1..={}",
        total
    );

    ensure!(world.settle(Duration::from_secs(30))?, "classification did not finish");
    let batch = world.engine.batch(batch_id)?;
    let ready = batch.count(ScenarioStatus::Ready);
    let rejected = batch.count(ScenarioStatus::Fail);
    ensure!(ready + rejected == total, "classification left elements behind");

    let classified = world
        .recorder
        .on_exact(&topics::experiment_scenarios(batch_id))
        .into_iter()
        .filter_map(|msg| match msg {
            BusMessage::Scenario(u) if u.kind == Some(ScenarioUpdateKind::Classified) => Some(u),
            _ => None,
        })
        .collect::<Vec<_>>();
    ensure!(classified.len() == 1, "{} classified notifications", classified.len());
    ensure!(
        classified[0].total == Some(total as u32) && classified[0].failed == Some(rejected as u32),
        "classified notification disagrees with the batch"
    );

    if ready == 0 {
        info!("no READY scenarios for seed {}, skipping execution", world.config.seed);
        return Ok(());
    }

    let before = world.balance(user)?;
    let cost = batch.ready_cost();
    let exec = world.engine.execute_batch(batch_id)?;
    m.actions += 1;
    ensure!(
        before.checked_sub(cost) == Some(world.balance(user)?),
        "execution did not hold {}",
        cost
    );
    ensure!(
        matches!(world.engine.execute_batch(batch_id), Err(CoreError::Validation(_))),
        "second execution of the same batch was accepted"
    );
    m.rejected += 1;

    ensure!(world.settle(Duration::from_secs(120))?, "execution did not finish");

    let done = world
        .recorder
        .on_exact(&topics::experiment_progress(exec))
        .into_iter()
        .filter_map(|msg| match msg {
            BusMessage::Experiment(p) if p.kind == Some(ProgressKind::AllComplete) => Some(p),
            _ => None,
        })
        .collect::<Vec<_>>();
    ensure!(done.len() == 1, "{} ALL_COMPLETE messages", done.len());
    let succeeded = done[0].succeeded.unwrap_or(0);
    let failed = done[0].failed.unwrap_or(0);
    ensure!(
        (succeeded + failed) as usize == ready,
        "{} + {} outcomes for {} READY scenarios",
        succeeded,
        failed,
        ready
    );
    m.succeeded = succeeded;
    m.failed = failed;

    let results: Vec<_> = world
        .engine
        .results()
        .iter()
        .filter(|r| r.execution_id == exec)
        .collect();
    ensure!(results.len() == ready, "{} results for {} executed", results.len(), ready);
    ensure!(
        results.windows(2).all(|w| w[0].finished_at_ms <= w[1].started_at_ms),
        "results overlap in time"
    );
    let charged: Amount = results.iter().map(|r| r.charged).sum();
    ensure!(
        before.checked_sub(charged) == Some(world.balance(user)?),
        "account was charged more than its results say"
    );
    ensure!(world.engine.store().held().is_zero(), "value still held after completion");
    ensure!(world.engine.store().consumed() == charged, "consumed differs from charges");
    Ok(())
}

/// Deploys `replicas` and waits for the job to finish.
fn deploy_and_wait(world: &mut SimWorld, replicas: u32, m: &mut DrillMetrics) -> SimResult<()> {
    let start = world.engine.deploy(replicas)?;
    m.actions += 1;
    ensure!(start.is_started(), "deploy of {} did not start", replicas);
    ensure!(world.settle(Duration::from_secs(60))?, "deploy of {} did not finish", replicas);
    ensure!(
        world.engine.job_state(JobKind::Deploy) == JobState::Complete,
        "deploy of {} ended as {:?}",
        replicas,
        world.engine.job_state(JobKind::Deploy)
    );
    let store = world.engine.store();
    ensure!(
        store.replica_count() == replicas && store.nodes().len() == replicas as usize + 2,
        "{} nodes after deploying {} replicas",
        store.nodes().len(),
        replicas
    );
    Ok(())
}

/// DRL-003: ScaleCycle - resize with and without funded relayers.
fn run_scale_cycle(world: &mut SimWorld, m: &mut DrillMetrics) -> SimResult<()> {
    world.engine.start();
    deploy_and_wait(world, 5, m)?;

    let faucet = world.engine.store().faucet_source().balance;
    world.engine.reset();
    m.actions += 1;
    let store = world.engine.store();
    let ids: Vec<NodeId> = store.nodes().iter().map(|n| n.id).collect();
    ensure!(ids == [NodeId::CONTROL, NodeId::META], "reset left {:?}", ids);
    ensure!(store.relayers().is_empty(), "reset left relayers behind");
    ensure!(store.faucet_source().balance == faucet, "reset moved faucet funds");
    world.run_for(Duration::from_secs(1))?;

    deploy_and_wait(world, 3, m)?;
    let stake = Amount::from_tokens(10);
    let relayers: Vec<AccountId> = world.engine.store().relayers().iter().map(|r| r.id).collect();
    for relayer in relayers {
        world.engine.faucet(relayer, stake)?;
        m.actions += 1;
    }

    deploy_and_wait(world, 8, m)?;
    let balances: Vec<Amount> = world.engine.store().relayers().iter().map(|r| r.balance).collect();
    ensure!(
        balances[..3].iter().all(|b| *b == stake) && balances[3..].iter().all(|b| b.is_zero()),
        "relayer balances did not carry over: {:?}",
        balances
    );

    let faucet = world.engine.store().faucet_source().balance;
    deploy_and_wait(world, 1, m)?;
    let store = world.engine.store();
    ensure!(
        faucet.checked_add(Amount::from_tokens(20)) == Some(store.faucet_source().balance),
        "two dropped relayer stakes were not swept to the faucet"
    );
    ensure!(store.relayers()[0].balance == stake, "surviving relayer lost its stake");

    let rest = world.config.duration().saturating_sub(world.engine.now());
    world.run_for(rest)?;
    Ok(())
}

/// DRL-004: BuildDeploy - concurrent jobs with duplicate requests.
fn run_build_deploy(world: &mut SimWorld, m: &mut DrillMetrics) -> SimResult<()> {
    world.engine.start();
    let replicas = (world.config.replicas + 1).min(world.engine.config().max_replicas);

    let build = world.engine.build_image();
    ensure!(build.is_started(), "build did not start");
    let again = world.engine.build_image();
    ensure!(again == JobStart::AlreadyRunning(build.job_id()), "duplicate build answered {:?}", again);

    let deploy = world.engine.deploy(replicas)?;
    ensure!(deploy.is_started(), "deploy did not start");
    let again = world.engine.deploy(1)?;
    ensure!(again == JobStart::AlreadyRunning(deploy.job_id()), "duplicate deploy answered {:?}", again);
    let too_many = world.engine.config().max_replicas + 1;
    ensure!(
        matches!(world.engine.deploy(too_many), Err(CoreError::Validation(_))),
        "deploy of {} replicas was accepted",
        too_many
    );
    m.actions += 5;
    m.rejected += 3;

    ensure!(world.settle(Duration::from_secs(60))?, "jobs did not finish");
    ensure!(world.engine.job_state(JobKind::Build) == JobState::Complete, "build did not complete");
    ensure!(world.engine.job_state(JobKind::Deploy) == JobState::Complete, "deploy did not complete");

    let logs = |topic: String| -> Vec<(LogKind, Option<String>)> {
        world
            .recorder
            .on_exact(&topic)
            .into_iter()
            .filter_map(|msg| msg.as_deployment().map(|l| (l.kind, l.message.clone())))
            .collect()
    };

    let build_logs = logs(topics::deployment_logs(build.job_id()));
    ensure!(
        build_logs.len() == BUILD_STEPS.len() + 1,
        "build produced {} log messages",
        build_logs.len()
    );
    ensure!(
        build_logs.last().map(|l| l.0) == Some(LogKind::Complete),
        "build log does not end with completion"
    );

    let deploy_logs = logs(topics::deployment_logs(deploy.job_id()));
    let completions = deploy_logs.iter().filter(|l| l.0 == LogKind::Complete).count();
    ensure!(completions == 1, "deploy completed {} times", completions);
    let first = deploy_logs.first().and_then(|l| l.1.clone());
    ensure!(
        first == Some(format!("Initiating deployment of {replicas} replicas")),
        "deploy log starts with {:?}",
        first
    );
    let scheduled = deploy_logs
        .iter()
        .filter(|l| l.1.as_deref().is_some_and(|s| s.starts_with("Scheduled replica on")))
        .count();
    ensure!(scheduled == replicas as usize + 2, "{} nodes scheduled", scheduled);
    ensure!(world.engine.store().replica_count() == replicas, "replica count not committed");

    // A finished job frees its slot
    let rebuild = world.engine.build_image();
    m.actions += 1;
    ensure!(
        rebuild.is_started() && rebuild.job_id() != build.job_id(),
        "rebuild answered {:?}",
        rebuild
    );
    ensure!(world.settle(Duration::from_secs(60))?, "rebuild did not finish");
    Ok(())
}

/// DRL-005: TelemetrySoak - heartbeat only.
fn run_telemetry_soak(world: &mut SimWorld, m: &mut DrillMetrics) -> SimResult<()> {
    ensure!(world.engine.start(), "heartbeat did not start");
    ensure!(!world.engine.start(), "heartbeat started twice");
    m.actions += 2;

    let duration = world.config.duration();
    world.run_for(duration)?;

    let interval = world.engine.config().telemetry.state_interval_ms.max(1);
    let expected = 1 + (duration.as_millis() as u64 / interval) as usize;
    let snapshots: Vec<_> = world
        .recorder
        .envelopes(topics::MONITORING)
        .into_iter()
        .filter_map(|e| e.message.as_monitoring().cloned())
        .collect();
    ensure!(
        snapshots.len() == expected,
        "{} snapshots in {:?}, expected {}",
        snapshots.len(),
        duration,
        expected
    );
    ensure!(
        snapshots.windows(2).all(|w| w[0].timestamp_ms < w[1].timestamp_ms),
        "snapshot timestamps are not increasing"
    );
    for snapshot in &snapshots {
        for gauge in &snapshot.mempool {
            let node = snapshot.nodes.iter().find(|n| n.id == gauge.node);
            ensure!(
                node.map(|n| n.pending_tx_count) == Some(gauge.pending_count),
                "mempool gauge of {} does not match its node",
                gauge.node
            );
        }
    }

    let replicas = world.engine.store().replica_count();
    for envelope in world.recorder.envelopes(topics::MONITORING_PACKETS) {
        let Some(packet) = envelope.message.as_packet() else {
            continue;
        };
        ensure!(
            packet.from == NodeId::CONTROL
                && packet.to.kind == NodeKind::Data
                && (1..=replicas).contains(&packet.to.index),
            "packet {} -> {} outside the topology",
            packet.from,
            packet.to
        );
    }

    world.engine.shutdown();
    let before = world.recorder.count(topics::MONITORING);
    world.run_for(Duration::from_secs(5))?;
    ensure!(
        world.recorder.count(topics::MONITORING) == before,
        "snapshots kept coming after shutdown"
    );

    ensure!(world.engine.start(), "heartbeat did not restart");
    world.run_for(Duration::from_millis(interval))?;
    ensure!(
        world.recorder.count(topics::MONITORING) == before + 2,
        "restart did not publish a fresh snapshot and a tick"
    );
    Ok(())
}

/// DRL-006: Churn - every operation, randomly interleaved.
fn run_churn(world: &mut SimWorld, m: &mut DrillMetrics) -> SimResult<()> {
    world.engine.start();
    for _ in 0..3 {
        world.funded_user(200)?;
    }
    let mut batches: Vec<BatchId> = Vec::new();
    let deadline = world.config.duration();

    while world.engine.now() < deadline {
        let action = world.workload().gen_range(0..9);
        let users: Vec<AccountId> = world.engine.store().users().iter().map(|u| u.id).collect();
        let user = users.choose(world.workload()).copied();
        m.actions += 1;

        let outcome: Result<(), CoreError> = match (action, user) {
            (0, _) | (_, None) => world.engine.create_user(AccountRole::Client).map(drop),
            (1, Some(id)) if users.len() > 1 => world.engine.delete_user(id).map(drop),
            (2, Some(id)) => {
                let amount = Amount::from_tokens(world.workload().gen_range(1..=100));
                world.engine.faucet(id, amount).map(drop)
            }
            (3, Some(id)) => {
                let mut request = drill_request(id);
                request.data_size_mb = Axis::Fixed(world.workload().gen_range(10..=100));
                world.engine.generate_batch(request).map(|b| batches.push(b))
            }
            (4, _) | (5, _) if !batches.is_empty() => {
                let batch = batches[world.workload().gen_range(0..batches.len())];
                world.engine.execute_batch(batch).map(drop)
            }
            (6, _) if !batches.is_empty() => {
                let batch = batches[world.workload().gen_range(0..batches.len())];
                let seq = world.workload().gen_range(1..=4);
                world.engine.reprocess(batch, seq)
            }
            (7, _) => {
                let replicas = world.workload().gen_range(0..=6);
                world.engine.deploy(replicas).map(drop)
            }
            (8, _) => {
                world.engine.build_image();
                Ok(())
            }
            _ => Ok(()),
        };

        match outcome {
            Ok(()) => {}
            Err(err @ (CoreError::Overflow | CoreError::Env(_) | CoreError::Config(_))) => {
                return Err(err.into())
            }
            Err(err) => {
                debug!(action, error = %err, "churn operation refused");
                m.rejected += 1;
            }
        }
        world.run_for(Duration::from_millis(250))?;
    }

    ensure!(world.settle(Duration::from_secs(300))?, "churn did not quiesce");
    ensure!(world.engine.store().held().is_zero(), "value still held after churn");
    m.succeeded = world
        .engine
        .results()
        .iter()
        .filter(|r| r.status == ScenarioStatus::Complete)
        .count() as u32;
    m.failed = world.engine.results().len() as u32 - m.succeeded;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_faucet_storm_drill() {
        let result = DrillRunner::new(42, 3).with_duration(2.0).run(DrillId::FaucetStorm);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.rejected > 0);
        assert!(result.oracle_checks > 0);
    }

    #[test]
    fn test_batch_run_drill() {
        let result = DrillRunner::new(42, 3).with_duration(5.0).run(DrillId::BatchRun);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(
            result.metrics.results,
            (result.metrics.succeeded + result.metrics.failed) as usize
        );
    }

    #[test]
    fn test_scale_cycle_drill() {
        let result = DrillRunner::new(42, 3).with_duration(5.0).run(DrillId::ScaleCycle);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.snapshots > 4);
    }

    #[test]
    fn test_build_deploy_drill() {
        let result = DrillRunner::new(42, 3).with_duration(5.0).run(DrillId::BuildDeploy);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.deploy_logs > BUILD_STEPS.len());
    }

    #[test]
    fn test_telemetry_soak_drill() {
        let result = DrillRunner::new(42, 3).with_duration(5.0).run(DrillId::TelemetrySoak);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.snapshots, 6 + 2);
    }

    #[test]
    fn test_churn_drill() {
        let result = DrillRunner::new(42, 3).with_duration(20.0).run(DrillId::Churn);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.actions > 0);
    }

    #[test]
    fn test_churn_deterministic() {
        // Same seed, same run
        let a = DrillRunner::new(7, 2).with_duration(10.0).run(DrillId::Churn);
        let b = DrillRunner::new(7, 2).with_duration(10.0).run(DrillId::Churn);
        assert_eq!(a.dispatched, b.dispatched);
        assert_eq!(a.metrics.rejected, b.metrics.rejected);
        assert_eq!(a.metrics.consumed_micros, b.metrics.consumed_micros);
    }

    #[test]
    fn test_invalid_config_fails_the_drill() {
        let config = EngineConfig {
            replicas: 100,
            max_replicas: 4,
            ..Default::default()
        };
        let result = DrillRunner::new(1, 100).with_config(config).run(DrillId::TelemetrySoak);
        assert!(!result.passed);
        assert!(result.failure_reason.is_some());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn prop_churn_keeps_invariants(seed in 1u64..10_000) {
            let result = DrillRunner::new(seed, 2).with_duration(8.0).run(DrillId::Churn);
            prop_assert!(result.passed, "{:?}", result.failure_reason);
        }
    }
}
