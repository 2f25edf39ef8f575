//! The engine: one owner for the store, the bus and every timer.
//!
//! Callers mutate state only through the engine's operations. Everything
//! that happens later is a [`Timer`] value queued on the engine's
//! [`Scheduler`]; the owner decides when time moves by calling
//! [`Engine::advance_by`], [`Engine::advance_to`] or [`Engine::step`].
//! Timers are dispatched one at a time in `(due, insertion)` order.

use std::collections::BTreeMap;
use std::time::Duration;

use meshview_env::{
    AccountId, BatchId, ExecutionId, JobId, RandomSource, ResultId, Scheduler, SeededRandom,
    VirtualScheduler,
};
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::execution::{ExecStep, ExecutionRun};
use crate::jobs::{DeployPhase, JobTracker};
use crate::ledger::{Ledger, Transfer};
use crate::messages::{BusMessage, JobKind, MonitoringSnapshot, ScenarioUpdate};
use crate::model::{
    Account, AccountRole, Amount, ExperimentResult, FailureReason, ScenarioBatch, ScenarioStatus,
};
use crate::scenario::{self, ClassificationRun, GenerationRequest};
use crate::store::EntityStore;
use crate::telemetry::{self, Heartbeat};
use crate::topics;

/// A deferred continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    StateTick { generation: u64 },
    PacketTick { generation: u64 },
    Classify { run: u64 },
    Build { job: JobId, step: usize },
    Deploy { job: JobId, phase: DeployPhase },
    Execution { exec: ExecutionId, step: ExecStep },
}

pub struct Engine<R = SeededRandom, S = VirtualScheduler<Timer>> {
    pub(crate) config: EngineConfig,
    pub(crate) store: EntityStore,
    pub(crate) bus: EventBus,
    pub(crate) scheduler: S,
    pub(crate) rng: R,
    pub(crate) heartbeat: Heartbeat,
    pub(crate) jobs: JobTracker,
    pub(crate) classifications: BTreeMap<u64, ClassificationRun>,
    pub(crate) executions: BTreeMap<ExecutionId, ExecutionRun>,
    next_classification: u64,
    dispatched: u64,
}

impl<R: RandomSource> Engine<R, VirtualScheduler<Timer>> {
    /// Creates an engine on virtual time.
    pub fn new(config: EngineConfig, rng: R) -> CoreResult<Self> {
        Self::with_scheduler(config, rng, VirtualScheduler::new())
    }
}

impl<R: RandomSource, S: Scheduler<Timer>> Engine<R, S> {
    /// Creates an engine on a caller-provided scheduler.
    ///
    /// The heartbeat is not running until [`Engine::start`] is called.
    pub fn with_scheduler(config: EngineConfig, mut rng: R, scheduler: S) -> CoreResult<Self> {
        config.validate()?;
        let store = EntityStore::new(
            config.genesis_supply(),
            config.replicas,
            &config.telemetry,
            &mut rng,
        );
        let bus = EventBus::new();
        bus.declare_stateful(topics::MONITORING);
        info!(
            replicas = config.replicas,
            genesis = %config.genesis_supply(),
            "engine created"
        );
        Ok(Self {
            config,
            store,
            bus,
            scheduler,
            rng,
            heartbeat: Heartbeat::default(),
            jobs: JobTracker::default(),
            classifications: BTreeMap::new(),
            executions: BTreeMap::new(),
            next_classification: 0,
            dispatched: 0,
        })
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// The bus. Clone it to subscribe from elsewhere.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Direct access to the random source, for tests and drills that pin
    /// outcomes.
    pub fn rng_mut(&mut self) -> &mut R {
        &mut self.rng
    }

    pub fn now(&self) -> Duration {
        self.scheduler.now()
    }

    pub fn now_ms(&self) -> u64 {
        self.scheduler.now().as_millis() as u64
    }

    pub fn next_due(&self) -> Option<Duration> {
        self.scheduler.next_due()
    }

    pub fn pending_timers(&self) -> usize {
        self.scheduler.pending()
    }

    /// Timers dispatched since creation.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// No job, classification or execution is in flight. Heartbeat ticks
    /// do not count.
    pub fn is_quiescent(&self) -> bool {
        self.classifications.is_empty()
            && self.executions.is_empty()
            && !self.jobs.is_running(JobKind::Build)
            && !self.jobs.is_running(JobKind::Deploy)
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Starts the telemetry heartbeat and publishes an initial snapshot.
    /// Returns `false` if it was already running.
    pub fn start(&mut self) -> bool {
        if self.heartbeat.is_running() {
            return false;
        }
        let generation = self.heartbeat.start();
        self.publish_snapshot();
        self.schedule(
            self.config.telemetry.state_interval(),
            Timer::StateTick { generation },
        );
        self.schedule(
            self.config.telemetry.packet_interval(),
            Timer::PacketTick { generation },
        );
        info!(generation, "heartbeat started");
        true
    }

    /// Stops the heartbeat. Outstanding ticks become no-ops.
    pub fn shutdown(&mut self) {
        if self.heartbeat.is_running() {
            self.heartbeat.stop();
            info!("heartbeat stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.heartbeat.is_running()
    }

    // ========================================================================
    // ACCOUNTS
    // ========================================================================

    pub fn create_user(&mut self, role: AccountRole) -> CoreResult<Account> {
        Ledger::new(&mut self.store).create_user(role, &mut self.rng)
    }

    pub fn delete_user(&mut self, id: AccountId) -> CoreResult<Account> {
        Ledger::new(&mut self.store).delete_user(id)
    }

    pub fn faucet(&mut self, target: AccountId, amount: Amount) -> CoreResult<Transfer> {
        Ledger::new(&mut self.store).faucet(target, amount)
    }

    // ========================================================================
    // SCENARIOS
    // ========================================================================

    /// Expands `request` into a new batch and starts classifying it.
    ///
    /// The budget of every element is the account balance at this moment.
    pub fn generate_batch(&mut self, request: GenerationRequest) -> CoreResult<BatchId> {
        request.validate()?;
        let budget = self.store.account(request.account)?.balance;
        let batch_id = BatchId::generate(&mut self.rng);
        let batch = scenario::expand(&request, batch_id, budget, self.now_ms())?;
        let sequence_ids: Vec<u32> = batch.scenarios.iter().map(|s| s.sequence_id).collect();
        info!(
            batch = %batch_id,
            project = %batch.project,
            scenarios = sequence_ids.len(),
            budget = %budget,
            "batch generated"
        );
        self.store.push_batch(batch);
        self.begin_classification(batch_id, sequence_ids);
        Ok(batch_id)
    }

    /// Sends one element back through classification.
    pub fn reprocess(&mut self, batch_id: BatchId, sequence_id: u32) -> CoreResult<()> {
        let descriptor = self
            .store
            .batch_mut(batch_id)?
            .scenario_mut(sequence_id)
            .ok_or(CoreError::ScenarioNotFound {
                batch: batch_id,
                sequence_id,
            })?;
        scenario::reset_for_reprocess(descriptor)?;
        self.bus.publish(
            &topics::experiment_scenarios(batch_id),
            BusMessage::Scenario(ScenarioUpdate::element(
                batch_id,
                sequence_id,
                ScenarioStatus::Pending,
                None,
            )),
        );
        self.begin_classification(batch_id, [sequence_id]);
        Ok(())
    }

    /// Reclassifies every `FAIL` element. Returns how many were queued.
    pub fn recalculate_all(&mut self, batch_id: BatchId) -> CoreResult<usize> {
        let batch = self.store.batch_mut(batch_id)?;
        let mut queued = Vec::new();
        for descriptor in batch
            .scenarios
            .iter_mut()
            .filter(|s| s.status == ScenarioStatus::Fail)
        {
            scenario::reset_for_reprocess(descriptor)?;
            queued.push(descriptor.sequence_id);
        }
        if queued.is_empty() {
            return Ok(0);
        }
        let count = queued.len();
        debug!(batch = %batch_id, count, "recalculating failed scenarios");
        let topic = topics::experiment_scenarios(batch_id);
        for &sequence_id in &queued {
            self.bus.publish(
                &topic,
                BusMessage::Scenario(ScenarioUpdate::element(
                    batch_id,
                    sequence_id,
                    ScenarioStatus::Pending,
                    None,
                )),
            );
        }
        self.begin_classification(batch_id, queued);
        Ok(count)
    }

    pub fn batches(&self) -> &[ScenarioBatch] {
        self.store.batches()
    }

    pub fn batch(&self, id: BatchId) -> CoreResult<&ScenarioBatch> {
        self.store.batch(id)
    }

    // ========================================================================
    // RESULTS
    // ========================================================================

    pub fn results(&self) -> &[ExperimentResult] {
        self.store.results()
    }

    pub fn delete_result(&mut self, id: ResultId) -> CoreResult<ExperimentResult> {
        let removed = self.store.remove_result(id)?;
        debug!(result = %id, "result deleted");
        Ok(removed)
    }

    // ========================================================================
    // TIME
    // ========================================================================

    /// Dispatches the earliest timer regardless of its due time. Returns the
    /// time it was due at.
    pub fn step(&mut self) -> Option<Duration> {
        let next = self.scheduler.pop_due(Duration::MAX)?;
        self.dispatch(next.task);
        Some(next.due)
    }

    /// Dispatches every timer due up to `to`, then sets the clock to `to`.
    /// Returns the number of timers dispatched.
    pub fn advance_to(&mut self, to: Duration) -> CoreResult<usize> {
        if to < self.now() {
            return Err(meshview_env::EnvError::rewind(to, self.now()).into());
        }
        let mut count = 0;
        while let Some(next) = self.scheduler.pop_due(to) {
            self.dispatch(next.task);
            count += 1;
        }
        self.scheduler.advance_to(to)?;
        Ok(count)
    }

    pub fn advance_by(&mut self, delta: Duration) -> CoreResult<usize> {
        self.advance_to(self.now().saturating_add(delta))
    }

    /// Runs timers until [`Engine::is_quiescent`] holds or `limit` of
    /// virtual time has passed. Returns whether quiescence was reached.
    pub fn run_until_quiescent(&mut self, limit: Duration) -> CoreResult<bool> {
        let deadline = self.now().saturating_add(limit);
        while !self.is_quiescent() {
            match self.scheduler.pop_due(deadline) {
                Some(next) => self.dispatch(next.task),
                None => {
                    self.scheduler.advance_to(deadline)?;
                    break;
                }
            }
        }
        Ok(self.is_quiescent())
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    pub(crate) fn schedule(&mut self, delay: Duration, timer: Timer) {
        let id = self.scheduler.after(delay, timer);
        debug!(timer = %id, ?delay, ?timer, "scheduled");
    }

    fn dispatch(&mut self, timer: Timer) {
        self.dispatched += 1;
        match timer {
            Timer::StateTick { generation } => self.on_state_tick(generation),
            Timer::PacketTick { generation } => self.on_packet_tick(generation),
            Timer::Classify { run } => self.on_classify(run),
            Timer::Build { job, step } => self.on_build_step(job, step),
            Timer::Deploy { job, phase } => self.on_deploy_step(job, phase),
            Timer::Execution { exec, step } => self.on_execution_step(exec, step),
        }
    }

    fn on_state_tick(&mut self, generation: u64) {
        if !self.heartbeat.is_current(generation) {
            return;
        }
        let now = self.now_ms();
        let snapshot =
            telemetry::state_tick(&mut self.store, &self.config.telemetry, &mut self.rng, now);
        self.bus
            .publish(topics::MONITORING, BusMessage::Monitoring(snapshot));
        self.schedule(
            self.config.telemetry.state_interval(),
            Timer::StateTick { generation },
        );
    }

    fn on_packet_tick(&mut self, generation: u64) {
        if !self.heartbeat.is_current(generation) {
            return;
        }
        let now = self.now_ms();
        if let Some(packet) =
            telemetry::packet_tick(&self.store, &self.config.telemetry, &mut self.rng, now)
        {
            self.bus
                .publish(topics::MONITORING_PACKETS, BusMessage::Packet(packet));
        }
        self.schedule(
            self.config.telemetry.packet_interval(),
            Timer::PacketTick { generation },
        );
    }

    fn begin_classification(&mut self, batch: BatchId, sequence_ids: impl IntoIterator<Item = u32>) {
        let run = self.next_classification;
        self.next_classification += 1;
        self.classifications
            .insert(run, ClassificationRun::new(batch, sequence_ids));
        self.schedule(
            Duration::from_millis(self.config.scenarios.classify_step_ms),
            Timer::Classify { run },
        );
    }

    fn on_classify(&mut self, run: u64) {
        let Some(mut state) = self.classifications.remove(&run) else {
            return;
        };
        let batch_id = state.batch;

        if let Some(seq) = state.queue.pop_front() {
            let outcome = match self
                .store
                .batch_mut(batch_id)
                .ok()
                .and_then(|b| b.scenario_mut(seq))
            {
                // Only elements still waiting are classified.
                Some(descriptor) if descriptor.status == ScenarioStatus::Pending => {
                    let outcome =
                        scenario::classify(descriptor, &self.config.scenarios, &mut self.rng);
                    scenario::apply_outcome(descriptor, outcome);
                    Some(outcome)
                }
                _ => None,
            };
            if let Some(outcome) = outcome {
                state.classified += 1;
                let status = if outcome.is_some() {
                    state.failed += 1;
                    ScenarioStatus::Fail
                } else {
                    ScenarioStatus::Ready
                };
                self.bus.publish(
                    &topics::experiment_scenarios(batch_id),
                    BusMessage::Scenario(ScenarioUpdate::element(batch_id, seq, status, outcome)),
                );
            }
        }

        if state.queue.is_empty() {
            self.finish_classification(state);
        } else {
            self.classifications.insert(run, state);
            self.schedule(
                Duration::from_millis(self.config.scenarios.classify_step_ms),
                Timer::Classify { run },
            );
        }
    }

    fn finish_classification(&mut self, state: ClassificationRun) {
        let Ok(batch) = self.store.batch(state.batch) else {
            return;
        };
        let total = batch.scenarios.len() as u32;
        let failed = batch.count(ScenarioStatus::Fail) as u32;
        info!(
            batch = %state.batch,
            classified = state.classified,
            total,
            failed,
            "batch classified"
        );
        self.bus.publish(
            &topics::experiment_scenarios(state.batch),
            BusMessage::Scenario(ScenarioUpdate::classified(state.batch, total, failed)),
        );
    }

    /// Regenerates the node set and publishes the new shape.
    pub(crate) fn commit_replicas(&mut self, replicas: u32) {
        self.store
            .resize(replicas, &self.config.telemetry, &mut self.rng);
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        let snapshot = MonitoringSnapshot {
            nodes: self.store.nodes().to_vec(),
            mempool: self.store.mempool().to_vec(),
            replica_count: self.store.replica_count(),
            timestamp_ms: self.now_ms(),
        };
        self.bus
            .publish(topics::MONITORING, BusMessage::Monitoring(snapshot));
    }

    /// Moves one scenario to `status` and appends a log line.
    pub(crate) fn update_scenario(
        &mut self,
        batch_id: BatchId,
        sequence_id: u32,
        status: ScenarioStatus,
        reason: Option<FailureReason>,
        line: &str,
    ) {
        match self
            .store
            .batch_mut(batch_id)
            .ok()
            .and_then(|b| b.scenario_mut(sequence_id))
        {
            Some(descriptor) => {
                descriptor.status = status;
                descriptor.failure_reason = reason;
                descriptor.log(line);
            }
            None => warn!(batch = %batch_id, sequence_id, "scenario vanished"),
        }
    }
}
