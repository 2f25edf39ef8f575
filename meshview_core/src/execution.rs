//! Sequential experiment execution with partial refunds.
//!
//! The full estimated cost of every `READY` element is held up front. Each
//! element then runs `READY → RUNNING → {COMPLETE|FAIL}` on its own timer
//! chain, and the next element only starts once the previous one is
//! terminal. Refunds are settled per element, so once the run is over
//! nothing it deducted is still held.

use std::time::Duration;

use meshview_env::{AccountId, BatchId, ExecutionId, RandomSource, ResultId, Scheduler};
use tracing::{debug, error, info};

use crate::engine::{Engine, Timer};
use crate::error::{CoreError, CoreResult};
use crate::ledger::Ledger;
use crate::messages::{BusMessage, ExperimentProgress};
use crate::model::{
    Amount, ExperimentResult, FailureReason, PerformanceMetrics, ScenarioStatus,
};
use crate::topics;

/// Next continuation of the element under the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStep {
    Start,
    Broadcast,
    Outcome,
}

/// One in-flight run over a batch.
#[derive(Debug, Clone)]
pub struct ExecutionRun {
    pub id: ExecutionId,
    pub batch: BatchId,
    pub account: AccountId,
    /// Selected elements with the cost held for each.
    pub queue: Vec<(u32, Amount)>,
    pub cursor: usize,
    /// Held for elements that have not settled yet.
    pub outstanding: Amount,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
    pub started_at_ms: u64,
    element_started_ms: u64,
}

impl ExecutionRun {
    pub fn is_finished(&self) -> bool {
        self.cursor >= self.queue.len()
    }
}

/// Splits an element cost into `(refund, consumed)`.
///
/// `kept_bps` is the share of the cost the network keeps; the refund is the
/// rest, rounded down.
pub fn split_cost(cost: Amount, kept_bps: u32) -> (Amount, Amount) {
    let refund = cost.basis_points(10_000u32.saturating_sub(kept_bps));
    (refund, cost.saturating_sub(refund))
}

impl<R: RandomSource, S: Scheduler<Timer>> Engine<R, S> {
    /// Runs every `READY` element of a batch, one after another.
    ///
    /// # Errors
    /// - `BatchNotFound` for an unknown batch
    /// - `Validation` if nothing is `READY` or the batch is already executing
    /// - `InsufficientFunds` if the account cannot cover the total cost
    pub fn execute_batch(&mut self, batch_id: BatchId) -> CoreResult<ExecutionId> {
        let batch = self.store.batch(batch_id)?;
        if self.executions.values().any(|run| run.batch == batch_id) {
            return Err(CoreError::validation(format!(
                "batch {batch_id} is already executing"
            )));
        }
        let queue: Vec<(u32, Amount)> = batch
            .scenarios
            .iter()
            .filter(|s| s.status == ScenarioStatus::Ready)
            .map(|s| (s.sequence_id, s.estimated_cost))
            .collect();
        if queue.is_empty() {
            return Err(CoreError::validation("batch has no READY scenarios"));
        }
        let total = queue
            .iter()
            .try_fold(Amount::ZERO, |acc, (_, cost)| acc.checked_add(*cost))
            .ok_or(CoreError::Overflow)?;
        let account = batch.account;

        Ledger::new(&mut self.store).deduct(account, total)?;

        let id = ExecutionId::generate(&mut self.rng);
        let now = self.now_ms();
        info!(
            execution = %id,
            batch = %batch_id,
            scenarios = queue.len(),
            total = %total,
            "execution started"
        );
        self.executions.insert(
            id,
            ExecutionRun {
                id,
                batch: batch_id,
                account,
                queue,
                cursor: 0,
                outstanding: total,
                succeeded: 0,
                failed: 0,
                skipped: 0,
                started_at_ms: now,
                element_started_ms: now,
            },
        );
        self.schedule(
            Duration::ZERO,
            Timer::Execution {
                exec: id,
                step: ExecStep::Start,
            },
        );
        Ok(id)
    }

    pub fn execution(&self, id: ExecutionId) -> Option<&ExecutionRun> {
        self.executions.get(&id)
    }

    pub fn executions(&self) -> impl Iterator<Item = &ExecutionRun> {
        self.executions.values()
    }

    pub(crate) fn on_execution_step(&mut self, exec: ExecutionId, step: ExecStep) {
        let Some(run) = self.executions.get(&exec) else {
            return;
        };
        if run.is_finished() {
            self.finish_execution(exec);
            return;
        }
        match step {
            ExecStep::Start => self.start_element(exec),
            ExecStep::Broadcast => self.broadcast_element(exec),
            ExecStep::Outcome => self.conclude_element(exec),
        }
    }

    fn start_element(&mut self, exec: ExecutionId) {
        let now = self.now_ms();
        let Some(run) = self.executions.get_mut(&exec) else {
            return;
        };
        let (seq, cost) = run.queue[run.cursor];
        let (batch_id, account) = (run.batch, run.account);

        let ready = self
            .store
            .batch(batch_id)
            .ok()
            .and_then(|b| b.scenario(seq))
            .map(|s| (s.status == ScenarioStatus::Ready, s.unique_id.clone()));

        match ready {
            Some((true, unique_id)) => {
                run.element_started_ms = now;
                let line = format!("Starting scenario {unique_id}");
                self.update_scenario(batch_id, seq, ScenarioStatus::Running, None, &line);
                self.publish_progress(exec, &unique_id, ScenarioStatus::Running, line);
                self.schedule(
                    Duration::from_millis(self.config.execution.broadcast_delay_ms),
                    Timer::Execution {
                        exec,
                        step: ExecStep::Broadcast,
                    },
                );
            }
            other => {
                // No longer READY: hand the whole cost back and move on.
                run.skipped += 1;
                run.outstanding = run.outstanding.saturating_sub(cost);
                run.cursor += 1;
                if let Err(err) = Ledger::new(&mut self.store).refund(account, cost) {
                    error!(execution = %exec, error = %err, "refund of skipped scenario failed");
                }
                if let Some((_, unique_id)) = other {
                    debug!(execution = %exec, scenario = %unique_id, "skipped");
                    self.bus.publish(
                        &topics::experiment_progress(exec),
                        BusMessage::Experiment(ExperimentProgress::note(
                            exec,
                            &unique_id,
                            format!("Skipping scenario {unique_id}: no longer READY"),
                        )),
                    );
                }
                self.schedule(
                    Duration::ZERO,
                    Timer::Execution {
                        exec,
                        step: ExecStep::Start,
                    },
                );
            }
        }
    }

    fn broadcast_element(&mut self, exec: ExecutionId) {
        let Some(run) = self.executions.get(&exec) else {
            return;
        };
        let (seq, _) = run.queue[run.cursor];
        let batch_id = run.batch;
        let Some(scenario) = self.store.batch(batch_id).ok().and_then(|b| b.scenario(seq)) else {
            return;
        };
        let unique_id = scenario.unique_id.clone();
        let line = format!(
            "Broadcasting {} MB in {} KB chunks to {} chains",
            scenario.data_size_mb,
            scenario.chunk_size_kb,
            scenario.target_chain_ids.len()
        );
        self.update_scenario(batch_id, seq, ScenarioStatus::Running, None, &line);
        self.publish_progress(exec, &unique_id, ScenarioStatus::Running, line);
        self.schedule(
            Duration::from_millis(self.config.execution.outcome_delay_ms),
            Timer::Execution {
                exec,
                step: ExecStep::Outcome,
            },
        );
    }

    fn conclude_element(&mut self, exec: ExecutionId) {
        let now = self.now_ms();
        let lost = self.rng.chance(self.config.execution.connection_loss_probability);
        let result_id = ResultId::generate(&mut self.rng);

        let Some(run) = self.executions.get_mut(&exec) else {
            return;
        };
        let (seq, cost) = run.queue[run.cursor];
        let (batch_id, account, started) = (run.batch, run.account, run.element_started_ms);

        let (status, reason, kept_bps) = if lost {
            run.failed += 1;
            (
                ScenarioStatus::Fail,
                Some(FailureReason::ConnectionLost),
                self.config.economy.failure_consumed_bps,
            )
        } else {
            run.succeeded += 1;
            (
                ScenarioStatus::Complete,
                None,
                self.config.economy.success_actual_bps,
            )
        };
        let (refund, kept) = split_cost(cost, kept_bps);
        run.outstanding = run.outstanding.saturating_sub(cost);
        run.cursor += 1;
        self.schedule(
            Duration::ZERO,
            Timer::Execution {
                exec,
                step: ExecStep::Start,
            },
        );

        let mut ledger = Ledger::new(&mut self.store);
        if let Err(err) = ledger.refund(account, refund).and_then(|_| ledger.settle(account, kept)) {
            error!(execution = %exec, error = %err, "settlement failed");
        }

        let line = match reason {
            Some(reason) => format!("Scenario failed: {reason} (refunded {refund})"),
            None => format!("Scenario complete (charged {kept}, refunded {refund})"),
        };
        let Some(batch) = self.store.batch(batch_id).ok() else {
            return;
        };
        let project = batch.project.clone();
        let Some(scenario) = batch.scenario(seq).cloned() else {
            return;
        };
        self.update_scenario(batch_id, seq, status, reason, &line);
        self.publish_progress(exec, &scenario.unique_id, status, line);

        let elapsed = now.saturating_sub(started);
        self.store.push_result(ExperimentResult {
            id: result_id,
            batch_id,
            sequence_id: seq,
            scenario_id: scenario.unique_id.clone(),
            execution_id: exec,
            project,
            started_at_ms: started,
            finished_at_ms: now,
            status,
            failure_reason: reason,
            data_size_mb: scenario.data_size_mb,
            chunk_size_kb: scenario.chunk_size_kb,
            allocator_strategy: scenario.allocator_strategy.clone(),
            transmitter_strategy: scenario.transmitter_strategy.clone(),
            chains: scenario.target_chain_ids.iter().copied().collect(),
            charged: kept,
            metrics: PerformanceMetrics::derive(
                scenario.data_size_mb,
                elapsed,
                status == ScenarioStatus::Complete,
            ),
        });
    }

    fn finish_execution(&mut self, exec: ExecutionId) {
        let Some(run) = self.executions.remove(&exec) else {
            return;
        };
        if !run.outstanding.is_zero() {
            error!(execution = %exec, outstanding = %run.outstanding, "run finished with value still held");
        }
        info!(
            execution = %exec,
            succeeded = run.succeeded,
            failed = run.failed,
            skipped = run.skipped,
            "execution complete"
        );
        self.bus.publish(
            &topics::experiment_progress(exec),
            BusMessage::Experiment(ExperimentProgress::all_complete(
                exec,
                run.succeeded,
                run.failed,
            )),
        );
    }

    fn publish_progress(
        &self,
        exec: ExecutionId,
        unique_id: &str,
        status: ScenarioStatus,
        line: String,
    ) {
        self.bus.publish(
            &topics::experiment_progress(exec),
            BusMessage::Experiment(ExperimentProgress::step(exec, unique_id, status, line)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::messages::{Envelope, ProgressKind};
    use crate::model::{AccountRole, ChainId};
    use crate::scenario::{Axis, GenerationRequest};
    use meshview_env::{FixedRandom, SeededRandom};
    use std::sync::{Arc, Mutex};

    fn request(account: AccountId) -> GenerationRequest {
        GenerationRequest {
            project: "atlas".into(),
            account,
            data_size_mb: Axis::List(vec![100, 200]),
            chunk_size_kb: Axis::Fixed(64),
            allocators: vec!["round-robin".into()],
            transmitters: vec!["greedy".into()],
            target_chains: [ChainId(1), ChainId(2)].into_iter().collect(),
        }
    }

    fn quiet_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.scenarios.timeout_probability = 0.0;
        config.scenarios.insufficient_balance_probability = 0.0;
        config
    }

    fn prepared<R: RandomSource>(rng: R, funds: u64) -> (Engine<R>, AccountId, BatchId) {
        prepared_with(quiet_config(), rng, funds)
    }

    /// Engine with a funded client and a fully classified two-element batch.
    fn prepared_with<R: RandomSource>(
        config: EngineConfig,
        rng: R,
        funds: u64,
    ) -> (Engine<R>, AccountId, BatchId) {
        let mut engine = Engine::new(config, rng).unwrap();
        let user = engine.create_user(AccountRole::Client).unwrap();
        engine.faucet(user.id, Amount::from_tokens(funds)).unwrap();
        let batch = engine.generate_batch(request(user.id)).unwrap();
        engine.advance_by(Duration::from_secs(2)).unwrap();
        assert_eq!(engine.store().batch(batch).unwrap().count(ScenarioStatus::Ready), 2);
        (engine, user.id, batch)
    }

    fn progress<R: RandomSource, S: Scheduler<Timer>>(
        engine: &Engine<R, S>,
    ) -> Arc<Mutex<Vec<ExperimentProgress>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.bus().subscribe(topics::EXPERIMENT_PROGRESS, move |env: &Envelope| {
            if let Some(p) = env.message.as_experiment() {
                sink.lock().unwrap().push(p.clone());
            }
            Ok(())
        });
        seen
    }

    #[test]
    fn test_split_cost_rounds_refund_down() {
        let (refund, kept) = split_cost(Amount::from_micros(12_800_000), 8_500);
        assert_eq!(refund, Amount::from_micros(1_920_000));
        assert_eq!(kept, Amount::from_micros(10_880_000));

        let (refund, kept) = split_cost(Amount::from_micros(7), 1_000);
        assert_eq!(refund, Amount::from_micros(6));
        assert_eq!(kept, Amount::from_micros(1));
    }

    #[test]
    fn test_successful_run_settles_everything() {
        let (mut engine, user, batch) = prepared(FixedRandom::new(0.999), 100);
        let events = progress(&engine);
        let exec = engine.execute_batch(batch).unwrap();

        // 38.4 held up front.
        assert_eq!(
            engine.store().account(user).unwrap().balance,
            Amount::from_micros(61_600_000)
        );
        assert_eq!(engine.store().held_by(user), Amount::from_micros(38_400_000));
        assert_eq!(engine.store().holders().count(), 1);

        engine.advance_by(Duration::from_secs(10)).unwrap();
        assert!(engine.execution(exec).is_none());

        // 15% of 38.4 comes back.
        assert_eq!(
            engine.store().account(user).unwrap().balance,
            Amount::from_micros(67_360_000)
        );
        assert_eq!(engine.store().held(), Amount::ZERO);
        assert_eq!(engine.store().consumed(), Amount::from_micros(32_640_000));
        assert!(engine.store().audit().is_empty());

        let events = events.lock().unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.kind, Some(ProgressKind::AllComplete));
        assert_eq!((last.succeeded, last.failed), (Some(2), Some(0)));
        assert_eq!(engine.store().results().len(), 2);
        assert!(engine
            .store()
            .batch(batch)
            .unwrap()
            .scenarios
            .iter()
            .all(|s| s.status == ScenarioStatus::Complete));
    }

    #[test]
    fn test_connection_loss_refunds_ninety_percent() {
        let (mut engine, user, batch) = prepared(FixedRandom::new(0.999), 100);
        // Every draw from here on fires.
        engine.rng_mut().set(0.0);
        engine.execute_batch(batch).unwrap();
        engine.advance_by(Duration::from_secs(10)).unwrap();

        // 10% of 38.4 is kept.
        assert_eq!(
            engine.store().account(user).unwrap().balance,
            Amount::from_micros(96_160_000)
        );
        let results = engine.store().results();
        assert!(results.iter().all(|r| r.status == ScenarioStatus::Fail));
        assert!(results
            .iter()
            .all(|r| r.failure_reason == Some(FailureReason::ConnectionLost)));
        assert!(results.iter().all(|r| r.metrics.throughput_mbps == 0.0));
        assert!(engine.store().audit().is_empty());
    }

    #[test]
    fn test_insufficient_funds_touches_nothing() {
        let (mut engine, user, batch) = prepared(FixedRandom::new(0.999), 30);
        let err = engine.execute_batch(batch).unwrap_err();
        assert!(matches!(err, CoreError::InsufficientFunds { .. }));
        assert_eq!(engine.store().account(user).unwrap().balance, Amount::from_tokens(30));
        assert_eq!(engine.store().batch(batch).unwrap().count(ScenarioStatus::Ready), 2);
        assert_eq!(engine.pending_timers(), 0);
    }

    #[test]
    fn test_no_ready_elements_is_validation_error() {
        let (mut engine, _, batch) = prepared(FixedRandom::new(0.999), 100);
        engine.execute_batch(batch).unwrap();
        engine.advance_by(Duration::from_secs(10)).unwrap();
        assert!(matches!(engine.execute_batch(batch), Err(CoreError::Validation(_))));
    }

    #[test]
    fn test_concurrent_run_on_same_batch_rejected() {
        let (mut engine, _, batch) = prepared(FixedRandom::new(0.999), 100);
        engine.execute_batch(batch).unwrap();
        assert!(matches!(engine.execute_batch(batch), Err(CoreError::Validation(_))));
    }

    #[test]
    fn test_elements_run_strictly_in_sequence() {
        let (mut engine, _, batch) = prepared(SeededRandom::new(5), 100);
        let events = progress(&engine);
        engine.execute_batch(batch).unwrap();
        engine.advance_by(Duration::from_secs(10)).unwrap();

        let events = events.lock().unwrap();
        let mut active: Option<String> = None;
        for e in events.iter().filter(|e| e.scenario_id.is_some()) {
            let id = e.scenario_id.clone().unwrap();
            match e.status {
                Some(ScenarioStatus::Running) => {
                    assert!(active.is_none() || active.as_ref() == Some(&id));
                    active = Some(id);
                }
                Some(s) if s.is_terminal() => {
                    assert_eq!(active.as_ref(), Some(&id));
                    active = None;
                }
                _ => {}
            }
        }
        assert!(active.is_none());
    }

    #[test]
    fn test_reprocessed_element_is_skipped_and_refunded() {
        let mut config = quiet_config();
        config.scenarios.timeout_probability = 0.5;
        let (mut engine, user, batch) = prepared_with(config, FixedRandom::new(0.999), 100);
        engine.execute_batch(batch).unwrap();

        // Reclassify the second element into a timeout while the first runs.
        engine.advance_by(Duration::from_millis(10)).unwrap();
        engine.reprocess(batch, 2).unwrap();
        engine.rng_mut().set(0.0);
        engine.advance_by(Duration::from_millis(400)).unwrap();
        assert_eq!(
            engine.store().batch(batch).unwrap().scenario(2).unwrap().status,
            ScenarioStatus::Fail
        );
        engine.rng_mut().set(0.999);
        engine.advance_by(Duration::from_secs(10)).unwrap();

        // Only the first element (12.8) was charged 85%.
        assert_eq!(
            engine.store().account(user).unwrap().balance,
            Amount::from_micros(89_120_000)
        );
        assert_eq!(engine.store().results().len(), 1);
        assert!(engine.store().audit().is_empty());
    }

    #[test]
    fn test_result_metrics_follow_timeline() {
        let (mut engine, _, batch) = prepared(FixedRandom::new(0.999), 100);
        engine.execute_batch(batch).unwrap();
        engine.advance_by(Duration::from_secs(10)).unwrap();
        let first = &engine.store().results()[0];
        assert_eq!(first.finished_at_ms - first.started_at_ms, 2_500);
        assert_eq!(first.metrics.upload_ms, 1_500);
        assert_eq!(first.metrics.download_ms, 1_000);
        assert_eq!(first.charged, Amount::from_micros(10_880_000));
    }
}
