//! Invariant oracle.
//!
//! The oracle holds the properties every drill must preserve, whatever the
//! workload:
//! - `balances + held + consumed == genesis` and the store's structural audit
//! - each account's held value equals what its in-flight executions owe
//! - node heights never decrease and telemetry stays inside its bounds
//! - at most one element per execution is in flight at a time

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use meshview_core::model::{Amount, NodeId};
use meshview_core::topics;
use meshview_core::{Engine, Envelope, EventBus, ScenarioStatus, Subscription, Timer};
use meshview_env::{AccountId, ExecutionId, RandomSource, Scheduler};

/// Tracks which element each execution is working on, from the progress topic.
#[derive(Debug, Default)]
struct SequenceWatch {
    active: HashMap<ExecutionId, String>,
    violations: Vec<String>,
}

impl SequenceWatch {
    fn observe(&mut self, envelope: &Envelope) {
        let Some(progress) = envelope.message.as_experiment() else {
            return;
        };
        let exec = progress.execution_id;
        if progress.kind.is_some() {
            if let Some(open) = self.active.remove(&exec) {
                self.violations
                    .push(format!("execution {exec} completed while {open} was in flight"));
            }
            return;
        }
        let (Some(status), Some(scenario)) = (progress.status, progress.scenario_id.as_ref()) else {
            return;
        };
        match status {
            ScenarioStatus::Running => match self.active.get(&exec) {
                Some(open) if open != scenario => self.violations.push(format!(
                    "execution {exec} started {scenario} while {open} was in flight"
                )),
                _ => {
                    self.active.insert(exec, scenario.clone());
                }
            },
            s if s.is_terminal() => {
                if self.active.get(&exec) != Some(scenario) {
                    self.violations
                        .push(format!("execution {exec} finished {scenario} without starting it"));
                }
                self.active.remove(&exec);
            }
            _ => {}
        }
    }
}

/// Checks engine invariants between drill steps.
pub struct Oracle {
    bus: EventBus,
    subscription: Subscription,
    watch: Arc<Mutex<SequenceWatch>>,
    heights: BTreeMap<NodeId, u64>,
    violations: Vec<String>,
    checks: u64,
}

impl Oracle {
    /// Attaches to `bus` to follow execution progress.
    pub fn attach(bus: &EventBus) -> Self {
        let watch = Arc::new(Mutex::new(SequenceWatch::default()));
        let observer = Arc::clone(&watch);
        let subscription = bus.subscribe(topics::EXPERIMENT_PROGRESS, move |envelope: &Envelope| {
            lock(&observer).observe(envelope);
            Ok(())
        });
        Self {
            bus: bus.clone(),
            subscription,
            watch,
            heights: BTreeMap::new(),
            violations: Vec::new(),
            checks: 0,
        }
    }

    /// Inspects the engine and records any violation. Returns the number of
    /// new violations found by this check.
    pub fn check<R: RandomSource, S: Scheduler<Timer>>(&mut self, engine: &Engine<R, S>) -> usize {
        self.checks += 1;
        let before = self.violations.len();
        let store = engine.store();

        self.violations.extend(store.audit());

        let mut owed: BTreeMap<AccountId, Amount> = BTreeMap::new();
        for run in engine.executions() {
            let entry = owed.entry(run.account).or_insert(Amount::ZERO);
            *entry = entry.checked_add(run.outstanding).unwrap_or(*entry);
        }
        owed.retain(|_, amount| !amount.is_zero());
        let held: BTreeMap<AccountId, Amount> = store.holders().collect();
        if owed != held {
            self.violations.push(format!(
                "held {held:?} but in-flight executions owe {owed:?}"
            ));
        }

        let telemetry = &engine.config().telemetry;
        let mut heights = BTreeMap::new();
        for node in store.nodes() {
            if let Some(&last) = self.heights.get(&node.id) {
                if node.height < last {
                    self.violations.push(format!(
                        "{} height went from {} to {}",
                        node.id, last, node.height
                    ));
                }
            }
            if node.latency_ms < telemetry.latency_min_ms || node.latency_ms > telemetry.latency_max_ms {
                self.violations
                    .push(format!("{} latency {}ms out of bounds", node.id, node.latency_ms));
            }
            heights.insert(node.id, node.height);
        }
        self.heights = heights;

        let found = self.violations.len() - before;
        found + self.drain_watch()
    }

    /// Moves violations seen on the bus into the oracle's list.
    fn drain_watch(&mut self) -> usize {
        let seen = std::mem::take(&mut lock(&self.watch).violations);
        let count = seen.len();
        self.violations.extend(seen);
        count
    }

    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    pub fn is_clean(&self) -> bool {
        self.violations.is_empty() && lock(&self.watch).violations.is_empty()
    }

    pub fn checks(&self) -> u64 {
        self.checks
    }
}

impl Drop for Oracle {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.subscription);
    }
}

fn lock(watch: &Mutex<SequenceWatch>) -> MutexGuard<'_, SequenceWatch> {
    watch.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshview_core::messages::ExperimentProgress;
    use meshview_core::{BusMessage, EngineConfig};
    use meshview_env::SeededRandom;

    fn progress(exec: ExecutionId, message: ExperimentProgress) -> Envelope {
        Envelope {
            topic: topics::experiment_progress(exec),
            message: BusMessage::Experiment(message),
        }
    }

    #[test]
    fn test_sequence_watch_accepts_sequential_run() {
        let exec = ExecutionId::from_seed(1);
        let mut watch = SequenceWatch::default();
        for id in ["p-1", "p-2"] {
            watch.observe(&progress(exec, ExperimentProgress::step(exec, id, ScenarioStatus::Running, "go")));
            watch.observe(&progress(exec, ExperimentProgress::step(exec, id, ScenarioStatus::Complete, "ok")));
        }
        watch.observe(&progress(exec, ExperimentProgress::note(exec, "p-3", "skipped")));
        watch.observe(&progress(exec, ExperimentProgress::all_complete(exec, 2, 0)));
        assert!(watch.violations.is_empty(), "{:?}", watch.violations);
    }

    #[test]
    fn test_sequence_watch_flags_overlap() {
        let exec = ExecutionId::from_seed(2);
        let mut watch = SequenceWatch::default();
        watch.observe(&progress(exec, ExperimentProgress::step(exec, "p-1", ScenarioStatus::Running, "go")));
        watch.observe(&progress(exec, ExperimentProgress::step(exec, "p-2", ScenarioStatus::Running, "go")));
        assert_eq!(watch.violations.len(), 1);
    }

    #[test]
    fn test_sequence_watch_flags_unstarted_finish() {
        let exec = ExecutionId::from_seed(3);
        let mut watch = SequenceWatch::default();
        watch.observe(&progress(exec, ExperimentProgress::step(exec, "p-1", ScenarioStatus::Fail, "lost")));
        assert_eq!(watch.violations.len(), 1);
    }

    #[test]
    fn test_fresh_engine_is_clean() {
        let mut engine = Engine::new(EngineConfig::default(), SeededRandom::new(42)).unwrap();
        let mut oracle = Oracle::attach(engine.bus());
        engine.start();
        for _ in 0..5 {
            engine.advance_by(std::time::Duration::from_secs(1)).unwrap();
            assert_eq!(oracle.check(&engine), 0);
        }
        assert!(oracle.is_clean());
        assert_eq!(oracle.checks(), 5);
    }

    #[test]
    fn test_drop_detaches() {
        let engine = Engine::new(EngineConfig::default(), SeededRandom::new(1)).unwrap();
        let oracle = Oracle::attach(engine.bus());
        assert_eq!(engine.bus().subscriber_count(topics::EXPERIMENT_PROGRESS), 1);
        drop(oracle);
        assert_eq!(engine.bus().subscriber_count(topics::EXPERIMENT_PROGRESS), 0);
    }
}
