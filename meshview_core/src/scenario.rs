//! Scenario generation and feasibility classification.
//!
//! A [`GenerationRequest`] is a sparse description: two numeric axes and
//! two strategy sets. [`expand`] materializes the cartesian product as
//! `PENDING` descriptors; the engine then classifies them one scheduler
//! step at a time with [`classify`].

use std::collections::{BTreeSet, VecDeque};

use meshview_env::{AccountId, BatchId, RandomSource};
use serde::{Deserialize, Serialize};

use crate::config::ScenarioConfig;
use crate::error::{CoreError, CoreResult};
use crate::model::{Amount, ChainId, FailureReason, ScenarioBatch, ScenarioDescriptor, ScenarioStatus};

/// Largest batch a single request may produce.
pub const MAX_BATCH_SIZE: usize = 10_000;

/// One numeric parameter axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    Fixed(u64),
    List(Vec<u64>),
    /// Inclusive range. A non-positive step or `start > end` collapses to
    /// the single value `start`.
    Range { start: u64, end: u64, step: i64 },
}

impl Axis {
    /// Number of values without materializing them.
    pub fn len(&self) -> usize {
        match self {
            Axis::Fixed(_) => 1,
            Axis::List(values) => values.len(),
            Axis::Range { start, end, step } => {
                if *step <= 0 || start > end {
                    1
                } else {
                    let count = (end - start) / *step as u64 + 1;
                    usize::try_from(count).unwrap_or(usize::MAX)
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values in axis order.
    pub fn values(&self) -> Vec<u64> {
        match self {
            Axis::Fixed(v) => vec![*v],
            Axis::List(values) => values.clone(),
            Axis::Range { start, end, step } => {
                if *step <= 0 || start > end {
                    return vec![*start];
                }
                let step = *step as u64;
                let mut values = Vec::with_capacity(self.len().min(MAX_BATCH_SIZE));
                let mut v = *start;
                loop {
                    values.push(v);
                    match v.checked_add(step) {
                        Some(next) if next <= *end => v = next,
                        _ => break,
                    }
                }
                values
            }
        }
    }
}

/// Input of one generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub project: String,
    pub account: AccountId,
    pub data_size_mb: Axis,
    pub chunk_size_kb: Axis,
    pub allocators: Vec<String>,
    pub transmitters: Vec<String>,
    pub target_chains: BTreeSet<ChainId>,
}

impl GenerationRequest {
    pub fn validate(&self) -> CoreResult<()> {
        if self.project.trim().is_empty() {
            return Err(CoreError::validation("project label is blank"));
        }
        if self.target_chains.is_empty() {
            return Err(CoreError::validation("no target chains"));
        }
        if strategies(&self.allocators).is_empty() {
            return Err(CoreError::validation("no allocator strategies"));
        }
        if strategies(&self.transmitters).is_empty() {
            return Err(CoreError::validation("no transmitter strategies"));
        }
        if self.data_size_mb.is_empty() {
            return Err(CoreError::validation("data size axis is empty"));
        }
        if self.chunk_size_kb.is_empty() {
            return Err(CoreError::validation("chunk size axis is empty"));
        }
        let size = [
            self.data_size_mb.len(),
            self.chunk_size_kb.len(),
            strategies(&self.allocators).len(),
            strategies(&self.transmitters).len(),
        ]
        .into_iter()
        .try_fold(1usize, |acc, n| acc.checked_mul(n));
        match size {
            Some(n) if n <= MAX_BATCH_SIZE => Ok(()),
            _ => Err(CoreError::validation(format!(
                "request expands beyond {MAX_BATCH_SIZE} scenarios"
            ))),
        }
    }
}

/// Non-blank strategies, first occurrence wins.
fn strategies(raw: &[String]) -> Vec<&str> {
    let mut seen = Vec::new();
    for s in raw.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if !seen.contains(&s) {
            seen.push(s);
        }
    }
    seen
}

/// `data × chunk × chains / 1000` tokens, exact in micro-tokens.
pub fn estimate_cost(data_size_mb: u64, chunk_size_kb: u64, chains: usize) -> CoreResult<Amount> {
    data_size_mb
        .checked_mul(chunk_size_kb)
        .and_then(|v| v.checked_mul(chains as u64))
        .and_then(|v| v.checked_mul(1_000))
        .map(Amount::from_micros)
        .ok_or(CoreError::Overflow)
}

/// Materializes the product dataSize × chunkSize × allocator × transmitter
/// (data size outermost) as `PENDING` descriptors.
pub fn expand(
    request: &GenerationRequest,
    batch_id: BatchId,
    budget: Amount,
    created_at_ms: u64,
) -> CoreResult<ScenarioBatch> {
    request.validate()?;
    let project = request.project.trim();
    let allocators = strategies(&request.allocators);
    let transmitters = strategies(&request.transmitters);
    let chains = request.target_chains.len();
    let short = batch_id.short();

    let mut scenarios = Vec::new();
    for data in request.data_size_mb.values() {
        for chunk in request.chunk_size_kb.values() {
            let cost = estimate_cost(data, chunk, chains)?;
            for allocator in &allocators {
                for transmitter in &transmitters {
                    let sequence_id = scenarios.len() as u32 + 1;
                    scenarios.push(ScenarioDescriptor {
                        sequence_id,
                        unique_id: format!("{project}-{short}-{sequence_id:03}"),
                        data_size_mb: data,
                        chunk_size_kb: chunk,
                        allocator_strategy: allocator.to_string(),
                        transmitter_strategy: transmitter.to_string(),
                        target_chain_ids: request.target_chains.clone(),
                        budget_limit: budget,
                        estimated_cost: cost,
                        status: ScenarioStatus::Pending,
                        failure_reason: None,
                        log_lines: vec![format!("generated: estimated cost {cost}")],
                    });
                }
            }
        }
    }

    Ok(ScenarioBatch {
        batch_id,
        project: project.to_string(),
        account: request.account,
        created_at_ms,
        scenarios,
    })
}

/// Draws the feasibility outcome of one descriptor.
pub fn classify<R: RandomSource + ?Sized>(
    descriptor: &ScenarioDescriptor,
    config: &ScenarioConfig,
    rng: &mut R,
) -> Option<FailureReason> {
    if rng.chance(config.timeout_probability) {
        return Some(FailureReason::SimulatedTimeout);
    }
    if near_budget(descriptor.estimated_cost, descriptor.budget_limit, config.near_budget_bps)
        && rng.chance(config.insufficient_balance_probability)
    {
        return Some(FailureReason::SimulatedInsufficientBalance);
    }
    None
}

/// `cost > budget × bps / 10 000`, without rounding.
pub fn near_budget(cost: Amount, budget: Amount, bps: u32) -> bool {
    cost.micros() as u128 * 10_000 > budget.micros() as u128 * bps as u128
}

/// Applies a classification outcome to a descriptor.
pub(crate) fn apply_outcome(descriptor: &mut ScenarioDescriptor, outcome: Option<FailureReason>) {
    match outcome {
        Some(reason) => {
            descriptor.status = ScenarioStatus::Fail;
            descriptor.failure_reason = Some(reason);
            descriptor.log(format!("FAIL: {reason}"));
        }
        None => {
            descriptor.status = ScenarioStatus::Ready;
            descriptor.failure_reason = None;
            descriptor.log(format!(
                "READY: cost {} against budget {}",
                descriptor.estimated_cost, descriptor.budget_limit
            ));
        }
    }
}

/// Resets a descriptor to `PENDING` ahead of reclassification.
pub(crate) fn reset_for_reprocess(descriptor: &mut ScenarioDescriptor) -> CoreResult<()> {
    if descriptor.status == ScenarioStatus::Running {
        return Err(CoreError::validation(format!(
            "scenario {} is running",
            descriptor.unique_id
        )));
    }
    descriptor.status = ScenarioStatus::Pending;
    descriptor.failure_reason = None;
    descriptor.log("reprocessing");
    Ok(())
}

/// An in-flight classification pass over part of a batch.
#[derive(Debug, Clone)]
pub struct ClassificationRun {
    pub batch: BatchId,
    pub queue: VecDeque<u32>,
    /// Elements classified so far.
    pub classified: u32,
    pub failed: u32,
}

impl ClassificationRun {
    pub fn new(batch: BatchId, sequence_ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            batch,
            queue: sequence_ids.into_iter().collect(),
            classified: 0,
            failed: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshview_env::FixedRandom;
    use proptest::prelude::*;

    fn request() -> GenerationRequest {
        GenerationRequest {
            project: "atlas".into(),
            account: AccountId::from_seed(1),
            data_size_mb: Axis::List(vec![100, 200]),
            chunk_size_kb: Axis::Fixed(64),
            allocators: vec!["round-robin".into()],
            transmitters: vec!["greedy".into()],
            target_chains: [ChainId(1), ChainId(2)].into_iter().collect(),
        }
    }

    #[test]
    fn test_worked_example_costs() {
        let batch = expand(&request(), BatchId::from_seed(5), Amount::from_tokens(100), 0).unwrap();
        assert_eq!(batch.scenarios.len(), 2);
        assert_eq!(batch.scenarios[0].estimated_cost, Amount::from_micros(12_800_000));
        assert_eq!(batch.scenarios[1].estimated_cost, Amount::from_micros(25_600_000));
        assert!(batch.scenarios.iter().all(|s| s.status == ScenarioStatus::Pending));
    }

    #[test]
    fn test_unique_ids_are_traceable() {
        let batch_id = BatchId::from_seed(5);
        let batch = expand(&request(), batch_id, Amount::ZERO, 0).unwrap();
        assert_eq!(batch.scenarios[1].unique_id, format!("atlas-{}-002", batch_id.short()));
    }

    #[test]
    fn test_product_nesting_order() {
        let mut req = request();
        req.data_size_mb = Axis::List(vec![1, 2]);
        req.chunk_size_kb = Axis::List(vec![10, 20]);
        req.allocators = vec!["a1".into(), "a2".into()];
        let batch = expand(&req, BatchId::from_seed(1), Amount::ZERO, 0).unwrap();
        let order: Vec<(u64, u64, &str)> = batch
            .scenarios
            .iter()
            .map(|s| (s.data_size_mb, s.chunk_size_kb, s.allocator_strategy.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                (1, 10, "a1"),
                (1, 10, "a2"),
                (1, 20, "a1"),
                (1, 20, "a2"),
                (2, 10, "a1"),
                (2, 10, "a2"),
                (2, 20, "a1"),
                (2, 20, "a2"),
            ]
        );
        let seqs: Vec<u32> = batch.scenarios.iter().map(|s| s.sequence_id).collect();
        assert_eq!(seqs, (1..=8).collect::<Vec<_>>());
    }

    #[test]
    fn test_validation_errors() {
        let mut no_chains = request();
        no_chains.target_chains.clear();
        assert!(matches!(no_chains.validate(), Err(CoreError::Validation(_))));

        let mut blank = request();
        blank.project = "  ".into();
        assert!(blank.validate().is_err());

        let mut no_alloc = request();
        no_alloc.allocators = vec![" ".into()];
        assert!(no_alloc.validate().is_err());

        let mut empty_axis = request();
        empty_axis.chunk_size_kb = Axis::List(vec![]);
        assert!(empty_axis.validate().is_err());

        let mut huge = request();
        huge.data_size_mb = Axis::Range { start: 0, end: u64::MAX, step: 1 };
        assert!(huge.validate().is_err());
    }

    #[test]
    fn test_duplicate_strategies_collapse() {
        let mut req = request();
        req.transmitters = vec!["greedy".into(), "greedy ".into(), "flood".into()];
        let batch = expand(&req, BatchId::from_seed(1), Amount::ZERO, 0).unwrap();
        assert_eq!(batch.scenarios.len(), 4);
    }

    #[test]
    fn test_degenerate_ranges() {
        assert_eq!(Axis::Range { start: 5, end: 1, step: 1 }.values(), vec![5]);
        assert_eq!(Axis::Range { start: 5, end: 50, step: 0 }.values(), vec![5]);
        assert_eq!(Axis::Range { start: 5, end: 50, step: -3 }.values(), vec![5]);
        assert_eq!(Axis::Range { start: 10, end: 30, step: 10 }.values(), vec![10, 20, 30]);
        assert_eq!(
            Axis::Range { start: u64::MAX - 1, end: u64::MAX, step: 5 }.values(),
            vec![u64::MAX - 1]
        );
    }

    #[test]
    fn test_classification_branches() {
        let config = ScenarioConfig::default();
        let batch = expand(&request(), BatchId::from_seed(1), Amount::from_tokens(20), 0).unwrap();
        let cheap = &batch.scenarios[0]; // 12.8 of 20: not near budget (16)
        let dear = &batch.scenarios[1]; // 25.6 of 20: near budget

        // Draw 0.0 hits every non-zero probability: timeout first.
        let mut always = FixedRandom::new(0.0);
        assert_eq!(classify(cheap, &config, &mut always), Some(FailureReason::SimulatedTimeout));

        // 0.2 misses the timeout but hits the 0.3 insufficient-balance draw.
        let mut mid = FixedRandom::new(0.2);
        assert_eq!(classify(cheap, &config, &mut mid), None);
        assert_eq!(
            classify(dear, &config, &mut mid),
            Some(FailureReason::SimulatedInsufficientBalance)
        );

        let mut never = FixedRandom::new(0.999);
        assert_eq!(classify(dear, &config, &mut never), None);
    }

    #[test]
    fn test_near_budget_is_strict() {
        assert!(!near_budget(Amount::from_tokens(8), Amount::from_tokens(10), 8_000));
        assert!(near_budget(Amount::from_micros(8_000_001), Amount::from_tokens(10), 8_000));
        assert!(near_budget(Amount::from_micros(1), Amount::ZERO, 8_000));
    }

    #[test]
    fn test_reprocess_rejects_running() {
        let mut batch = expand(&request(), BatchId::from_seed(1), Amount::ZERO, 0).unwrap();
        batch.scenarios[0].status = ScenarioStatus::Running;
        assert!(reset_for_reprocess(&mut batch.scenarios[0]).is_err());
        apply_outcome(&mut batch.scenarios[1], Some(FailureReason::SimulatedTimeout));
        reset_for_reprocess(&mut batch.scenarios[1]).unwrap();
        assert_eq!(batch.scenarios[1].status, ScenarioStatus::Pending);
        assert_eq!(batch.scenarios[1].failure_reason, None);
    }

    proptest! {
        #[test]
        fn prop_range_is_ascending_and_bounded(start in 0u64..10_000, span in 0u64..10_000, step in 1i64..500) {
            let end = start + span;
            let values = Axis::Range { start, end, step }.values();
            prop_assert_eq!(values[0], start);
            prop_assert!(values.windows(2).all(|w| w[0] < w[1]));
            let last = *values.last().unwrap();
            prop_assert!(last <= end);
            prop_assert!(last + step as u64 > end);
            prop_assert_eq!(values.len(), Axis::Range { start, end, step }.len());
        }

        #[test]
        fn prop_product_size_and_shared_snapshot(
            data in proptest::collection::vec(1u64..1_000, 1..5),
            chunks in proptest::collection::vec(1u64..512, 1..4),
            allocs in 1usize..4,
            trans in 1usize..4,
            budget in 0u64..1_000_000,
        ) {
            let mut req = request();
            req.data_size_mb = Axis::List(data.clone());
            req.chunk_size_kb = Axis::List(chunks.clone());
            req.allocators = (0..allocs).map(|i| format!("a{i}")).collect();
            req.transmitters = (0..trans).map(|i| format!("t{i}")).collect();
            let batch = expand(&req, BatchId::from_seed(9), Amount::from_micros(budget), 0).unwrap();

            prop_assert_eq!(batch.scenarios.len(), data.len() * chunks.len() * allocs * trans);
            for s in &batch.scenarios {
                prop_assert_eq!(&s.target_chain_ids, &req.target_chains);
                prop_assert_eq!(s.budget_limit, Amount::from_micros(budget));
            }
        }

        #[test]
        fn prop_cost_is_pure(data in 0u64..100_000, chunk in 0u64..10_000, chains in 1usize..16) {
            let a = estimate_cost(data, chunk, chains).unwrap();
            let b = estimate_cost(data, chunk, chains).unwrap();
            prop_assert_eq!(a, b);
            prop_assert_eq!(a.micros(), data * chunk * chains as u64 * 1_000);
        }
    }
}
