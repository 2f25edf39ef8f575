//! SimWorld - one engine on virtual time, watched by an oracle and a recorder.

use std::time::Duration;

use meshview_core::{AccountRole, Amount, Engine, EngineConfig};
use meshview_env::{AccountId, SeededRandom};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::error::{SimError, SimResult};
use crate::oracle::Oracle;
use crate::recorder::TopicRecorder;

/// Configuration for a drill run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Data node count at start-up (overrides `engine.replicas`)
    pub replicas: u32,

    /// Workload length in virtual seconds
    pub max_duration_secs: f64,

    /// Virtual time between two oracle checks
    pub check_interval_ms: u64,

    pub engine: EngineConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            replicas: 3,
            max_duration_secs: 30.0,
            check_interval_ms: 100,
            engine: EngineConfig::default(),
        }
    }
}

impl SimConfig {
    /// Engine configuration with the replica override applied.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            replicas: self.replicas,
            ..self.engine.clone()
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.max_duration_secs).unwrap_or(Duration::ZERO)
    }
}

/// The SimWorld - container for one drill.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    pub engine: Engine,

    /// Invariant checks, run after every slice of virtual time
    pub oracle: Oracle,

    /// Every message the bus delivered
    pub recorder: TopicRecorder,

    /// Drives workload choices; never shared with the engine
    workload: ChaCha8Rng,
}

impl SimWorld {
    /// Creates a world. The heartbeat is not started.
    pub fn new(config: SimConfig) -> SimResult<Self> {
        // Separate seeds so a workload change never shifts engine draws
        let engine_seed = config.seed;
        let workload_seed = config.seed.wrapping_mul(0x9e3779b97f4a7c15);

        let engine = Engine::new(config.engine_config(), SeededRandom::new(engine_seed))?;
        let oracle = Oracle::attach(engine.bus());
        let recorder = TopicRecorder::attach_all(engine.bus());

        Ok(Self {
            config,
            engine,
            oracle,
            recorder,
            workload: ChaCha8Rng::seed_from_u64(workload_seed),
        })
    }

    pub fn workload(&mut self) -> &mut ChaCha8Rng {
        &mut self.workload
    }

    pub fn now_secs(&self) -> f64 {
        self.engine.now().as_secs_f64()
    }

    /// Runs the oracle once.
    pub fn check(&mut self) -> SimResult<()> {
        if self.oracle.check(&self.engine) > 0 {
            return Err(SimError::Invariant(self.oracle.violations().to_vec()));
        }
        Ok(())
    }

    /// Advances virtual time by `span`, checking invariants after each slice.
    /// Returns the number of timers dispatched.
    pub fn run_for(&mut self, span: Duration) -> SimResult<usize> {
        let slice = Duration::from_millis(self.config.check_interval_ms.max(1));
        let deadline = self.engine.now().saturating_add(span);
        let mut dispatched = 0;
        while self.engine.now() < deadline {
            let step = slice.min(deadline - self.engine.now());
            dispatched += self.engine.advance_by(step)?;
            self.check()?;
        }
        Ok(dispatched)
    }

    /// Runs until no job, classification or execution is in flight, or
    /// `limit` has passed. Returns whether quiescence was reached.
    pub fn settle(&mut self, limit: Duration) -> SimResult<bool> {
        let deadline = self.engine.now().saturating_add(limit);
        let slice = Duration::from_millis(self.config.check_interval_ms.max(1));
        while !self.engine.is_quiescent() && self.engine.now() < deadline {
            let step = slice.min(deadline - self.engine.now());
            self.run_for(step)?;
        }
        debug!(now = ?self.engine.now(), quiescent = self.engine.is_quiescent(), "settled");
        Ok(self.engine.is_quiescent())
    }

    /// Creates a client account and funds it from the faucet.
    pub fn funded_user(&mut self, tokens: u64) -> SimResult<AccountId> {
        let account = self.engine.create_user(AccountRole::Client)?;
        if tokens > 0 {
            self.engine.faucet(account.id, Amount::from_tokens(tokens))?;
        }
        Ok(account.id)
    }

    /// Current balance of `account`.
    pub fn balance(&self, account: AccountId) -> SimResult<Amount> {
        Ok(self.engine.store().account(account)?.balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_for_checks_each_slice() {
        let mut world = SimWorld::new(SimConfig::default()).unwrap();
        world.engine.start();
        world.run_for(Duration::from_secs(2)).unwrap();
        assert_eq!(world.oracle.checks(), 20);
        assert_eq!(world.engine.now(), Duration::from_secs(2));
    }

    #[test]
    fn test_replica_override() {
        let config = SimConfig {
            replicas: 6,
            ..Default::default()
        };
        let world = SimWorld::new(config).unwrap();
        assert_eq!(world.engine.store().replica_count(), 6);
    }

    #[test]
    fn test_funded_user() {
        let mut world = SimWorld::new(SimConfig::default()).unwrap();
        let user = world.funded_user(25).unwrap();
        assert_eq!(world.balance(user).unwrap(), Amount::from_tokens(25));
        world.check().unwrap();
    }

    #[test]
    fn test_settle_on_idle_engine_returns_immediately() {
        let mut world = SimWorld::new(SimConfig::default()).unwrap();
        assert!(world.settle(Duration::from_secs(10)).unwrap());
        assert_eq!(world.engine.now(), Duration::ZERO);
    }

    #[test]
    fn test_same_seed_same_workload() {
        use rand::Rng;
        let mut a = SimWorld::new(SimConfig::default()).unwrap();
        let mut b = SimWorld::new(SimConfig::default()).unwrap();
        let xs: Vec<u32> = (0..8).map(|_| a.workload().gen()).collect();
        let ys: Vec<u32> = (0..8).map(|_| b.workload().gen()).collect();
        assert_eq!(xs, ys);
    }
}
