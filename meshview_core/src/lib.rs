//! MeshView Core - Simulation & Orchestration for a Multi-Chain Data Network
//!
//! This library is the in-process backend behind the MeshView dashboard:
//! 1. **Live state**: a topic bus fans node telemetry, job logs and
//!    experiment progress out to any number of observers
//! 2. **Experiments**: sparse parameter axes expand into costed scenarios
//!    that run sequentially with probabilistic failure and partial refunds
//! 3. **Economy**: a ledger keeps `balances + held + consumed` equal to the
//!    genesis supply across every faucet, deduction and refund
//!
//! All of it is driven by one [`Engine`] on a deterministic scheduler; see
//! `meshview_env` for the randomness and time seams.

pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod handle;
pub mod jobs;
pub mod ledger;
pub mod messages;
pub mod model;
pub mod scenario;
pub mod store;
pub mod telemetry;
pub mod topics;

// Re-export key types for convenience
pub use bus::{EventBus, HandlerError, HandlerResult, Subscription};
pub use config::EngineConfig;
pub use engine::{Engine, Timer};
pub use error::{CoreError, CoreResult};
pub use handle::SharedEngine;
pub use jobs::{JobStart, JobState};
pub use messages::{BusMessage, Envelope};
pub use model::{Account, AccountRole, Amount, ChainId, ScenarioStatus};
pub use scenario::{Axis, GenerationRequest};
pub use topics::TopicKind;
