//! MeshView Environment Abstraction Layer
//!
//! This crate provides the seam that lets the MeshView core run either under
//! a deterministic virtual clock (tests, drills) or paced against real time
//! (the live dashboard backend).
//!
//! # Core Concept
//!
//! Every source of non-determinism in the core is intercepted here:
//! - Time: continuations are queued on a [`Scheduler`] with `after(delay, task)`
//! - Pacing: a [`Pacer`] decides whether reaching a due time costs wall-clock time
//! - Randomness: all draws go through a [`RandomSource`]
//!
//! By deriving all entropy from a single 64-bit seed, any run of the
//! simulation is reproducible from its seed number.
//!
//! # Example
//!
//! ```ignore
//! use meshview_env::{Scheduler, VirtualScheduler, SeededRandom, RandomSource};
//! use std::time::Duration;
//!
//! let mut sched = VirtualScheduler::new();
//! sched.after(Duration::from_millis(500), "tick");
//!
//! let mut rng = SeededRandom::new(42);
//! if rng.chance(0.5) {
//!     // ...
//! }
//! ```

mod error;
mod pacer;
mod random;
mod scheduler;
mod tokio_impl;
mod types;

pub use error::EnvError;
pub use pacer::{Pacer, VirtualPacer};
pub use random::{EntropyRandom, FixedRandom, RandomSource, SeededRandom};
pub use scheduler::{Scheduled, Scheduler, TimerId, VirtualScheduler};
pub use tokio_impl::TokioPacer;
pub use types::{AccountId, BatchId, ExecutionId, JobId, PacketId, ResultId};
