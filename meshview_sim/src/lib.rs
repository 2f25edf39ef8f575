//! MeshView Drill Harness
//!
//! Runs the MeshView core on virtual time under scripted and random
//! workloads, and checks after every slice of time that nothing the engine
//! promises has been broken.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        SimWorld                          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ Engine (VirtualScheduler + SeededRandom)           │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │        │ EventBus                     ▲                  │
//! │   ┌────▼─────────┐   ┌─────────┐  ┌───┴─────────────┐    │
//! │   │ TopicRecorder│   │ Oracle  │  │ Drill workload  │    │
//! │   │ (per topic)  │   │ (audit) │  │ (ChaCha8 seed)  │    │
//! │   └──────────────┘   └─────────┘  └─────────────────┘    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use meshview_sim::{DrillRunner, DrillId};
//!
//! let result = DrillRunner::new(42, 3)
//!     .with_duration(10.0)
//!     .run(DrillId::BatchRun);
//! assert!(result.passed);
//! ```

pub mod drills;
mod error;
mod oracle;
pub mod realtime;
mod recorder;
mod runner;
mod world;

pub use drills::DrillId;
pub use error::{SimError, SimResult};
pub use oracle::Oracle;
pub use realtime::{run_realtime, RealtimeSummary};
pub use recorder::{TopicRecorder, ALL_TOPICS};
pub use runner::{DrillMetrics, DrillResult, DrillRunner};
pub use world::{SimConfig, SimWorld};
