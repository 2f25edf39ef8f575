//! Build and deploy pseudo-jobs.
//!
//! Each job is a small state machine advanced by [`Timer::Build`] and
//! [`Timer::Deploy`] continuations. At most one job of each kind runs at a
//! time; a second start request is answered with
//! [`JobStart::AlreadyRunning`] and changes nothing.

use std::time::Duration;

use meshview_env::{JobId, RandomSource, Scheduler};
use tracing::{info, warn};

use crate::engine::{Engine, Timer};
use crate::error::{CoreError, CoreResult};
use crate::messages::{BusMessage, DeploymentLog, JobKind};
use crate::model::NodeId;
use crate::topics;

/// Log lines of an image build, one per step.
pub const BUILD_STEPS: [&str; 5] = [
    "Resolving dependencies",
    "Compiling node runtime",
    "Packaging container image",
    "Pushing image to registry",
    "Image build finished",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
    Complete,
    Failed(String),
}

/// Answer to a build or deploy request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStart {
    Started(JobId),
    /// A job of this kind is in flight; its id is returned.
    AlreadyRunning(JobId),
}

impl JobStart {
    pub fn job_id(self) -> JobId {
        match self {
            JobStart::Started(id) | JobStart::AlreadyRunning(id) => id,
        }
    }

    pub fn is_started(self) -> bool {
        matches!(self, JobStart::Started(_))
    }
}

/// Position of a deploy job in its timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployPhase {
    /// Emit the "scheduled" line of target `i`.
    Schedule(usize),
    Finish,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub log_lines: Vec<String>,
    /// Requested replica count of a deploy.
    pub replicas: Option<u32>,
    pub started_at_ms: u64,
    pub finished_at_ms: Option<u64>,
}

/// Latest job of each kind.
///
/// A finished job stays readable with its state and timing only; its log
/// lines are dropped once the terminal event has been published.
#[derive(Debug, Clone, Default)]
pub struct JobTracker {
    build: Option<Job>,
    deploy: Option<Job>,
}

impl JobTracker {
    pub fn latest(&self, kind: JobKind) -> Option<&Job> {
        match kind {
            JobKind::Build => self.build.as_ref(),
            JobKind::Deploy => self.deploy.as_ref(),
        }
    }

    pub fn state(&self, kind: JobKind) -> JobState {
        self.latest(kind)
            .map_or(JobState::Idle, |job| job.state.clone())
    }

    pub fn is_running(&self, kind: JobKind) -> bool {
        self.state(kind) == JobState::Running
    }

    fn slot(&mut self, kind: JobKind) -> &mut Option<Job> {
        match kind {
            JobKind::Build => &mut self.build,
            JobKind::Deploy => &mut self.deploy,
        }
    }

    /// Registers a new running job unless one of this kind is in flight.
    fn begin(&mut self, kind: JobKind, id: JobId, replicas: Option<u32>, now_ms: u64) -> JobStart {
        let slot = self.slot(kind);
        if let Some(job) = slot.as_ref().filter(|j| j.state == JobState::Running) {
            return JobStart::AlreadyRunning(job.id);
        }
        *slot = Some(Job {
            id,
            kind,
            state: JobState::Running,
            log_lines: Vec::new(),
            replicas,
            started_at_ms: now_ms,
            finished_at_ms: None,
        });
        JobStart::Started(id)
    }

    fn discard_log(&mut self, kind: JobKind, id: JobId) {
        if let Some(job) = self.slot(kind).as_mut().filter(|job| job.id == id) {
            job.log_lines = Vec::new();
        }
    }

    /// The running job with this id, if it is still the current one.
    fn running_mut(&mut self, kind: JobKind, id: JobId) -> Option<&mut Job> {
        self.slot(kind)
            .as_mut()
            .filter(|job| job.id == id && job.state == JobState::Running)
    }
}

/// Deploy order: control, meta, then data nodes.
pub fn deploy_targets(replicas: u32) -> Vec<NodeId> {
    [NodeId::CONTROL, NodeId::META]
        .into_iter()
        .chain((1..=replicas).map(NodeId::data))
        .collect()
}

impl<R: RandomSource, S: Scheduler<Timer>> Engine<R, S> {
    /// Starts an image build.
    pub fn build_image(&mut self) -> JobStart {
        let id = JobId::generate(&mut self.rng);
        let now = self.now_ms();
        let start = self.jobs.begin(JobKind::Build, id, None, now);
        if let JobStart::Started(job) = start {
            info!(job = %job, "build started");
            self.schedule(
                Duration::from_millis(self.config.jobs.build_step_ms),
                Timer::Build { job, step: 0 },
            );
        }
        start
    }

    /// Starts a deployment of `replicas` data nodes.
    pub fn deploy(&mut self, replicas: u32) -> CoreResult<JobStart> {
        if replicas > self.config.max_replicas {
            return Err(CoreError::validation(format!(
                "{replicas} replicas exceeds the maximum of {}",
                self.config.max_replicas
            )));
        }
        let id = JobId::generate(&mut self.rng);
        let now = self.now_ms();
        let start = self.jobs.begin(JobKind::Deploy, id, Some(replicas), now);
        if let JobStart::Started(job) = start {
            info!(job = %job, replicas, "deploy started");
            self.job_log(JobKind::Deploy, job, format!("Initiating deployment of {replicas} replicas"));
            self.schedule(
                Duration::from_millis(self.config.jobs.deploy_initial_delay_ms),
                Timer::Deploy {
                    job,
                    phase: DeployPhase::Schedule(0),
                },
            );
        }
        Ok(start)
    }

    /// Commits a replica count of zero right away.
    pub fn reset(&mut self) {
        info!("resetting network to zero replicas");
        self.commit_replicas(0);
    }

    pub fn job(&self, kind: JobKind) -> Option<&Job> {
        self.jobs.latest(kind)
    }

    pub fn job_state(&self, kind: JobKind) -> JobState {
        self.jobs.state(kind)
    }

    pub(crate) fn on_build_step(&mut self, job: JobId, step: usize) {
        if self.jobs.running_mut(JobKind::Build, job).is_none() {
            return;
        }
        if self.rng.chance(self.config.jobs.build_failure_probability) {
            self.fail_job(JobKind::Build, job, format!("step {} failed", step + 1));
            return;
        }
        let Some(line) = BUILD_STEPS.get(step) else {
            return;
        };
        self.job_log(JobKind::Build, job, *line);

        if step + 1 < BUILD_STEPS.len() {
            self.schedule(
                Duration::from_millis(self.config.jobs.build_step_ms),
                Timer::Build { job, step: step + 1 },
            );
        } else {
            self.complete_job(JobKind::Build, job);
        }
    }

    pub(crate) fn on_deploy_step(&mut self, job: JobId, phase: DeployPhase) {
        let Some(replicas) = self
            .jobs
            .running_mut(JobKind::Deploy, job)
            .and_then(|j| j.replicas)
        else {
            return;
        };
        let stagger = Duration::from_millis(self.config.jobs.deploy_stagger_ms);

        match phase {
            DeployPhase::Schedule(i) => {
                let targets = deploy_targets(replicas);
                let Some(target) = targets.get(i) else {
                    return;
                };
                if self.rng.chance(self.config.jobs.deploy_failure_probability) {
                    self.fail_job(JobKind::Deploy, job, format!("scheduling on {target} failed"));
                    return;
                }
                self.job_log(JobKind::Deploy, job, format!("Scheduled replica on {target}"));
                let next = if i + 1 < targets.len() {
                    DeployPhase::Schedule(i + 1)
                } else {
                    DeployPhase::Finish
                };
                self.schedule(stagger, Timer::Deploy { job, phase: next });
            }
            DeployPhase::Finish => {
                self.job_log(
                    JobKind::Deploy,
                    job,
                    format!("Deployment complete: {replicas} replicas online"),
                );
                self.commit_replicas(replicas);
                self.complete_job(JobKind::Deploy, job);
            }
        }
    }

    /// Appends to the job log and publishes the line.
    fn job_log(&mut self, kind: JobKind, id: JobId, line: impl Into<String>) {
        let line = line.into();
        if let Some(job) = self.jobs.running_mut(kind, id) {
            job.log_lines.push(line.clone());
        }
        self.bus.publish(
            &topics::deployment_logs(id),
            BusMessage::Deployment(DeploymentLog::line(id, kind, line)),
        );
    }

    fn complete_job(&mut self, kind: JobKind, id: JobId) {
        let now = self.now_ms();
        if let Some(job) = self.jobs.running_mut(kind, id) {
            job.state = JobState::Complete;
            job.finished_at_ms = Some(now);
        }
        info!(job = %id, %kind, "job complete");
        self.bus.publish(
            &topics::deployment_logs(id),
            BusMessage::Deployment(DeploymentLog::complete(id, kind)),
        );
        self.jobs.discard_log(kind, id);
    }

    fn fail_job(&mut self, kind: JobKind, id: JobId, reason: String) {
        let now = self.now_ms();
        if let Some(job) = self.jobs.running_mut(kind, id) {
            job.state = JobState::Failed(reason.clone());
            job.finished_at_ms = Some(now);
        }
        warn!(job = %id, %kind, %reason, "job failed");
        self.bus.publish(
            &topics::deployment_logs(id),
            BusMessage::Deployment(DeploymentLog::failed(id, kind, reason)),
        );
        self.jobs.discard_log(kind, id);
    }
}
