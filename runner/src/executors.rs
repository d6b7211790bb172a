mod command;
pub mod local;
pub mod pbs;
pub mod slurm;

use crate::config::{ConfigErrors, SchedulerConfig};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Failed to submit {script}: {reason}")]
    Submission { script: PathBuf, reason: String },
    #[error("Failed to query job {handle}: {reason}")]
    Query { handle: JobHandle, reason: String },
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Opaque job id assigned by the scheduler
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// What the scheduler reports about a job it was asked about
pub enum QueryStatus {
    /// queued, held or otherwise waiting for resources
    Pending,
    Running,
    /// still listed, but in a final state
    Finished,
    /// not listed anymore
    Absent,
}

/// The two operations the pipeline needs from a cluster scheduler
pub trait Scheduler {
    fn submit(&self, script: &Path) -> Result<JobHandle, SchedulerError>;

    fn query(&self, handle: &JobHandle) -> Result<QueryStatus, SchedulerError>;
}

impl<S: Scheduler + ?Sized> Scheduler for &S {
    fn submit(&self, script: &Path) -> Result<JobHandle, SchedulerError> {
        (**self).submit(script)
    }

    fn query(&self, handle: &JobHandle) -> Result<QueryStatus, SchedulerError> {
        (**self).query(handle)
    }
}

#[derive(Debug)]
pub enum Schedulers {
    Pbs(pbs::PbsScheduler),
    Slurm(slurm::SlurmScheduler),
    Local(local::LocalScheduler),
}

impl Schedulers {
    pub fn load(config: &SchedulerConfig) -> Result<Self, ConfigErrors> {
        match config.name.to_lowercase().as_str() {
            "pbs" => Ok(Self::Pbs(pbs::PbsScheduler::load(config))),
            "slurm" => Ok(Self::Slurm(slurm::SlurmScheduler::load(config))),
            "local" => Ok(Self::Local(local::LocalScheduler::load(config))),
            _ => Err(ConfigErrors::UnsupportedScheduler(config.name.clone())),
        }
    }
}

impl Scheduler for Schedulers {
    fn submit(&self, script: &Path) -> Result<JobHandle, SchedulerError> {
        match self {
            Self::Pbs(scheduler) => scheduler.submit(script),
            Self::Slurm(scheduler) => scheduler.submit(script),
            Self::Local(scheduler) => scheduler.submit(script),
        }
    }

    fn query(&self, handle: &JobHandle) -> Result<QueryStatus, SchedulerError> {
        match self {
            Self::Pbs(scheduler) => scheduler.query(handle),
            Self::Slurm(scheduler) => scheduler.query(handle),
            Self::Local(scheduler) => scheduler.query(handle),
        }
    }
}
