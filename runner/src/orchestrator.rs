use crate::{
    executors::{JobHandle, QueryStatus, Scheduler, SchedulerError},
    sync::CancellationToken,
};
use itertools::Itertools;
use serde::Serialize;
use std::{
    fmt,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Submission failed for segment {segment}: {source}")]
    SubmissionFailed {
        segment: usize,
        source: SchedulerError,
    },
    #[error("Timed out after {elapsed:?} waiting for segments {pending:?}")]
    OrchestrationTimeout {
        elapsed: Duration,
        pending: Vec<usize>,
    },
    #[error("Cancelled while waiting for segments {pending:?}")]
    Cancelled { pending: Vec<usize> },
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Created,
    Submitted,
    Running,
    Completed,
    /// the scheduler stopped listing the job or could not be asked about it
    Unknown,
}

impl JobState {
    /// Completed and Unknown are equivalent for the barrier, the job ran to some conclusion
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Unknown)
    }

    /// next state after observing `status`, states never move backwards
    pub fn advance(self, status: QueryStatus) -> Self {
        match (self, status) {
            (state, _) if state.is_terminal() => state,
            (Self::Created, _) => Self::Created,
            (_, QueryStatus::Finished) => Self::Completed,
            (_, QueryStatus::Absent) => Self::Unknown,
            (Self::Submitted, QueryStatus::Running) => Self::Running,
            (state, _) => state,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Serialize, Clone, Debug)]
/// Lifecycle of the job computing one segment
pub struct JobRecord {
    segment_index: usize,
    artifact: PathBuf,
    handle: Option<JobHandle>,
    state: JobState,
}

impl JobRecord {
    pub fn new(segment_index: usize, artifact: PathBuf) -> Self {
        Self {
            segment_index,
            artifact,
            handle: None,
            state: JobState::Created,
        }
    }

    pub fn segment_index(&self) -> usize {
        self.segment_index
    }

    /// the file handed to the scheduler
    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn handle(&self) -> Option<&JobHandle> {
        self.handle.as_ref()
    }

    pub fn state(&self) -> JobState {
        self.state
    }
}

/// Submits one job per segment and blocks until all of them are terminal
///
/// An orchestrator owns the records of exactly one pipeline run.
#[derive(Debug)]
pub struct JobOrchestrator<S> {
    scheduler: S,
    records: Vec<JobRecord>,
    cancel: CancellationToken,
}

impl<S: Scheduler> JobOrchestrator<S> {
    pub fn new(scheduler: S, records: Vec<JobRecord>) -> Self {
        Self {
            scheduler,
            records,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn records(&self) -> &[JobRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<JobRecord> {
        self.records
    }

    /// segment indices of all records that are not terminal yet
    pub fn pending(&self) -> Vec<usize> {
        self.records
            .iter()
            .filter(|record| !record.state.is_terminal())
            .map(JobRecord::segment_index)
            .collect()
    }

    /// Submit every record still in `Created`, the first failure aborts the run
    #[instrument(skip(self), fields(jobs = self.records.len()))]
    pub fn submit(&mut self) -> Result<(), OrchestratorError> {
        for index in 0..self.records.len() {
            if self.records[index].state != JobState::Created {
                continue;
            }

            // an interrupt stops the submission loop, jobs already queued stay queued
            if self.cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled {
                    pending: self.pending(),
                });
            }

            let record = &mut self.records[index];
            info!(segment = record.segment_index, "Submitting job for {:?}", record.artifact);

            let handle = self
                .scheduler
                .submit(&record.artifact)
                .map_err(|source| OrchestratorError::SubmissionFailed {
                    segment: record.segment_index,
                    source,
                })?;

            debug!(segment = record.segment_index, handle = %handle, "Submitted");
            record.handle = Some(handle);
            record.state = JobState::Submitted;
        }

        Ok(())
    }

    /// Query every non-terminal record once, returns the number of records left pending
    pub fn sweep(&mut self) -> usize {
        let mut pending = 0;

        for record in self
            .records
            .iter_mut()
            .filter(|record| !record.state.is_terminal())
        {
            let Some(handle) = record.handle.as_ref() else {
                // never submitted, nothing to ask about
                pending += 1;
                continue;
            };

            let next = match self.scheduler.query(handle) {
                Ok(status) => record.state.advance(status),
                Err(error) => {
                    warn!(
                        segment = record.segment_index,
                        handle = %handle,
                        "Treating job as finished after a failed query: {error}"
                    );

                    JobState::Unknown
                }
            };

            if next != record.state {
                debug!(
                    segment = record.segment_index,
                    handle = %handle,
                    "{} -> {}",
                    record.state,
                    next
                );
                record.state = next;
            }

            if !next.is_terminal() {
                pending += 1;
            }
        }

        pending
    }

    /// Block until every record is terminal, polling all of them once per `poll_interval`
    ///
    /// Fails once `timeout` elapses or the cancellation token fires, in both cases the
    /// error carries every straggling segment. Submitted jobs are never retracted.
    #[instrument(skip(self), fields(jobs = self.records.len()))]
    pub fn await_all(
        &mut self,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<(), OrchestratorError> {
        let started = Instant::now();
        // a timeout too large to represent never expires
        let deadline = started.checked_add(timeout);

        let unsubmitted = self
            .records
            .iter()
            .filter(|record| record.state == JobState::Created)
            .map(JobRecord::segment_index)
            .collect_vec();
        if !unsubmitted.is_empty() {
            warn!("Segments {unsubmitted:?} were never submitted, they cannot finish");
        }

        loop {
            let pending = self.sweep();

            if pending == 0 {
                info!(
                    "All {} jobs finished after {:?}",
                    self.records.len(),
                    started.elapsed()
                );

                return Ok(());
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(OrchestratorError::OrchestrationTimeout {
                            elapsed: started.elapsed(),
                            pending: self.pending(),
                        });
                    }

                    poll_interval.min(deadline - now)
                }
                None => poll_interval,
            };

            info!(
                "Waiting for {pending}/{} jobs to complete...",
                self.records.len()
            );

            if self.cancel.wait_timeout(wait) {
                return Err(OrchestratorError::Cancelled {
                    pending: self.pending(),
                });
            }
        }
    }
}
