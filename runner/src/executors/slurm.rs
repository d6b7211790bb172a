use super::{command, JobHandle, QueryStatus, Scheduler, SchedulerError};
use crate::config::SchedulerConfig;
use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, instrument, warn};

/// Slurm via `sbatch --parsable` and `squeue`
#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    sbatch: PathBuf,
    squeue: PathBuf,
    timeout: Duration,
}

impl SlurmScheduler {
    pub fn load(config: &SchedulerConfig) -> Self {
        Self {
            sbatch: config
                .submit_command
                .clone()
                .unwrap_or_else(|| PathBuf::from("sbatch")),
            squeue: config
                .query_command
                .clone()
                .unwrap_or_else(|| PathBuf::from("squeue")),
            timeout: config.command_timeout(),
        }
    }
}

/// `--parsable` prints `id` or `id;cluster`
pub fn parse_sbatch(output: &str) -> Option<JobHandle> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split(';').next())
        .filter(|id| !id.is_empty())
        .map(JobHandle::new)
}

/// Map a `%T` job state of squeue
pub fn parse_state(state: &str) -> QueryStatus {
    match state {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_FED" | "REQUEUE_HOLD" | "RESIZING"
        | "SUSPENDED" | "STOPPED" | "RESV_DEL_HOLD" => QueryStatus::Pending,
        "RUNNING" | "COMPLETING" | "STAGE_OUT" | "SIGNALING" | "SPECIAL_EXIT" => {
            QueryStatus::Running
        }
        "COMPLETED" | "FAILED" | "CANCELLED" | "TIMEOUT" | "NODE_FAIL" | "PREEMPTED"
        | "BOOT_FAIL" | "DEADLINE" | "OUT_OF_MEMORY" | "REVOKED" => QueryStatus::Finished,
        other => {
            warn!(state = other, "Unrecognized squeue state, assuming the job is still running");

            QueryStatus::Running
        }
    }
}

impl Scheduler for SlurmScheduler {
    #[instrument(skip(self), level = "debug")]
    fn submit(&self, script: &Path) -> Result<JobHandle, SchedulerError> {
        let submission_error = |reason: String| SchedulerError::Submission {
            script: script.to_path_buf(),
            reason,
        };

        let output = command::run(
            self.sbatch.as_os_str(),
            [OsStr::new("--parsable"), script.as_os_str()],
            self.timeout,
        )
        .map_err(|error| submission_error(error.to_string()))?;

        if !output.success() {
            return Err(submission_error(format!(
                "sbatch exited with {}: {}",
                output.status,
                output.stderr.trim()
            )));
        }

        parse_sbatch(&output.stdout)
            .ok_or_else(|| submission_error("sbatch did not print a job id".to_owned()))
    }

    #[instrument(skip(self), level = "debug")]
    fn query(&self, handle: &JobHandle) -> Result<QueryStatus, SchedulerError> {
        let output = command::run(
            self.squeue.as_os_str(),
            ["-h", "-j", handle.as_str(), "-o", "%T"],
            self.timeout,
        )
        .map_err(|error| SchedulerError::Query {
            handle: handle.clone(),
            reason: error.to_string(),
        })?;

        if !output.success() {
            // squeue rejects ids that left the controller's memory
            if output.stderr.contains("Invalid job id") {
                debug!(handle = %handle, "squeue does not know the job anymore");

                return Ok(QueryStatus::Absent);
            }

            return Err(SchedulerError::Query {
                handle: handle.clone(),
                reason: format!("squeue exited with {}: {}", output.status, output.stderr.trim()),
            });
        }

        // job arrays print one line per task, the first one is representative enough
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map_or(QueryStatus::Absent, parse_state))
    }
}
