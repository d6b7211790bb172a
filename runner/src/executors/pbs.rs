use super::{command, JobHandle, QueryStatus, Scheduler, SchedulerError};
use crate::config::SchedulerConfig;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, instrument, warn};

/// PBS/Torque via `qsub` and `qstat`
#[derive(Debug, Clone)]
pub struct PbsScheduler {
    qsub: PathBuf,
    qstat: PathBuf,
    timeout: Duration,
}

impl PbsScheduler {
    pub fn load(config: &SchedulerConfig) -> Self {
        Self {
            qsub: config
                .submit_command
                .clone()
                .unwrap_or_else(|| PathBuf::from("qsub")),
            qstat: config
                .query_command
                .clone()
                .unwrap_or_else(|| PathBuf::from("qstat")),
            timeout: config.command_timeout(),
        }
    }
}

/// Map the single letter `S` column of qstat
fn state_from_letter(letter: &str) -> Option<QueryStatus> {
    match letter {
        "Q" | "H" | "W" | "T" | "S" | "U" => Some(QueryStatus::Pending),
        "R" | "E" | "B" | "M" => Some(QueryStatus::Running),
        "C" | "F" | "X" => Some(QueryStatus::Finished),
        _ => None,
    }
}

/// id without the server suffix, qstat may truncate the suffix in its table
fn short_id(id: &str) -> &str {
    id.split('.').next().unwrap_or(id)
}

/// Find the row of `handle` in the default qstat table and read its state column
///
/// ```text
/// Job id            Name             User              Time Use S Queue
/// ----------------  ---------------- ----------------  -------- - -----
/// 1234.server       bulk_0_0_0to0_2  user              00:00:00 R workq
/// ```
pub fn parse_qstat(output: &str, handle: &JobHandle) -> QueryStatus {
    let wanted = short_id(handle.as_str());

    for line in output.lines() {
        let columns: Vec<&str> = line.split_whitespace().collect();

        // id, name, user, time, state, queue
        if columns.len() < 6 || short_id(columns[0]) != wanted {
            continue;
        }

        let letter = columns[columns.len() - 2];

        return match state_from_letter(letter) {
            Some(status) => status,
            None => {
                warn!(handle = %handle, state = letter, "Unrecognized qstat state, assuming the job is still running");

                QueryStatus::Running
            }
        };
    }

    QueryStatus::Absent
}

impl Scheduler for PbsScheduler {
    #[instrument(skip(self), level = "debug")]
    fn submit(&self, script: &Path) -> Result<JobHandle, SchedulerError> {
        let submission_error = |reason: String| SchedulerError::Submission {
            script: script.to_path_buf(),
            reason,
        };

        let output = command::run(self.qsub.as_os_str(), [script], self.timeout)
            .map_err(|error| submission_error(error.to_string()))?;

        if !output.success() {
            return Err(submission_error(format!(
                "qsub exited with {}: {}",
                output.status,
                output.stderr.trim()
            )));
        }

        match output.stdout.trim() {
            "" => Err(submission_error("qsub did not print a job id".to_owned())),
            id => Ok(JobHandle::new(id)),
        }
    }

    #[instrument(skip(self), level = "debug")]
    fn query(&self, handle: &JobHandle) -> Result<QueryStatus, SchedulerError> {
        let output = command::run(self.qstat.as_os_str(), [handle.as_str()], self.timeout)
            .map_err(|error| SchedulerError::Query {
                handle: handle.clone(),
                reason: error.to_string(),
            })?;

        if !output.success() {
            // qstat exits non-zero for ids it does not know (anymore)
            debug!(handle = %handle, stderr = output.stderr.trim(), "qstat does not list the job");

            return Ok(QueryStatus::Absent);
        }

        Ok(parse_qstat(&output.stdout, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QSTAT: &str = "Job id            Name             User              Time Use S Queue
----------------  ---------------- ----------------  -------- - -----
1234.gadi-pbs     bulk_0_0_0to0_2  ab1234            00:01:02 R express
1235.gadi-pbs     bulk_0_2_0to1_1  ab1234                   0 Q express
1236.gadi-pbs     bulk_1_1_1to0_0  ab1234            00:09:59 F express
";

    #[test]
    fn reads_state_column() {
        assert_eq!(
            parse_qstat(QSTAT, &JobHandle::new("1234.gadi-pbs")),
            QueryStatus::Running
        );
        assert_eq!(
            parse_qstat(QSTAT, &JobHandle::new("1235.gadi-pbs")),
            QueryStatus::Pending
        );
        assert_eq!(
            parse_qstat(QSTAT, &JobHandle::new("1236.gadi-pbs")),
            QueryStatus::Finished
        );
    }

    #[test]
    fn truncated_server_suffix() {
        let output = "Job id  Name  User  Time Use S Queue\n-- -- -- -- - --\n77.gadi-p*  job  me  0 C q\n";

        assert_eq!(
            parse_qstat(output, &JobHandle::new("77.gadi-pbs")),
            QueryStatus::Finished
        );
    }

    #[test]
    fn name_containing_marker_is_not_a_state() {
        // a job named like a state letter must not be mistaken for one
        let output = "Job id  Name  User  Time Use S Queue\n-- -- -- -- - --\n9.srv  C  me  0 R q\n";

        assert_eq!(
            parse_qstat(output, &JobHandle::new("9.srv")),
            QueryStatus::Running
        );
    }

    #[test]
    fn unlisted_job_is_absent() {
        assert_eq!(
            parse_qstat(QSTAT, &JobHandle::new("99.gadi-pbs")),
            QueryStatus::Absent
        );
        assert_eq!(parse_qstat("", &JobHandle::new("1")), QueryStatus::Absent);
    }

    #[test]
    fn submit_and_query_with_fake_commands() {
        let directory = tempfile::tempdir().unwrap();
        let qsub = directory.path().join("qsub");
        let qstat = directory.path().join("qstat");
        std::fs::write(&qsub, "#!/bin/sh\necho 42.server\n").unwrap();
        std::fs::write(&qstat, "#!/bin/sh\necho \"qstat: Unknown Job Id $1\" >&2\nexit 153\n")
            .unwrap();
        for path in [&qsub, &qstat] {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let scheduler = PbsScheduler::load(&SchedulerConfig {
            submit_command: Some(qsub),
            query_command: Some(qstat),
            ..SchedulerConfig::default()
        });

        let handle = scheduler.submit(Path::new("job.sh")).unwrap();
        assert_eq!(handle, JobHandle::new("42.server"));
        assert_eq!(scheduler.query(&handle).unwrap(), QueryStatus::Absent);
    }

    #[test]
    fn submission_failure() {
        let scheduler = PbsScheduler::load(&SchedulerConfig {
            submit_command: Some(PathBuf::from("false")),
            ..SchedulerConfig::default()
        });

        assert!(matches!(
            scheduler.submit(Path::new("job.sh")),
            Err(SchedulerError::Submission { .. })
        ));
    }
}
