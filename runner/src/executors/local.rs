use super::{JobHandle, QueryStatus, Scheduler, SchedulerError};
use crate::config::SchedulerConfig;
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    fs::File,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
};
use tracing::{debug, info, instrument, warn};

/// Scheduler that runs every job script as a child process of this machine
///
/// Jobs run concurrently and unconstrained, this is meant for small paths and for
/// testing job scripts before handing them to a cluster.
#[derive(Debug)]
pub struct LocalScheduler {
    shell: PathBuf,
    children: Mutex<BTreeMap<JobHandle, Child>>,
}

impl LocalScheduler {
    pub fn load(config: &SchedulerConfig) -> Self {
        Self {
            shell: config
                .submit_command
                .clone()
                .unwrap_or_else(|| PathBuf::from("sh")),
            children: Mutex::new(BTreeMap::new()),
        }
    }

    fn log_file(script: &Path, extension: &str) -> Result<File, std::io::Error> {
        File::create(script.with_extension(extension))
    }
}

impl Scheduler for LocalScheduler {
    #[instrument(skip(self), level = "debug")]
    fn submit(&self, script: &Path) -> Result<JobHandle, SchedulerError> {
        let submission_error = |reason: String| SchedulerError::Submission {
            script: script.to_path_buf(),
            reason,
        };

        let stdout = Self::log_file(script, "out").map_err(|e| submission_error(e.to_string()))?;
        let stderr = Self::log_file(script, "err").map_err(|e| submission_error(e.to_string()))?;

        let child = Command::new(&self.shell)
            .arg(script)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| submission_error(e.to_string()))?;

        let handle = JobHandle::new(format!("local-{}", child.id()));
        info!(handle = %handle, "Started local job");
        self.children.lock().insert(handle.clone(), child);

        Ok(handle)
    }

    fn query(&self, handle: &JobHandle) -> Result<QueryStatus, SchedulerError> {
        let mut children = self.children.lock();

        let Some(child) = children.get_mut(handle) else {
            return Ok(QueryStatus::Absent);
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    warn!(handle = %handle, status = ?status, "Local job exited unsuccessfully");
                }
                debug!(handle = %handle, "Local job finished");
                children.remove(handle);

                Ok(QueryStatus::Finished)
            }
            Ok(None) => Ok(QueryStatus::Running),
            Err(error) => Err(SchedulerError::Query {
                handle: handle.clone(),
                reason: error.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    #[test]
    fn runs_script_to_completion() {
        let directory = tempfile::tempdir().unwrap();
        let script = directory.path().join("job.sh");
        let marker = directory.path().join("done");
        std::fs::write(&script, format!("echo hi\ntouch '{}'\n", marker.display())).unwrap();

        let scheduler = LocalScheduler::load(&SchedulerConfig::default());
        let handle = scheduler.submit(&script).unwrap();

        let mut status = scheduler.query(&handle).unwrap();
        for _ in 0..100 {
            if status == QueryStatus::Finished {
                break;
            }
            thread::sleep(Duration::from_millis(20));
            status = scheduler.query(&handle).unwrap();
        }

        assert_eq!(status, QueryStatus::Finished);
        assert!(marker.is_file());
        assert_eq!(
            std::fs::read_to_string(directory.path().join("job.out")).unwrap(),
            "hi\n"
        );
        // a reaped job is not tracked anymore
        assert_eq!(scheduler.query(&handle).unwrap(), QueryStatus::Absent);
    }

    #[test]
    fn unknown_handle() {
        let scheduler = LocalScheduler::load(&SchedulerConfig::default());

        assert_eq!(
            scheduler.query(&JobHandle::new("local-1")).unwrap(),
            QueryStatus::Absent
        );
    }
}
