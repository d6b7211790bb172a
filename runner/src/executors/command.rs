use std::{
    ffi::OsStr,
    io::{self, Read},
    process::{Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, trace, warn};
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("Failed to wait for {program}: {source}")]
    Wait { program: String, source: io::Error },
    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

#[derive(Debug, Clone)]
/// container for the result of a finished scheduler command
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Read a child pipe to its end on a separate thread, so the child never blocks on a full pipe
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<io::Result<String>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buffer)?;
        }

        Ok(String::from_utf8_lossy(&buffer).into_owned())
    })
}

fn collect(reader: JoinHandle<io::Result<String>>) -> io::Result<String> {
    reader
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "output reader panicked"))?
}

/// Run a scheduler command to completion, killing it once `timeout` is exceeded
pub fn run<I, S>(program: &OsStr, args: I, timeout: Duration) -> Result<CommandOutput, CommandError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let name = program.to_string_lossy().into_owned();

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: name.clone(),
            source,
        })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let wait_error = |source| CommandError::Wait {
        program: name.clone(),
        source,
    };

    let status = match child.wait_timeout(timeout).map_err(wait_error)? {
        Some(status) => status,
        None => {
            // child hasn't exited yet
            if let Err(error) = child.kill() {
                warn!(program = %name, "Failed to kill timed out command: {error}");
            }
            child.wait().map_err(wait_error)?;

            // the readers finish on their own once every writer is gone
            return Err(CommandError::Timeout {
                program: name,
                timeout,
            });
        }
    };

    let stdout = collect(stdout).map_err(wait_error)?;
    let stderr = collect(stderr).map_err(wait_error)?;

    debug!(program = %name, status = ?status, "Command finished");
    trace!("Output: {stdout}");

    Ok(CommandOutput {
        status,
        stdout,
        stderr,
    })
}
