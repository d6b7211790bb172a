use crate::{config::JobConfig, template::MaterializedSegment};
use std::{
    fs, io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Segment {index} input {path} has no file name")]
    InvalidInput { index: usize, path: PathBuf },
    #[error("Failed to write job script {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Renders the batch script that computes a single segment
///
/// The script changes into the output directory, runs the solver on the segment input,
/// post-processes the raw dispersion and converts it into the per-segment table.
#[derive(Debug, Clone)]
pub struct JobScript<'a> {
    job: &'a JobConfig,
    converter: &'a Path,
    output_directory: &'a Path,
    job_directory: &'a Path,
}

impl<'a> JobScript<'a> {
    pub fn new(
        job: &'a JobConfig,
        converter: &'a Path,
        output_directory: &'a Path,
        job_directory: &'a Path,
    ) -> Self {
        Self {
            job,
            converter,
            output_directory,
            job_directory,
        }
    }

    fn stem(segment: &MaterializedSegment) -> Result<&str, ScriptError> {
        segment
            .input
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| ScriptError::InvalidInput {
                index: segment.index,
                path: segment.input.clone(),
            })
    }

    /// where the script of `segment` is written to
    pub fn path(&self, segment: &MaterializedSegment) -> Result<PathBuf, ScriptError> {
        Ok(self.job_directory.join(format!("{}.sh", Self::stem(segment)?)))
    }

    pub fn render(&self, segment: &MaterializedSegment) -> Result<String, ScriptError> {
        let stem = Self::stem(segment)?;
        let job_directory = self.job_directory.display().to_string();
        let mut script = String::from("#!/bin/bash\n");

        for line in &self.job.header {
            script.push_str(
                &line
                    .replace("{name}", stem)
                    .replace("{job_dir}", &job_directory),
            );
            script.push('\n');
        }

        script.push_str(&format!(
            "\ncd \"{}\" || exit 1\n\
             \"{}\" \"{stem}.xml\"\n\
             \"{}\" -a2 \"{stem}.nd_Ek\"\n\
             \"{}\" convert \"{stem}.nd_Ek_ascii\"\n",
            self.output_directory.display(),
            self.job.executable.display(),
            self.job.post_process.display(),
            self.converter.display(),
        ));

        Ok(script)
    }

    /// Write the executable script for `segment` into the job directory
    pub fn write(&self, segment: &MaterializedSegment) -> Result<PathBuf, ScriptError> {
        let path = self.path(segment)?;
        let content = self.render(segment)?;
        let write_error = |source| ScriptError::Write {
            path: path.clone(),
            source,
        };

        fs::write(&path, content).map_err(write_error)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).map_err(write_error)?;
        debug!(segment = segment.index, path = ?path, "Wrote job script");

        Ok(path)
    }
}
