use crate::{
    combiner::{CombineError, MergedDataset, ResultCombiner},
    config::{ConfigErrors, PipelineConfig},
    executors::Scheduler,
    job::{JobScript, ScriptError},
    manifest::{ManifestError, PathManifest},
    orchestrator::{JobOrchestrator, JobRecord, JobState, OrchestratorError},
    path::{parse_path, PathDecomposer, PathError, Segment},
    sync::CancellationToken,
    template::{MaterializedSegment, Template, TemplateError},
};
use itertools::Itertools;
use kpath_ingest::IngestError;
use std::{
    env, fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, instrument, warn};

/// binary providing the `convert` subcommand when nothing else is known
pub const DEFAULT_CONVERTER: &str = "kpath";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigErrors),
    #[error("failed to prepare directory {path}: {source}")]
    Directory { path: PathBuf, source: io::Error },
    #[error("decompose: {0}")]
    Decompose(#[from] PathError),
    #[error("materialize: {0}")]
    Materialize(#[from] TemplateError),
    #[error("manifest: {0}")]
    Manifest(#[from] ManifestError),
    #[error("script: {0}")]
    Script(#[from] ScriptError),
    #[error("orchestrate: {0}")]
    Orchestrate(#[from] OrchestratorError),
    #[error("combine: {0}")]
    Combine(#[from] CombineError),
    #[error("convert: {0}")]
    Convert(#[from] IngestError),
}

impl PipelineError {
    /// name of the stage that failed
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Directory { .. } => "prepare",
            Self::Decompose(_) => "decompose",
            Self::Materialize(_) | Self::Manifest(_) => "materialize",
            Self::Script(_) => "script",
            Self::Orchestrate(_) => "orchestrate",
            Self::Combine(_) => "combine",
            Self::Convert(_) => "convert",
        }
    }

    /// segment index the failure is attributed to, if there is one
    pub fn segment(&self) -> Option<usize> {
        match self {
            Self::Materialize(TemplateError::Write { index, .. })
            | Self::Script(ScriptError::InvalidInput { index, .. })
            | Self::Combine(CombineError::MissingSegmentOutput { index, .. })
            | Self::Combine(CombineError::MalformedSegmentOutput { index, .. })
            | Self::Combine(CombineError::Read { index, .. }) => Some(*index),
            Self::Orchestrate(OrchestratorError::SubmissionFailed { segment, .. }) => {
                Some(*segment)
            }
            _ => None,
        }
    }
}

/// Everything written before the first job is submitted
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub title: String,
    pub base: String,
    pub segments: Vec<Segment>,
    /// one entry per distinct artifact, segments visiting the same pair share it
    pub materialized: Vec<MaterializedSegment>,
    pub scripts: Vec<PathBuf>,
    pub manifest: PathBuf,
    pub output_directory: PathBuf,
}

impl PreparedRun {
    /// a fresh record for every job script
    pub fn records(&self) -> Vec<JobRecord> {
        self.materialized
            .iter()
            .zip(&self.scripts)
            .map(|(segment, script)| JobRecord::new(segment.index, script.clone()))
            .collect()
    }

    pub fn destination(&self) -> PathBuf {
        ResultCombiner::new(&self.base, &self.output_directory).default_destination(&self.title)
    }
}

fn ensure_directory(path: &Path) -> Result<PathBuf, PipelineError> {
    let directory_error = |source| PipelineError::Directory {
        path: path.to_path_buf(),
        source,
    };

    fs::create_dir_all(path).map_err(directory_error)?;
    // scripts cd into the output directory from wherever the scheduler starts them
    path.canonicalize().map_err(directory_error)
}

/// Decompose, fan out, wait, merge
#[derive(Debug, Clone)]
pub struct Pipeline<'a> {
    config: &'a PipelineConfig,
    converter: PathBuf,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        let converter = config
            .job
            .converter
            .clone()
            .or_else(|| env::current_exe().ok())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONVERTER));

        Self { config, converter }
    }

    pub fn with_converter(mut self, converter: PathBuf) -> Self {
        self.converter = converter;
        self
    }

    fn template_path(&self) -> Result<&Path, PipelineError> {
        self.config
            .paths
            .template
            .as_deref()
            .ok_or(PipelineError::Config(ConfigErrors::Invalid))
    }

    /// stem shared by every artifact of this template
    fn base(&self) -> Result<String, PipelineError> {
        let template = self.template_path()?;

        Ok(template
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .ok_or_else(|| ConfigErrors::FileNotFound(template.to_path_buf()))?)
    }

    /// Write segment inputs, `args.json` and job scripts, nothing is submitted
    #[instrument(skip(self), fields(path = %self.config.paths.path))]
    pub fn prepare(&self) -> Result<PreparedRun, PipelineError> {
        let names = parse_path(&self.config.paths.path);
        let segments = PathDecomposer::new(&self.config.symmetry_points).decompose(&names)?;

        let template = Template::load(self.template_path()?, self.config.template.clone())?;
        let title = template.title()?;

        let output_directory = ensure_directory(&self.config.paths.output)?;
        let job_directory = ensure_directory(&self.config.paths.job_directory)?;

        let distinct = segments
            .iter()
            .unique_by(|segment| segment.encoded())
            .cloned()
            .collect_vec();
        if distinct.len() < segments.len() {
            info!(
                "{} segments revisit an earlier pair of points and reuse its job",
                segments.len() - distinct.len()
            );
        }

        let materialized = template.materialize_all(&distinct, &output_directory)?;

        let manifest = PathManifest::new(title.clone(), &segments).write(&output_directory)?;

        let script = JobScript::new(
            &self.config.job,
            &self.converter,
            &output_directory,
            &job_directory,
        );
        let scripts = materialized
            .iter()
            .map(|segment| script.write(segment))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            title = %title,
            segments = segments.len(),
            jobs = scripts.len(),
            "Prepared job scripts in {job_directory:?}"
        );

        Ok(PreparedRun {
            title,
            base: template.base().to_owned(),
            segments,
            materialized,
            scripts,
            manifest,
            output_directory,
        })
    }

    /// Run the whole pipeline with `scheduler`, returns the merged dataset
    pub fn run<S: Scheduler>(
        &self,
        scheduler: S,
        cancel: CancellationToken,
    ) -> Result<MergedDataset, PipelineError> {
        let prepared = self.prepare()?;

        let mut orchestrator =
            JobOrchestrator::new(scheduler, prepared.records()).with_cancellation(cancel);
        orchestrator.submit()?;
        orchestrator.await_all(self.config.polling.interval(), self.config.polling.timeout())?;

        for record in orchestrator
            .records()
            .iter()
            .filter(|record| record.state() == JobState::Unknown)
        {
            warn!(
                segment = record.segment_index(),
                "Outcome of the job is unknown, its output may be missing"
            );
        }

        self.combine(&prepared.base, &prepared.segments, &prepared.output_directory, &prepared.title)
    }

    fn combine(
        &self,
        base: &str,
        segments: &[Segment],
        output_directory: &Path,
        title: &str,
    ) -> Result<MergedDataset, PipelineError> {
        let combiner = ResultCombiner::new(base, output_directory);

        Ok(combiner.combine(segments, &combiner.default_destination(title))?)
    }

    /// Merge the outputs of an earlier run described by the `args.json` in the output directory
    #[instrument(skip(self))]
    pub fn combine_existing(&self) -> Result<MergedDataset, PipelineError> {
        let output_directory = &self.config.paths.output;
        let manifest = PathManifest::read(output_directory)?;
        let segments = manifest.segments()?;

        self.combine(&self.base()?, &segments, output_directory, &manifest.title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names() {
        let error = PipelineError::from(PathError::PathTooShort(1));
        assert_eq!(error.stage(), "decompose");
        assert_eq!(error.segment(), None);

        let error = PipelineError::from(CombineError::MissingSegmentOutput {
            index: 3,
            path: PathBuf::from("bulk_0_0_0to0_2_0.csv"),
        });
        assert_eq!(error.stage(), "combine");
        assert_eq!(error.segment(), Some(3));
    }

    #[test]
    fn converter_from_config() {
        let mut config = PipelineConfig::default();
        config.job.converter = Some(PathBuf::from("/opt/kpath/bin/kpath"));

        assert_eq!(
            Pipeline::new(&config).converter,
            PathBuf::from("/opt/kpath/bin/kpath")
        );
    }
}
